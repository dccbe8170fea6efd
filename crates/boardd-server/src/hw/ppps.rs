//! Per-port USB power switching via sysfs.
//!
//! Hubs with per-port power switching expose a `disable` attribute under the
//! port's device directory; writing `0` powers the port and `1` cuts it.
//! Boards powered this way name the port path in their configuration and
//! VBUS requests are redirected here instead of the control backend.

use std::fs;
use std::path::PathBuf;

use tracing::warn;

const SYSFS_USB_DEVICES: &str = "/sys/bus/usb/devices";

pub struct PppsPort {
    disable_attr: PathBuf,
}

impl PppsPort {
    /// `port` is the path below `/sys/bus/usb/devices`, e.g.
    /// `2-1.3:1.0/2-1-port3`.
    pub fn new(port: &str) -> Self {
        Self::new_at(PathBuf::from(SYSFS_USB_DEVICES), port)
    }

    fn new_at(base: PathBuf, port: &str) -> Self {
        Self {
            disable_attr: base.join(port).join("disable"),
        }
    }

    pub fn set_power(&self, on: bool) {
        let value = if on { "0" } else { "1" };
        if let Err(err) = fs::write(&self.disable_attr, value) {
            // Typically the attribute is root-owned; leave a breadcrumb
            // rather than tearing the session down over a power hiccup.
            warn!(
                "failed to write {}: {err} (check udev permissions)",
                self.disable_attr.display()
            );
        }
    }
}
