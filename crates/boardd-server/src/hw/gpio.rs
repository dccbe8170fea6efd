//! Local GPIO control backend.
//!
//! Drives board power, the boot-mode key, the power key, and a USB
//! disconnect line through the kernel's sysfs GPIO interface.  Each line is
//! exported on open, set to output, and given its configured active level, so
//! the daemon only ever writes logical values.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::config::{GpioConfig, GpioLine};
use crate::hw::{BoardControl, ControlError, KeyKind};

const SYSFS_GPIO: &str = "/sys/class/gpio";

/// How long freshly-exported lines get to settle before the first
/// sequencing request.
const SETTLE_DELAY: Duration = Duration::from_millis(500);

pub struct GpioControl {
    base: PathBuf,
    power: Option<GpioLine>,
    boot_key: Option<GpioLine>,
    power_key: Option<GpioLine>,
    usb_disconnect: Option<GpioLine>,
}

impl GpioControl {
    /// Exports and configures every declared line, then drives the board to
    /// a known idle state: power off, USB per `usb_always_on`.
    pub fn open(config: &GpioConfig, usb_always_on: bool) -> Result<Self, ControlError> {
        Self::open_at(Path::new(SYSFS_GPIO), config, usb_always_on, SETTLE_DELAY)
    }

    pub(crate) fn open_at(
        base: &Path,
        config: &GpioConfig,
        usb_always_on: bool,
        settle: Duration,
    ) -> Result<Self, ControlError> {
        let mut control = Self {
            base: base.to_path_buf(),
            power: config.power.clone(),
            boot_key: config.boot_key.clone(),
            power_key: config.power_key.clone(),
            usb_disconnect: config.usb_disconnect.clone(),
        };

        for line in [
            &control.power,
            &control.boot_key,
            &control.power_key,
            &control.usb_disconnect,
        ]
        .into_iter()
        .flatten()
        {
            control.setup_line(line)?;
        }

        control.power(false)?;
        control.usb(usb_always_on);

        if !settle.is_zero() {
            thread::sleep(settle);
        }

        Ok(control)
    }

    fn line_dir(&self, line: &GpioLine) -> PathBuf {
        self.base.join(format!("gpio{}", line.line))
    }

    fn setup_line(&self, line: &GpioLine) -> Result<(), ControlError> {
        let dir = self.line_dir(line);
        if !dir.exists() {
            self.attr_write(&self.base.join("export"), &line.line.to_string())?;
        }
        self.attr_write(&dir.join("direction"), "out")?;
        self.attr_write(
            &dir.join("active_low"),
            if line.active_low { "1" } else { "0" },
        )?;
        Ok(())
    }

    fn attr_write(&self, path: &Path, value: &str) -> Result<(), ControlError> {
        match fs::write(path, value) {
            Ok(()) => Ok(()),
            // Exporting an already-exported line reports EBUSY.
            Err(err) if err.raw_os_error() == Some(libc::EBUSY) => Ok(()),
            Err(source) => Err(ControlError::Io {
                target: path.display().to_string(),
                source,
            }),
        }
    }

    /// Sets the logical value of a line; a missing line is a no-op.
    fn set(&self, line: &Option<GpioLine>, on: bool) -> Result<(), ControlError> {
        let Some(line) = line else {
            return Ok(());
        };
        self.attr_write(
            &self.line_dir(line).join("value"),
            if on { "1" } else { "0" },
        )
    }
}

impl BoardControl for GpioControl {
    fn power(&mut self, on: bool) -> Result<(), ControlError> {
        self.set(&self.power, on)
    }

    fn usb(&mut self, on: bool) {
        // USB_DISCONNECT asserted means "host sees nothing", so the logical
        // sense is inverted relative to "vbus on".
        if let Err(err) = self.set(&self.usb_disconnect, !on) {
            warn!("usb disconnect line: {err}");
        }
    }

    fn key(&mut self, key: KeyKind, asserted: bool) {
        let line = match key {
            KeyKind::Boot => self.boot_key.clone(),
            KeyKind::Power => self.power_key.clone(),
        };
        if let Err(err) = self.set(&line, asserted) {
            warn!("gpio key {key:?}: {err}");
        }
    }

    fn has_power_key(&self) -> bool {
        self.power_key.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_sysfs(lines: &[u32]) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("export"), "").unwrap();
        for n in lines {
            let line_dir = dir.path().join(format!("gpio{n}"));
            fs::create_dir(&line_dir).unwrap();
            fs::write(line_dir.join("direction"), "").unwrap();
            fs::write(line_dir.join("active_low"), "").unwrap();
            fs::write(line_dir.join("value"), "").unwrap();
        }
        dir
    }

    fn value(dir: &TempDir, line: u32) -> String {
        fs::read_to_string(dir.path().join(format!("gpio{line}/value"))).unwrap()
    }

    fn config() -> GpioConfig {
        GpioConfig {
            power: Some(GpioLine {
                line: 4,
                active_low: true,
            }),
            boot_key: Some(GpioLine {
                line: 5,
                active_low: false,
            }),
            power_key: Some(GpioLine {
                line: 6,
                active_low: false,
            }),
            usb_disconnect: Some(GpioLine {
                line: 7,
                active_low: true,
            }),
        }
    }

    #[test]
    fn test_open_drives_lines_to_idle_state() {
        let sysfs = fake_sysfs(&[4, 5, 6, 7]);
        let control = GpioControl::open_at(sysfs.path(), &config(), false, Duration::ZERO).unwrap();

        assert_eq!(value(&sysfs, 4), "0", "power must start off");
        assert_eq!(value(&sysfs, 7), "1", "usb off = disconnect asserted");
        assert!(control.has_power_key());
    }

    #[test]
    fn test_key_writes_logical_values() {
        let sysfs = fake_sysfs(&[4, 5, 6, 7]);
        let mut control = GpioControl::open_at(sysfs.path(), &config(), true, Duration::ZERO).unwrap();

        control.key(KeyKind::Boot, true);
        assert_eq!(value(&sysfs, 5), "1");
        control.key(KeyKind::Boot, false);
        assert_eq!(value(&sysfs, 5), "0");
        control.key(KeyKind::Power, true);
        assert_eq!(value(&sysfs, 6), "1");
    }

    #[test]
    fn test_missing_lines_are_no_ops() {
        let sysfs = fake_sysfs(&[4]);
        let sparse = GpioConfig {
            power: Some(GpioLine {
                line: 4,
                active_low: false,
            }),
            boot_key: None,
            power_key: None,
            usb_disconnect: None,
        };
        let mut control = GpioControl::open_at(sysfs.path(), &sparse, false, Duration::ZERO).unwrap();

        control.key(KeyKind::Boot, true); // no line, must not error
        control.usb(true);
        assert!(!control.has_power_key());
        control.power(true).unwrap();
        assert_eq!(value(&sysfs, 4), "1");
    }

    #[test]
    fn test_zero_settle_opens_without_stalling() {
        let sysfs = fake_sysfs(&[4, 5, 6, 7]);
        let started = std::time::Instant::now();
        GpioControl::open_at(sysfs.path(), &config(), false, Duration::ZERO).unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn test_active_low_is_delegated_to_sysfs() {
        let sysfs = fake_sysfs(&[4, 5, 6, 7]);
        let _control = GpioControl::open_at(sysfs.path(), &config(), false, Duration::ZERO).unwrap();

        let active_low =
            fs::read_to_string(sysfs.path().join("gpio4/active_low")).unwrap();
        assert_eq!(active_low, "1");
    }
}
