//! DFU boot-stage backend.
//!
//! Matches the ST-Micro system-memory DFU gadget and drives `dfu-util`:
//! download the image to alternate setting 0, then detach so the device
//! leaves DFU mode and executes it.

use std::io::Write;
use std::process::Command;

use tempfile::NamedTempFile;

use super::{run_tool, BootBackend, BootError};

pub const DFU_VID: u16 = 0x0483;
pub const DFU_PID: u16 = 0xdf11;

pub struct DfuBackend {
    /// Bus-port path handed to `dfu-util -p`: the configured topology path
    /// when the stage pins one, otherwise the enumerated port.
    usb_path: String,
}

impl DfuBackend {
    pub fn new(usb_path: &str) -> Self {
        Self {
            usb_path: usb_path.to_string(),
        }
    }
}

impl BootBackend for DfuBackend {
    fn boot(&mut self, image: &[u8]) -> Result<(), BootError> {
        let mut staged = NamedTempFile::new().map_err(BootError::Staging)?;
        staged.write_all(image).map_err(BootError::Staging)?;
        staged.flush().map_err(BootError::Staging)?;

        run_tool(
            "dfu-util",
            Command::new("dfu-util")
                .arg("-p")
                .arg(&self.usb_path)
                .arg("-a")
                .arg("0")
                .arg("-D")
                .arg(staged.path()),
        )?;

        run_tool(
            "dfu-util",
            Command::new("dfu-util")
                .arg("-p")
                .arg(&self.usb_path)
                .arg("-e"),
        )
    }
}
