//! Mask-ROM USB loader boot-stage backend.
//!
//! Matches the Amlogic mask-ROM gadget and runs a user-supplied loader
//! command from the stage options, substituting `{}` with the path of the
//! staged image.  The command is run through the shell so options can carry
//! flags and pipelines.

use std::io::Write;
use std::process::Command;

use tempfile::NamedTempFile;

use super::{run_tool, BootBackend, BootError};

pub const USBLOAD_VID: u16 = 0x1b8e;
pub const USBLOAD_PID: u16 = 0xc003;

pub struct UsbLoadBackend {
    /// Loader command template, e.g. `boot-g12.py {}`.
    template: String,
}

impl UsbLoadBackend {
    pub fn new(template: &str) -> Self {
        Self {
            template: template.to_string(),
        }
    }
}

impl BootBackend for UsbLoadBackend {
    fn boot(&mut self, image: &[u8]) -> Result<(), BootError> {
        let mut staged = NamedTempFile::new().map_err(BootError::Staging)?;
        staged.write_all(image).map_err(BootError::Staging)?;
        staged.flush().map_err(BootError::Staging)?;

        let command = if self.template.contains("{}") {
            self.template
                .replace("{}", &staged.path().display().to_string())
        } else {
            format!("{} {}", self.template, staged.path().display())
        };

        run_tool("usbload", Command::new("sh").arg("-c").arg(&command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_substitution_runs_loader() {
        let dir = tempfile::tempdir().unwrap();
        let copy = dir.path().join("copy.img");

        let mut backend = UsbLoadBackend::new(&format!("cp {{}} {}", copy.display()));
        backend.boot(b"loader-image").unwrap();

        assert_eq!(std::fs::read(&copy).unwrap(), b"loader-image");
    }

    #[test]
    fn test_failing_loader_reports_stderr() {
        let mut backend = UsbLoadBackend::new("ls /definitely/not/here/{}");
        let err = backend.boot(b"x").unwrap_err();
        match err {
            BootError::ToolFailed { stderr, .. } => assert!(!stderr.is_empty()),
            other => panic!("unexpected error: {other}"),
        }
    }
}
