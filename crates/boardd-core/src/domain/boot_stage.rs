//! Boot-stage descriptors.
//!
//! Bringing a board from mask ROM to a running kernel can take several
//! bootloader hand-offs, each speaking a different USB protocol.  A board's
//! configuration carries an ordered list of stages and the daemon walks them
//! one at a time: open stage *i*, accept one image, flash, close, advance to
//! stage *i+1*.

use std::fmt;

/// The closed set of boot protocols a stage can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStageKind {
    /// USB Device Firmware Upgrade: the image is pushed with `dfu-util`
    /// once a DFU-mode gadget appears at the configured USB topology path.
    Dfu,
    /// Mask-ROM USB loader: the image is handed to an external loader
    /// command once the ROM's download gadget enumerates.
    UsbLoad,
}

impl BootStageKind {
    /// The configuration-file spelling of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            BootStageKind::Dfu => "dfu",
            BootStageKind::UsbLoad => "usbload",
        }
    }
}

impl fmt::Display for BootStageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step in a board's bootloader hand-off pipeline.
///
/// Immutable after construction; stages are indexed 0..N-1 within a board and
/// the meaning of `options` depends on the kind (a USB topology path for DFU,
/// a command template for the USB loader).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootStage {
    pub kind: BootStageKind,
    pub options: String,
}

impl BootStage {
    pub fn new(kind: BootStageKind, options: impl Into<String>) -> Self {
        Self {
            kind,
            options: options.into(),
        }
    }

    /// The USB topology path this stage is pinned to, for kinds whose options
    /// carry one.  A gadget arrival only binds the stage when its kernel
    /// device path descends from this path.
    pub fn topology_path(&self) -> Option<&str> {
        match self.kind {
            BootStageKind::Dfu if !self.options.is_empty() => Some(&self.options),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_spelling_matches_config_keys() {
        assert_eq!(BootStageKind::Dfu.as_str(), "dfu");
        assert_eq!(BootStageKind::UsbLoad.as_str(), "usbload");
        assert_eq!(format!("{}", BootStageKind::Dfu), "dfu");
    }

    #[test]
    fn test_stage_preserves_options_verbatim() {
        let stage = BootStage::new(BootStageKind::UsbLoad, "usbload --run {}");
        assert_eq!(stage.kind, BootStageKind::UsbLoad);
        assert_eq!(stage.options, "usbload --run {}");
    }

    #[test]
    fn test_topology_path_only_for_port_pinned_kinds() {
        assert_eq!(
            BootStage::new(BootStageKind::Dfu, "1-1.4").topology_path(),
            Some("1-1.4")
        );
        assert_eq!(BootStage::new(BootStageKind::Dfu, "").topology_path(), None);
        // For the USB loader the options are a command template, not a port.
        assert_eq!(
            BootStage::new(BootStageKind::UsbLoad, "loader {}").topology_path(),
            None
        );
    }
}
