//! Firmware boot pipeline.
//!
//! Boards that boot over USB expose a recovery gadget (DFU, or an SoC
//! mask-ROM loader) when powered with the boot key held.  The pipeline walks
//! the board's configured stage chain: when the gadget for the current stage
//! enumerates, a backend is opened against it; the client streams an image,
//! the backend hands it to the stage's flashing tool, and the chain advances
//! to the next stage (whose gadget is typically exposed by the image that was
//! just loaded).
//!
//! Backends are created through an injectable factory so the pipeline logic
//! is testable without hardware.

pub mod dfu;
pub mod hotplug;
pub mod usbload;

use std::process::Command;
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, info};

use boardd_core::{BootStage, BootStageKind};

#[derive(Debug, Error)]
pub enum BootError {
    #[error("failed to stage image on disk: {0}")]
    Staging(#[source] std::io::Error),

    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} failed ({status}): {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },
}

/// Client-bound notifications emitted by the pipeline and the hotplug watch.
pub trait BootEvents {
    fn gadget_present(&self);
    fn gadget_absent(&self);
    fn info(&self, text: &str);
}

/// One open boot stage, bound to an enumerated USB gadget.
pub trait BootBackend {
    /// Hands a complete image to the stage's flashing tool.
    fn boot(&mut self, image: &[u8]) -> Result<(), BootError>;

    fn close(&mut self) {}
}

pub type BackendFactory = dyn Fn(&BootStage, &str) -> Box<dyn BootBackend>;

/// USB IDs of the recovery gadget a stage kind waits for.
pub fn gadget_ids(kind: BootStageKind) -> (u16, u16) {
    match kind {
        BootStageKind::Dfu => (dfu::DFU_VID, dfu::DFU_PID),
        BootStageKind::UsbLoad => (usbload::USBLOAD_VID, usbload::USBLOAD_PID),
    }
}

fn default_backend(stage: &BootStage, bus_port: &str) -> Box<dyn BootBackend> {
    match stage.kind {
        // dfu-util is pointed at the configured topology path when one is
        // given, since that is the port the board is known to be wired to.
        BootStageKind::Dfu => {
            Box::new(dfu::DfuBackend::new(stage.topology_path().unwrap_or(bus_port)))
        }
        BootStageKind::UsbLoad => Box::new(usbload::UsbLoadBackend::new(&stage.options)),
    }
}

/// Last component of a kernel device path, i.e. the `1-1.4.2` bus-port name.
fn bus_port(devpath: &str) -> &str {
    devpath.rsplit('/').next().unwrap_or(devpath)
}

pub struct BootPipeline {
    stages: Vec<BootStage>,
    index: usize,
    backend: Option<Box<dyn BootBackend>>,
    /// Kernel device path of the gadget the open stage is bound to.  Cleared
    /// when the gadget's removal is observed, so a later forced close knows
    /// the absence notification already went out.
    bound: Option<String>,
    events: Option<Rc<dyn BootEvents>>,
}

impl BootPipeline {
    pub fn new(stages: Vec<BootStage>) -> Self {
        Self {
            stages,
            index: 0,
            backend: None,
            bound: None,
            events: None,
        }
    }

    pub fn current_stage(&self) -> Option<&BootStage> {
        self.stages.get(self.index)
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_some()
    }

    /// USB IDs the hotplug watch should match against, if a stage is still
    /// pending and not already bound to a gadget.
    pub fn expected_gadget(&self) -> Option<(u16, u16)> {
        if self.backend.is_some() {
            return None;
        }
        self.current_stage().map(|stage| gadget_ids(stage.kind))
    }

    /// Whether an arrival at `devpath` binds the pending stage: the ids must
    /// match the stage's gadget and, for stages pinned to a USB port, the
    /// kernel path must descend from the configured topology path.
    pub fn matches_arrival(&self, ids: Option<(u16, u16)>, devpath: &str) -> bool {
        if ids.is_none() || self.expected_gadget() != ids {
            return false;
        }
        match self.current_stage().and_then(BootStage::topology_path) {
            Some(topology) => devpath.contains(topology),
            None => true,
        }
    }

    /// Binds the current stage to the gadget at `devpath`.
    pub fn open_stage(&mut self, devpath: &str, events: &Rc<dyn BootEvents>) {
        self.open_stage_with(&default_backend, devpath, events);
    }

    pub fn open_stage_with(
        &mut self,
        factory: &BackendFactory,
        devpath: &str,
        events: &Rc<dyn BootEvents>,
    ) {
        let Some(stage) = self.stages.get(self.index) else {
            debug!("gadget at {devpath} with no stage pending, ignoring");
            return;
        };

        let port = bus_port(devpath);
        info!("{} gadget at {port}, stage {} open", stage.kind, self.index);
        self.backend = Some(factory(stage, port));
        self.bound = Some(devpath.to_string());
        self.events = Some(Rc::clone(events));
        events.gadget_present();
    }

    /// Reacts to a gadget removal.  Only the bound path counts, and only its
    /// first removal; the backend, if still open, goes with the hardware.
    pub fn on_gadget_removed(&mut self, devpath: &str) {
        if self.bound.as_deref() != Some(devpath) {
            return;
        }
        self.bound = None;
        if let Some(mut backend) = self.backend.take() {
            backend.close();
        }
        if let Some(events) = &self.events {
            events.gadget_absent();
        }
    }

    /// Boots a complete image through the open stage and advances the chain.
    /// Returns `false` if no stage is open (the image has nowhere to go).
    pub fn boot_image(&mut self, image: &[u8]) -> Result<bool, BootError> {
        let Some(backend) = self.backend.as_mut() else {
            return Ok(false);
        };

        info!("booting {} byte image through stage {}", image.len(), self.index);
        let result = backend.boot(image);
        self.close_backend();
        result?;

        self.index += 1;
        Ok(true)
    }

    /// Rewinds to the first stage, closing any open backend.  Called when
    /// the board is powered off so the next power-on starts a fresh chain.
    pub fn reset(&mut self) {
        self.close_backend();
        self.index = 0;
    }

    /// Closes the open backend.  If the gadget's removal was not already
    /// observed, the absence notification fires from here, so the client sees
    /// it exactly once whether the close was organic or forced.
    fn close_backend(&mut self) {
        let Some(mut backend) = self.backend.take() else {
            return;
        };
        backend.close();
        if self.bound.take().is_some() {
            if let Some(events) = &self.events {
                events.gadget_absent();
            }
        }
    }
}

/// Runs a flashing tool to completion, capturing its output so a chatty
/// child never bleeds into the protocol stream on stdout.
fn run_tool(tool: &str, command: &mut Command) -> Result<(), BootError> {
    debug!("running {command:?}");

    let output = command.output().map_err(|source| BootError::Spawn {
        tool: tool.to_string(),
        source,
    })?;

    if !output.status.success() {
        return Err(BootError::ToolFailed {
            tool: tool.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(())
}
