//! One configured board and its open hardware.

use std::io;
use std::os::fd::RawFd;
use std::path::Path;
use std::rc::Rc;

use thiserror::Error;
use tracing::warn;

use crate::boot::BootPipeline;
use crate::config::BoardConfig;
use crate::device::{BoardLock, LifecycleState};
use crate::hw::conmux::ConmuxControl;
use crate::hw::console::Console;
use crate::hw::gpio::GpioControl;
use crate::hw::ppps::PppsPort;
use crate::hw::{BoardControl, ControlError, KeyKind, NoControl};
use crate::reactor::Reactor;
use crate::session::sink::MessageSink;
use boardd_core::access_allowed;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to lock board {name}: {source}")]
    Lock {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to open console {path}: {source}")]
    Console {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Control(#[from] ControlError),
}

pub struct Board {
    config: BoardConfig,
    control: Box<dyn BoardControl>,
    console: Option<Console>,
    ppps: Option<PppsPort>,
    pub boot: BootPipeline,
    pub state: LifecycleState,
    /// Bumped on every power-on and power-off so stale sequencing timers
    /// from an aborted power-on recognize themselves and do nothing.
    pub(crate) epoch: u64,
    lock: Option<BoardLock>,
    hotplug_fd: Option<RawFd>,
}

impl Board {
    pub fn new(config: BoardConfig) -> Self {
        let ppps = config.ppps_path.as_deref().map(PppsPort::new);
        let stages = config.boot_stages.iter().map(|s| s.to_stage()).collect();

        Self {
            config,
            control: Box::new(NoControl),
            console: None,
            ppps,
            boot: BootPipeline::new(stages),
            state: LifecycleState::Idle,
            epoch: 0,
            lock: None,
            hotplug_fd: None,
        }
    }

    /// Records the uevent watch registered for this board, so `close` can
    /// unregister it.
    pub fn attach_hotplug(&mut self, fd: RawFd) {
        self.hotplug_fd = Some(fd);
    }

    #[cfg(test)]
    pub(crate) fn set_control(&mut self, control: Box<dyn BoardControl>) {
        self.control = control;
    }

    pub fn name(&self) -> &str {
        &self.config.board
    }

    /// Human-readable label, if the configuration gives one.
    pub fn display_name(&self) -> Option<&str> {
        self.config.name.as_deref()
    }

    /// Label for log lines; falls back to the identifier.
    pub fn label(&self) -> &str {
        self.display_name().unwrap_or(&self.config.board)
    }

    pub fn description(&self) -> &str {
        self.config.description.as_deref().unwrap_or_default()
    }

    pub fn accessible(&self, username: Option<&str>) -> bool {
        access_allowed(self.config.users.as_deref(), username)
    }

    pub fn boot_key_timeout(&self) -> Option<std::time::Duration> {
        self.config.boot_key_timeout()
    }

    pub fn usb_always_on(&self) -> bool {
        self.config.usb_always_on
    }

    /// Takes the board lock and opens its control backend and console.
    pub fn open(
        &mut self,
        username: Option<&str>,
        reactor: &Rc<Reactor>,
        sink: &Rc<dyn MessageSink>,
    ) -> Result<(), DeviceError> {
        let lock = BoardLock::acquire(self.name()).map_err(|source| DeviceError::Lock {
            name: self.name().to_string(),
            source,
        })?;

        let control: Box<dyn BoardControl> = if let Some(gpio) = &self.config.gpio {
            Box::new(GpioControl::open(gpio, self.config.usb_always_on)?)
        } else if let Some(service) = &self.config.conmux {
            Box::new(ConmuxControl::open(service, username, reactor, sink)?)
        } else {
            Box::new(NoControl)
        };

        let console = match &self.config.console {
            Some(path) => Some(Console::open(Path::new(path), reactor, sink).map_err(
                |source| DeviceError::Console {
                    path: path.clone(),
                    source,
                },
            )?),
            None => None,
        };

        self.lock = Some(lock);
        self.control = control;
        self.console = console;
        self.state = LifecycleState::Idle;
        Ok(())
    }

    /// Powers the board down and releases everything `open` acquired.
    /// Safe to call on a board that was never opened.
    pub fn close(&mut self, reactor: &Reactor) {
        if let Err(err) = self.control.power(false) {
            warn!("failed to power off {}: {err}", self.name());
        }
        if !self.config.usb_always_on {
            self.usb(false);
        }

        if let Some(console) = self.console.take() {
            console.close(reactor);
        }
        self.control.detach(reactor);
        self.control = Box::new(NoControl);

        // Removing the watch drops its callback, which owns the socket.
        if let Some(fd) = self.hotplug_fd.take() {
            reactor.remove_source(fd);
        }
        self.boot.reset();
        self.state = LifecycleState::Idle;
        self.lock = None;
    }

    pub fn power(&mut self, on: bool) -> Result<(), ControlError> {
        self.control.power(on)
    }

    pub fn usb(&mut self, on: bool) {
        match &self.ppps {
            Some(port) => port.set_power(on),
            None => self.control.usb(on),
        }
    }

    pub fn key(&mut self, key: KeyKind, asserted: bool) {
        self.control.key(key, asserted);
    }

    pub fn has_power_key(&self) -> bool {
        self.control.has_power_key()
    }

    /// Console input from the client; falls back to the control backend for
    /// boards whose console rides the control channel.
    pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        match &self.console {
            Some(console) => console.write(bytes),
            None => self.control.write(bytes),
        }
    }

    pub fn send_break(&mut self) {
        match &self.console {
            Some(console) => console.send_break(),
            None => self.control.send_break(),
        }
    }

    pub fn print_status(&mut self) {
        self.control.print_status();
    }
}
