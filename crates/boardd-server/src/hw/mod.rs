//! Hardware control backends.
//!
//! Every board is driven through the [`BoardControl`] capability trait.  The
//! concrete implementation is selected at configuration-load time and stored
//! as an owned trait object on the board: a conmux-style remote console
//! server, a local GPIO controller, or nothing at all for serial-console-only
//! boards.  A backend implements only the operations its hardware supports;
//! everything else falls through to the default no-op.

pub mod conmux;
pub mod console;
pub mod gpio;
pub mod ppps;

use std::io;

use thiserror::Error;

/// Errors from hardware control operations.
///
/// Any of these leaves the board in an unknown electrical state, so callers
/// treat them as fatal rather than retrying (partially sequenced power/key
/// timing cannot be resumed mid-sequence).
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("I/O error on {target}: {source}")]
    Io {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("console server rejected the request: {0}")]
    Rejected(String),

    #[error("malformed console server response: {0}")]
    BadResponse(String),
}

/// Which physical key a [`BoardControl::key`] call drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// The boot-mode strap (force recovery/download mode).
    Boot,
    /// The power button.
    Power,
}

/// The set of operations a backend exposes for controlling one board.
///
/// Default method bodies are deliberate: a board need not support every
/// operation, and absent operations are no-ops when invoked.
#[cfg_attr(test, mockall::automock)]
pub trait BoardControl {
    /// Energizes or cuts board power.
    fn power(&mut self, on: bool) -> Result<(), ControlError> {
        let _ = on;
        Ok(())
    }

    /// Energizes or cuts the board's USB supply.
    fn usb(&mut self, on: bool) {
        let _ = on;
    }

    /// Asserts or deasserts a physical key.
    fn key(&mut self, key: KeyKind, asserted: bool) {
        let _ = (key, asserted);
    }

    /// Console write path for backends that multiplex the console themselves
    /// (serial-console boards write through `hw::console` instead).
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let _ = bytes;
        Ok(())
    }

    /// Sends a break condition on the console line.
    fn send_break(&mut self) {}

    /// Emits backend status diagnostics to the log.
    fn print_status(&mut self) {}

    /// Releases any reactor registrations before the backend is dropped.
    fn detach(&mut self, _reactor: &crate::reactor::Reactor) {}

    /// Whether the backend drives a dedicated power button.  Decides the
    /// press/release leg of the power-on sequence.
    fn has_power_key(&self) -> bool {
        false
    }
}

/// Null backend for boards that only have a console attached.
pub struct NoControl;

impl BoardControl for NoControl {}
