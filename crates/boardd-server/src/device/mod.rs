//! Board state and sequencing.
//!
//! A [`Board`] bundles a configured board's control backend, optional serial
//! console, boot pipeline, and power-on state machine.  The [`Registry`]
//! holds every configured board; selecting one opens its hardware and takes
//! the host-wide advisory lock.

mod board;
mod lifecycle;
mod lock;
mod registry;

pub use board::{Board, DeviceError};
pub use lifecycle::{power_off, power_on, LifecycleState};
pub use lock::BoardLock;
pub use registry::Registry;
