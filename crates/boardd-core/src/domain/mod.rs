//! Pure domain logic: no OS calls, no file descriptors, no sockets.
//!
//! - **`access`** – per-board access-list evaluation.
//! - **`boot_stage`** – boot-stage descriptors for multi-step bootloader
//!   hand-offs (e.g. mask-ROM loader → second-stage loader).

pub mod access;
pub mod boot_stage;
