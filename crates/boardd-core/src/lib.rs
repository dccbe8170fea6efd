//! # boardd-core
//!
//! Shared library for the boardd board-control daemon containing the wire
//! protocol codec and the pure domain logic (access control, boot-stage
//! descriptors).
//!
//! This crate is used by the server daemon and by control clients.
//! It has zero dependencies on OS APIs, file descriptors, or sockets.
//!
//! # Architecture overview
//!
//! boardd arbitrates exclusive control over physically attached lab boards:
//! cycling power, driving boot-mode key sequences, streaming firmware images
//! into bootloader-mode devices, and multiplexing console I/O.  A controlling
//! client talks to the daemon through a length-framed binary protocol carried
//! over the daemon's stdin/stdout.
//!
//! This crate defines:
//!
//! - **`protocol`** – how bytes travel over the session stream.  Messages are
//!   a 3-byte header (type + little-endian payload length) followed by up to
//!   65535 payload bytes, decoded incrementally by [`protocol::FrameCodec`].
//!
//! - **`domain`** – pure business rules with no OS dependencies: the per-board
//!   access-list check and the boot-stage descriptor types.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `boardd_core::Frame` instead of `boardd_core::protocol::frame::Frame`.
pub use domain::access::access_allowed;
pub use domain::boot_stage::{BootStage, BootStageKind};
pub use protocol::codec::{encode_frame, encode_message, FrameCodec, ProtocolError};
pub use protocol::messages::{Frame, MessageType, HEADER_SIZE, MAX_PAYLOAD};
