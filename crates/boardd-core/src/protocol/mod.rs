//! Protocol module containing message types and the stream frame codec.

pub mod codec;
pub mod messages;

pub use codec::{encode_frame, FrameCodec, ProtocolError};
pub use messages::{Frame, MessageType, HEADER_SIZE, MAX_PAYLOAD};
