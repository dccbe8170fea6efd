//! All boardd protocol message types.
//!
//! Every message shares the same 3-byte header: a type byte followed by a
//! little-endian `u16` payload length.  Several message types double as both
//! request and acknowledgement, distinguished by direction; others are
//! daemon-to-client notifications only (e.g. `BootPresent`).

// ── Protocol constants ────────────────────────────────────────────────────────

/// Total size of the common message header in bytes: type (1) + length (2).
pub const HEADER_SIZE: usize = 3;

/// Maximum payload carried by a single frame (the length field is a `u16`).
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

// ── Message type codes ────────────────────────────────────────────────────────

/// All message type codes understood by the daemon.
///
/// The set is closed: a received type byte outside this table is a protocol
/// violation and terminates the session (enforced by the dispatcher, not the
/// codec).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Client selects (and the daemon opens) a board by name.  The daemon
    /// acknowledges with an empty `SelectBoard` frame.
    SelectBoard = 1,
    /// Console byte passthrough, both directions.
    Console = 2,
    /// Hard reset request.  Accepted, currently a no-op.
    HardReset = 3,
    /// Start the power-on sequence.  Acknowledged with an empty frame.
    PowerOn = 4,
    /// Immediate power-off.  Acknowledged with an empty frame.
    PowerOff = 5,
    /// Daemon→client: a single byte, 1 when the boot-stage gadget appeared,
    /// 0 when it went away.
    BootPresent = 6,
    /// Chunked boot-image download.  A zero-length chunk marks end-of-image
    /// and triggers the flash; the daemon acknowledges with an empty frame.
    BootDownload = 7,
    /// Reserved.
    Boot = 8,
    /// Ask the control backend to print its status diagnostics.
    StatusUpdate = 9,
    /// Energize the board's USB supply.
    VbusOn = 10,
    /// Cut the board's USB supply.
    VbusOff = 11,
    /// Reserved.
    BootReboot = 12,
    /// Send a break condition on the console line.
    SendBreak = 13,
    /// List accessible boards: one non-empty frame per board, then an empty
    /// terminator frame.
    ListDevices = 14,
    /// Request (payload: board name) / response (payload: description text,
    /// possibly empty).
    BoardInfo = 15,
}

impl TryFrom<u8> for MessageType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            1 => Ok(MessageType::SelectBoard),
            2 => Ok(MessageType::Console),
            3 => Ok(MessageType::HardReset),
            4 => Ok(MessageType::PowerOn),
            5 => Ok(MessageType::PowerOff),
            6 => Ok(MessageType::BootPresent),
            7 => Ok(MessageType::BootDownload),
            8 => Ok(MessageType::Boot),
            9 => Ok(MessageType::StatusUpdate),
            10 => Ok(MessageType::VbusOn),
            11 => Ok(MessageType::VbusOff),
            12 => Ok(MessageType::BootReboot),
            13 => Ok(MessageType::SendBreak),
            14 => Ok(MessageType::ListDevices),
            15 => Ok(MessageType::BoardInfo),
            _ => Err(()),
        }
    }
}

// ── Frame ─────────────────────────────────────────────────────────────────────

/// One decoded protocol message: a raw type byte plus its payload.
///
/// The type byte is kept raw rather than as [`MessageType`] so that the codec
/// stays policy-free: deciding what an unrecognized type means belongs to the
/// session dispatcher (which treats it as a fatal protocol violation), not to
/// the decoding layer.  Frames are immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw message type byte as received.
    pub msg_type: u8,
    /// Payload bytes; length is bounded by [`MAX_PAYLOAD`].
    pub payload: Vec<u8>,
}

impl Frame {
    /// Builds an outbound frame.  Panics in debug builds if the payload
    /// exceeds [`MAX_PAYLOAD`]; callers chunk larger transfers.
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD);
        Self {
            msg_type: msg_type as u8,
            payload,
        }
    }

    /// Builds an empty frame, used both as a bare event/acknowledgement and
    /// as the terminator in list-style responses.
    pub fn empty(msg_type: MessageType) -> Self {
        Self::new(msg_type, Vec::new())
    }

    /// The decoded message type, or `None` for an unrecognized type byte.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::try_from(self.msg_type).ok()
    }
}
