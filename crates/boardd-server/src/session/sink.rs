//! Outbound message delivery.
//!
//! Everything that produces client-bound frames (the session itself, console
//! watches, hotplug notifications) goes through [`MessageSink`] so tests can
//! capture traffic instead of writing to the process stdout.

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use crate::boot::BootEvents;
use boardd_core::{encode_message, MessageType};

pub trait MessageSink {
    fn send(&self, msg_type: MessageType, payload: &[u8]) -> io::Result<()>;
}

/// Production sink: frames go to stdout, flushed per frame so a crash never
/// strands a buffered message.
pub struct StdoutSink;

impl MessageSink for StdoutSink {
    fn send(&self, msg_type: MessageType, payload: &[u8]) -> io::Result<()> {
        let frame = encode_message(msg_type, payload)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(&frame)?;
        stdout.flush()
    }
}

/// Adapts a sink to the boot pipeline's notification interface.
pub struct BootNotifier {
    sink: Rc<dyn MessageSink>,
}

impl BootNotifier {
    pub fn new(sink: Rc<dyn MessageSink>) -> Self {
        Self { sink }
    }
}

impl BootEvents for BootNotifier {
    fn gadget_present(&self) {
        let _ = self.sink.send(MessageType::BootPresent, &[1]);
    }

    fn gadget_absent(&self) {
        let _ = self.sink.send(MessageType::BootPresent, &[0]);
    }

    fn info(&self, text: &str) {
        let _ = self.sink.send(MessageType::StatusUpdate, text.as_bytes());
    }
}

/// Test sink that records every frame it is handed.
#[derive(Default)]
pub struct RecordingSink {
    pub frames: RefCell<Vec<(MessageType, Vec<u8>)>>,
}

impl RecordingSink {
    pub fn frames_of(&self, msg_type: MessageType) -> Vec<Vec<u8>> {
        self.frames
            .borrow()
            .iter()
            .filter(|(t, _)| *t == msg_type)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

impl MessageSink for RecordingSink {
    fn send(&self, msg_type: MessageType, payload: &[u8]) -> io::Result<()> {
        self.frames.borrow_mut().push((msg_type, payload.to_vec()));
        Ok(())
    }
}
