//! The control session.
//!
//! One daemon process serves one controlling client over its own
//! stdin/stdout.  Inbound bytes are decoded into frames and dispatched here;
//! every other component (console watches, hotplug, boot notifications)
//! answers through the shared [`sink::MessageSink`].
//!
//! The session is fail-closed: an undecodable message type is a protocol
//! breach and tears the process down, which in turn powers the board off.

pub mod sink;

use std::cell::RefCell;
use std::io::{self, Read};
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::boot::hotplug;
use crate::device::{power_off, power_on, Board, Registry};
use crate::reactor::Reactor;
use crate::session::sink::{BootNotifier, MessageSink};
use boardd_core::{Frame, FrameCodec, MessageType};

const STDIN_FD: i32 = 0;

pub struct Session {
    registry: Registry,
    username: Option<String>,
    sink: Rc<dyn MessageSink>,
    reactor: Rc<Reactor>,
    codec: FrameCodec,
    selected: Option<Rc<RefCell<Board>>>,
    /// Image bytes accumulated from download chunks, booted on the
    /// zero-length terminator.
    download: Vec<u8>,
}

impl Session {
    pub fn new(
        registry: Registry,
        username: Option<String>,
        sink: Rc<dyn MessageSink>,
        reactor: Rc<Reactor>,
    ) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            registry,
            username,
            sink,
            reactor,
            codec: FrameCodec::new(),
            selected: None,
            download: Vec::new(),
        }))
    }

    /// Registers stdin with the reactor as the session's required source.
    pub fn attach(session: &Rc<RefCell<Self>>, reactor: &Rc<Reactor>) -> io::Result<()> {
        // SAFETY: F_GETFL/F_SETFL on fd 0, which stays open for the life of
        // the process.
        unsafe {
            let flags = libc::fcntl(STDIN_FD, libc::F_GETFL);
            if flags < 0 || libc::fcntl(STDIN_FD, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        let session = Rc::clone(session);
        reactor.add_source(STDIN_FD, move || session.borrow_mut().pump_stdin());
        reactor.mark_required(STDIN_FD);
        Ok(())
    }

    fn pump_stdin(&mut self) -> io::Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            match io::stdin().read(&mut buf) {
                Ok(0) => {
                    info!("client closed the session");
                    self.reactor.quit();
                    return Ok(());
                }
                Ok(n) => self.codec.extend(&buf[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }

        while let Some(frame) = self.codec.try_decode() {
            self.handle_frame(frame)?;
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame) -> io::Result<()> {
        let Some(msg_type) = frame.message_type() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown message type {}", frame.msg_type),
            ));
        };

        match msg_type {
            MessageType::SelectBoard => self.select_board(&text_payload(&frame.payload))?,
            MessageType::Console => self.console_input(&frame.payload),
            MessageType::PowerOn => {
                if let Some(board) = &self.selected {
                    power_on(board, &self.reactor);
                }
                self.sink.send(MessageType::PowerOn, &[])?;
            }
            MessageType::PowerOff => {
                if let Some(board) = &self.selected {
                    if let Err(err) = power_off(board) {
                        warn!("power off failed: {err}");
                    }
                }
                self.sink.send(MessageType::PowerOff, &[])?;
            }
            MessageType::BootDownload => self.download_chunk(&frame.payload)?,
            MessageType::VbusOn => {
                if let Some(board) = &self.selected {
                    board.borrow_mut().usb(true);
                }
            }
            MessageType::VbusOff => {
                if let Some(board) = &self.selected {
                    board.borrow_mut().usb(false);
                }
            }
            MessageType::SendBreak => {
                if let Some(board) = &self.selected {
                    board.borrow_mut().send_break();
                }
            }
            MessageType::StatusUpdate => {
                if let Some(board) = &self.selected {
                    board.borrow_mut().print_status();
                }
            }
            MessageType::ListDevices => self.list_devices()?,
            MessageType::BoardInfo => self.board_info(&text_payload(&frame.payload))?,
            // Reset-class requests ride the power messages on this hardware;
            // acknowledge by logging so clients see a consistent surface.
            MessageType::HardReset | MessageType::Boot | MessageType::BootReboot => {
                debug!("{msg_type:?} request acknowledged, no action on this hardware");
            }
            // Server-to-client only.
            MessageType::BootPresent => {
                warn!("client sent server-only message {msg_type:?}, ignoring");
            }
        }
        Ok(())
    }

    fn select_board(&mut self, name: &str) -> io::Result<()> {
        let result = self.try_select(name);
        // The ack goes out either way; on failure the reactor winds down and
        // the client sees the stream close after the ack.
        self.sink.send(MessageType::SelectBoard, &[])?;

        if let Err(reason) = result {
            warn!("cannot select {name:?}: {reason}");
            self.reactor.quit();
        }
        Ok(())
    }

    fn try_select(&mut self, name: &str) -> Result<(), String> {
        if self.selected.is_some() {
            return Err("a board is already selected".into());
        }

        let board = self
            .registry
            .find(name)
            .ok_or_else(|| "no such board".to_string())?;
        if !board.borrow().accessible(self.username.as_deref()) {
            return Err("access denied".into());
        }

        board
            .borrow_mut()
            .open(self.username.as_deref(), &self.reactor, &self.sink)
            .map_err(|err| err.to_string())?;

        let events = Rc::new(BootNotifier::new(Rc::clone(&self.sink)));
        let watch_fd =
            hotplug::watch_board(&self.reactor, &board, events).map_err(|err| err.to_string())?;
        board.borrow_mut().attach_hotplug(watch_fd);

        info!("board {name} selected");
        self.selected = Some(board);
        Ok(())
    }

    fn console_input(&mut self, bytes: &[u8]) {
        if let Some(board) = &self.selected {
            if let Err(err) = board.borrow_mut().write(bytes) {
                warn!("console write failed: {err}");
            }
        }
    }

    fn download_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        if !chunk.is_empty() {
            self.download.extend_from_slice(chunk);
            return Ok(());
        }

        // Zero-length chunk terminates the image.
        let image = std::mem::take(&mut self.download);
        if let Some(board) = &self.selected {
            match board.borrow_mut().boot.boot_image(&image) {
                Ok(true) => {}
                Ok(false) => warn!(
                    "image terminator with no open boot stage, dropping {} bytes",
                    image.len()
                ),
                Err(err) => return Err(io::Error::other(format!("boot failed: {err}"))),
            }
        } else {
            warn!(
                "image terminator with no board selected, dropping {} bytes",
                image.len()
            );
        }

        // The download is acknowledged once the image has been dealt with.
        self.sink.send(MessageType::BootDownload, &[])
    }

    fn list_devices(&mut self) -> io::Result<()> {
        for board in self.registry.iter() {
            let board = board.borrow();
            if !board.accessible(self.username.as_deref()) {
                continue;
            }
            let line = match board.display_name() {
                Some(display) => format!("{:<20} {display}", board.name()),
                None => board.name().to_string(),
            };
            self.sink.send(MessageType::ListDevices, line.as_bytes())?;
        }
        // Empty frame terminates the listing.
        self.sink.send(MessageType::ListDevices, &[])
    }

    /// One response frame: the description if the board exists and is
    /// accessible, empty otherwise.
    fn board_info(&mut self, name: &str) -> io::Result<()> {
        let description = self
            .registry
            .find(name)
            .filter(|board| board.borrow().accessible(self.username.as_deref()))
            .map(|board| board.borrow().description().to_string())
            .unwrap_or_default();
        self.sink.send(MessageType::BoardInfo, description.as_bytes())
    }

    /// Final teardown: power the selected board off and release its
    /// hardware.  Runs on every exit path, fatal ones included.
    pub fn shutdown(&mut self, reactor: &Reactor) {
        if let Some(board) = self.selected.take() {
            info!("powering off {}", board.borrow().name());
            board.borrow_mut().close(reactor);
        }
    }
}

/// Payloads carrying names are text; tolerate trailing NULs from C clients.
fn text_payload(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload)
        .trim_end_matches('\0')
        .to_string()
}
