//! Serial console attached directly to a board.
//!
//! The tty is opened exclusively, switched to raw 115200 8N1, and its read
//! side is registered as a reactor source.  Everything the board prints is
//! forwarded to the client as `Console` frames; client `Console` frames are
//! written straight back to the tty.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::rc::Rc;

use nix::sys::termios::{
    cfsetspeed, tcflush, tcgetattr, tcsendbreak, tcsetattr, BaudRate, ControlFlags, FlushArg,
    InputFlags, LocalFlags, OutputFlags, SetArg,
};
use tracing::warn;

use crate::reactor::Reactor;
use crate::session::sink::MessageSink;
use boardd_core::MessageType;

/// An open board console.
///
/// Cloneable handle semantics come from the shared `File`: the reactor read
/// callback holds one clone, the board's write path the other.
pub struct Console {
    file: Rc<File>,
}

impl Console {
    /// Opens and configures the tty, and registers the forwarding watch.
    pub fn open(
        path: &Path,
        reactor: &Rc<Reactor>,
        sink: &Rc<dyn MessageSink>,
    ) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_EXCL | libc::O_NONBLOCK)
            .open(path)?;

        configure_raw(&file).map_err(|errno| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("tty setup for {} failed: {errno}", path.display()),
            )
        })?;

        let file = Rc::new(file);
        let console = Self {
            file: Rc::clone(&file),
        };

        let sink = Rc::clone(sink);
        reactor.add_source(file.as_raw_fd(), move || {
            let mut buf = [0u8; 128];
            loop {
                match (&*file).read(&mut buf) {
                    Ok(0) => return Ok(()),
                    Ok(n) => {
                        sink.send(MessageType::Console, &buf[..n])?;
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(err) => return Err(err),
                }
            }
        });

        Ok(console)
    }

    pub fn write(&self, bytes: &[u8]) -> io::Result<()> {
        (&*self.file).write_all(bytes)
    }

    pub fn send_break(&self) {
        if let Err(errno) = tcsendbreak(&*self.file, 0) {
            warn!("failed to send break: {errno}");
        }
    }

    /// Unregisters the forwarding watch.  Must run before the console is
    /// dropped, since the reactor must never poll a closed fd.
    pub fn close(&self, reactor: &Reactor) {
        reactor.remove_source(self.file.as_raw_fd());
    }
}

/// Raw 115200 8N1, parity errors ignored, input queue flushed.
fn configure_raw(file: &File) -> nix::Result<()> {
    let mut tios = tcgetattr(file)?;

    tios.control_flags = ControlFlags::CS8 | ControlFlags::CLOCAL | ControlFlags::CREAD;
    tios.input_flags = InputFlags::IGNPAR;
    tios.output_flags = OutputFlags::empty();
    tios.local_flags = LocalFlags::empty();
    cfsetspeed(&mut tios, BaudRate::B115200)?;

    tcflush(file, FlushArg::TCIFLUSH)?;
    tcsetattr(file, SetArg::TCSANOW, &tios)?;

    Ok(())
}
