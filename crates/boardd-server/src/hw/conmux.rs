//! Console-server (conmux-style) control backend.
//!
//! Boards racked behind a multiplexed console server are reached in two
//! hops: a registry daemon is asked where the board's console service lives
//! (`LOOKUP service=<name>`), then a TCP connection is made to that endpoint
//! and a `CONNECT` handshake attaches us to the console.  Responses are a
//! single line of space-separated `key=value` pairs with percent-encoded
//! values.
//!
//! Console bytes flow both ways over the same socket; power control rides
//! in-band as `~$` command lines.  The server side is the exclusivity
//! authority for such boards, so there is no local key sequencing — power
//! on is a hard reset request.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::rc::Rc;

use tracing::{info, warn};

use crate::hw::{BoardControl, ControlError};
use crate::reactor::Reactor;
use crate::session::sink::MessageSink;
use boardd_core::MessageType;

/// Default endpoint of the console-server registry daemon.
const REGISTRY_ADDR: &str = "127.0.0.1:63000";

pub struct ConmuxControl {
    stream: Rc<TcpStream>,
}

impl ConmuxControl {
    /// Looks the service up in the registry, attaches to its console, and
    /// registers the console-forwarding watch.
    pub fn open(
        service: &str,
        username: Option<&str>,
        reactor: &Rc<Reactor>,
        sink: &Rc<dyn MessageSink>,
    ) -> Result<Self, ControlError> {
        let (host, port) = registry_lookup(REGISTRY_ADDR, service)?;
        info!("console server for {service} at {host}:{port}");

        let stream = TcpStream::connect((host.as_str(), port)).map_err(|source| {
            ControlError::Io {
                target: format!("{host}:{port}"),
                source,
            }
        })?;

        let id = username.unwrap_or("unknown");
        let response = transact(&stream, &format!("CONNECT id=boardd:{id} to=console\n"))
            .map_err(wrap_io("console server"))?;
        expect_ok(&parse_response(&response)?)?;

        stream
            .set_nonblocking(true)
            .map_err(wrap_io("console server"))?;

        let stream = Rc::new(stream);
        let control = Self {
            stream: Rc::clone(&stream),
        };

        let sink = Rc::clone(sink);
        let reactor_handle = Rc::clone(reactor);
        reactor.add_source(stream.as_raw_fd(), move || {
            let mut buf = [0u8; 128];
            loop {
                match (&*stream).read(&mut buf) {
                    Ok(0) => {
                        // Server went away; the session cannot continue.
                        warn!("console server closed the connection");
                        reactor_handle.quit();
                        return Ok(());
                    }
                    Ok(n) => sink.send(MessageType::Console, &buf[..n])?,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(err) => return Err(err),
                }
            }
        });

        Ok(control)
    }

    fn command(&mut self, line: &str) -> Result<(), ControlError> {
        (&*self.stream)
            .write_all(line.as_bytes())
            .map_err(wrap_io("console server"))
    }
}

impl BoardControl for ConmuxControl {
    fn power(&mut self, on: bool) -> Result<(), ControlError> {
        if on {
            info!("requesting hard reset");
            self.command("~$hardreset\n")
        } else {
            info!("requesting power off");
            self.command("~$off\n")
        }
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        (&*self.stream).write_all(bytes)
    }

    fn detach(&mut self, reactor: &Reactor) {
        reactor.remove_source(self.stream.as_raw_fd());
    }
}

fn wrap_io(target: &str) -> impl FnOnce(io::Error) -> ControlError + '_ {
    move |source| ControlError::Io {
        target: target.to_string(),
        source,
    }
}

/// Sends one request line and reads one response line (the protocol is
/// strictly request/response during setup).
fn transact(mut stream: &TcpStream, request: &str) -> io::Result<String> {
    stream.write_all(request.as_bytes())?;

    let mut buf = [0u8; 256];
    let n = stream.read(&mut buf)?;
    let line = String::from_utf8_lossy(&buf[..n]);
    Ok(line.lines().next().unwrap_or_default().to_string())
}

/// Asks the registry where a console service lives.  Returns `(host, port)`.
fn registry_lookup(registry: &str, service: &str) -> Result<(String, u16), ControlError> {
    let stream = TcpStream::connect(registry).map_err(|source| ControlError::Io {
        target: registry.to_string(),
        source,
    })?;

    let response = transact(&stream, &format!("LOOKUP service={service}\n"))
        .map_err(wrap_io("registry"))?;

    let fields = parse_response(&response)?;
    expect_ok(&fields)?;

    let result = fields
        .get("result")
        .ok_or_else(|| ControlError::BadResponse("missing result field".into()))?;
    let (host, port) = result
        .split_once(':')
        .ok_or_else(|| ControlError::BadResponse(format!("result {result:?} is not host:port")))?;
    let port = port
        .parse()
        .map_err(|_| ControlError::BadResponse(format!("bad port in {result:?}")))?;

    Ok((host.to_string(), port))
}

fn expect_ok(fields: &HashMap<String, String>) -> Result<(), ControlError> {
    match fields.get("status").map(String::as_str) {
        Some("OK") => Ok(()),
        Some(other) => Err(ControlError::Rejected(other.to_string())),
        None => Err(ControlError::BadResponse("missing status field".into())),
    }
}

/// Parses a `key=value key=value ...` response line; values may contain
/// percent-encoded bytes.
fn parse_response(line: &str) -> Result<HashMap<String, String>, ControlError> {
    let mut fields = HashMap::new();

    for token in line.split_whitespace() {
        let (key, raw) = token
            .split_once('=')
            .ok_or_else(|| ControlError::BadResponse(format!("expected '=' in {token:?}")))?;
        fields.insert(key.to_string(), percent_decode(raw)?);
    }

    Ok(fields)
}

fn percent_decode(raw: &str) -> Result<String, ControlError> {
    let mut out = Vec::with_capacity(raw.len());
    let mut bytes = raw.bytes();

    while let Some(b) = bytes.next() {
        if b != b'%' {
            out.push(b);
            continue;
        }
        let hi = bytes.next().and_then(nibble);
        let lo = bytes.next().and_then(nibble);
        match (hi, lo) {
            (Some(hi), Some(lo)) => out.push((hi << 4) | lo),
            _ => {
                return Err(ControlError::BadResponse(
                    "truncated percent-encoding".into(),
                ))
            }
        }
    }

    Ok(String::from_utf8_lossy(&out).into_owned())
}

fn nibble(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'a'..=b'f' => Some(10 + ch - b'a'),
        b'A'..=b'F' => Some(10 + ch - b'A'),
        _ => None,
    }
}
