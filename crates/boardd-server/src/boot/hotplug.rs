//! USB gadget hotplug detection.
//!
//! Recovery gadgets come and go as boards are power-cycled, so the daemon
//! listens on a kernel uevent netlink socket and parses `add`/`remove`
//! events for usb devices.  Devices already enumerated before the daemon
//! started are picked up by a one-shot sysfs scan.

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::rc::Rc;

use nix::sys::socket::{bind, socket, AddressFamily, NetlinkAddr, SockFlag, SockProtocol, SockType};
use tracing::{debug, warn};

use crate::boot::BootEvents;
use crate::device::Board;
use crate::reactor::Reactor;
use boardd_core::BootStage;

const SYSFS_USB_DEVICES: &str = "/sys/bus/usb/devices";

/// Kernel multicast group for uevents.
const UEVENT_GROUP: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UeventAction {
    Add,
    Remove,
}

/// A usb-device uevent reduced to what the boot pipeline cares about.
#[derive(Debug, PartialEq, Eq)]
pub struct Uevent {
    pub action: UeventAction,
    /// Full kernel device path, e.g. `/devices/.../usb1/1-1/1-1.4`.  Kept
    /// whole so arrivals can be matched against a configured topology path
    /// and removals against the exact bound device.
    pub devpath: String,
    /// Vendor and product id from the `PRODUCT=` field, when present.
    pub ids: Option<(u16, u16)>,
}

/// Parses one raw uevent datagram.  Returns `None` for anything that is not
/// a usb-device add/remove (including libudev-forwarded packets).
pub fn parse_uevent(datagram: &[u8]) -> Option<Uevent> {
    let mut fields = datagram.split(|&b| b == 0).map(String::from_utf8_lossy);

    // Kernel events start with "action@devpath"; anything else is a
    // userspace re-broadcast with its own header.
    let header = fields.next()?;
    let (action, _) = header.split_once('@')?;
    let action = match action {
        "add" => UeventAction::Add,
        "remove" => UeventAction::Remove,
        _ => return None,
    };

    let mut devpath = None;
    let mut devtype = None;
    let mut subsystem = None;
    let mut product = None;

    for field in fields {
        if let Some((key, value)) = field.split_once('=') {
            match key {
                "DEVPATH" => devpath = Some(value.to_string()),
                "DEVTYPE" => devtype = Some(value.to_string()),
                "SUBSYSTEM" => subsystem = Some(value.to_string()),
                "PRODUCT" => product = Some(value.to_string()),
                _ => {}
            }
        }
    }

    if subsystem.as_deref() != Some("usb") || devtype.as_deref() != Some("usb_device") {
        return None;
    }

    let devpath = devpath?;
    let ids = product.as_deref().and_then(parse_product);

    Some(Uevent {
        action,
        devpath,
        ids,
    })
}

/// `PRODUCT=vid/pid/bcd` with unpadded lowercase hex.
fn parse_product(product: &str) -> Option<(u16, u16)> {
    let mut parts = product.split('/');
    let vid = u16::from_str_radix(parts.next()?, 16).ok()?;
    let pid = u16::from_str_radix(parts.next()?, 16).ok()?;
    Some((vid, pid))
}

/// Scans sysfs for an already-enumerated device with the given ids, under
/// the given topology path if one is set, and returns its kernel device
/// path (the same form uevents carry, so removals match later).
pub fn scan_sysfs(base: &Path, vid: u16, pid: u16, topology: Option<&str>) -> Option<String> {
    let entries = std::fs::read_dir(base).ok()?;

    for entry in entries.flatten() {
        let read_id = |name: &str| -> Option<u16> {
            let text = std::fs::read_to_string(entry.path().join(name)).ok()?;
            u16::from_str_radix(text.trim(), 16).ok()
        };

        if read_id("idVendor") != Some(vid) || read_id("idProduct") != Some(pid) {
            continue;
        }

        // Entries are symlinks into /sys/devices; resolving one yields the
        // kernel device path with the /sys prefix in front.
        let Ok(resolved) = std::fs::canonicalize(entry.path()) else {
            continue;
        };
        let resolved = resolved.to_string_lossy().into_owned();
        let devpath = resolved.strip_prefix("/sys").unwrap_or(&resolved);

        if topology.is_some_and(|t| !devpath.contains(t)) {
            continue;
        }
        return Some(devpath.to_string());
    }

    None
}

/// Connects the selected board's boot pipeline to gadget arrival and
/// departure.  Devices already present are bound immediately.  Returns the
/// watch's fd so the board can unregister it on close.
pub fn watch_board(
    reactor: &Rc<Reactor>,
    board: &Rc<RefCell<Board>>,
    events: Rc<dyn BootEvents>,
) -> io::Result<RawFd> {
    let fd = socket(
        AddressFamily::Netlink,
        SockType::Datagram,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        SockProtocol::NetlinkKObjectUEvent,
    )
    .map_err(io::Error::from)?;
    bind(fd.as_raw_fd(), &NetlinkAddr::new(0, UEVENT_GROUP)).map_err(io::Error::from)?;

    let mut file = File::from(fd);
    let raw_fd = file.as_raw_fd();

    // Catch gadgets that enumerated before we started listening.
    {
        let mut board = board.borrow_mut();
        if let Some((vid, pid)) = board.boot.expected_gadget() {
            let topology = board
                .boot
                .current_stage()
                .and_then(BootStage::topology_path)
                .map(str::to_string);
            if let Some(devpath) =
                scan_sysfs(Path::new(SYSFS_USB_DEVICES), vid, pid, topology.as_deref())
            {
                debug!("gadget {vid:04x}:{pid:04x} already present at {devpath}");
                board.boot.open_stage(&devpath, &events);
            }
        }
    }

    let board = Rc::clone(board);
    reactor.add_source(raw_fd, move || {
        let mut buf = [0u8; 8192];
        loop {
            // One datagram per read on a netlink socket.
            let n = match file.read(&mut buf) {
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => {
                    warn!("uevent socket read failed: {err}");
                    return Err(err);
                }
            };

            let Some(event) = parse_uevent(&buf[..n]) else {
                continue;
            };

            let mut board = board.borrow_mut();
            match event.action {
                UeventAction::Add => {
                    if board.boot.matches_arrival(event.ids, &event.devpath) {
                        board.boot.open_stage(&event.devpath, &events);
                    }
                }
                UeventAction::Remove => board.boot.on_gadget_removed(&event.devpath),
            }
        }
    });

    Ok(raw_fd)
}
