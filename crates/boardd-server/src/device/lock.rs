//! Host-wide board exclusivity.
//!
//! Several daemon instances may run on one host (one per client connection),
//! so board exclusivity is an advisory `flock` on a per-board file under
//! `/tmp`.  The lock is released when the guard drops, including on crash,
//! since flocks die with the process.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::warn;

pub struct BoardLock {
    _flock: Flock<File>,
}

impl BoardLock {
    pub fn acquire(board_name: &str) -> io::Result<Self> {
        Self::acquire_at(Path::new("/tmp"), board_name)
    }

    fn acquire_at(dir: &Path, board_name: &str) -> io::Result<Self> {
        let path = dir.join(format!("boardd-{board_name}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        let flock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => flock,
            Err((file, Errno::EWOULDBLOCK)) => {
                warn!("board is in use, waiting...");
                Flock::lock(file, FlockArg::LockExclusive)
                    .map_err(|(_, errno)| io::Error::from(errno))?
            }
            Err((_, errno)) => return Err(errno.into()),
        };

        Ok(Self { _flock: flock })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let guard = BoardLock::acquire_at(dir.path(), "db410c-01").unwrap();

        let contender = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.path().join("boardd-db410c-01.lock"))
            .unwrap();
        assert!(
            Flock::lock(contender, FlockArg::LockExclusiveNonblock).is_err(),
            "second holder must be refused while the guard lives"
        );

        drop(guard);
        let contender = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.path().join("boardd-db410c-01.lock"))
            .unwrap();
        assert!(Flock::lock(contender, FlockArg::LockExclusiveNonblock).is_ok());
    }

    #[test]
    fn test_different_boards_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let _a = BoardLock::acquire_at(dir.path(), "a").unwrap();
        let _b = BoardLock::acquire_at(dir.path(), "b").unwrap();
    }
}
