//! Single-threaded readiness reactor: fd sources plus one-shot timers.
//!
//! The whole daemon runs on one OS thread.  Nothing in the process takes a
//! lock, because the reactor guarantees non-preemptive, one-callback-at-a-time
//! execution: the only blocking point is the `poll(2)` call, and every
//! callback runs to completion before the next one starts.
//!
//! Each loop iteration:
//!
//! 1. verify the required source (the control session's stdin) is still
//!    registered — losing it is a fatal invariant violation;
//! 2. compute the timeout as the time remaining until the earliest pending
//!    timer, or block indefinitely if none are pending;
//! 3. `poll(2)` all registered sources;
//! 4. fire and remove every timer whose deadline has passed, earliest first;
//! 5. invoke the callback of every ready source, in registration order.
//!
//! Callbacks may freely add or remove sources and timers; such mutations are
//! observed starting the next iteration.  A source callback returning an
//! error is fatal and stops the loop so the caller can tear down hardware.
//!
//! Timers carry no cancellation handle: once scheduled, a timer always fires
//! unless the process exits first.  An owner that stops caring simply ignores
//! the callback's effect (the lifecycle machine relies on this, see
//! `device::lifecycle`).

use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use thiserror::Error;

/// Errors that stop the reactor loop.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// `poll(2)` itself failed (EINTR is retried, not reported).
    #[error("poll failed: {0}")]
    Poll(#[source] Errno),

    /// The mandatory session input source is no longer registered.
    #[error("required source fd {0} is no longer registered")]
    RequiredSourceLost(RawFd),

    /// A source callback reported a fatal error.
    #[error("source fd {fd} failed: {source}")]
    SourceFailed {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    /// A callback flagged a fatal condition via [`Reactor::fail`].
    #[error("fatal: {0}")]
    Failed(#[source] io::Error),
}

type SourceCallback = Rc<RefCell<dyn FnMut() -> io::Result<()>>>;

struct Source {
    fd: RawFd,
    callback: SourceCallback,
}

struct Timer {
    deadline: Instant,
    callback: Box<dyn FnOnce()>,
}

/// Process-wide shutdown request flag, settable from a signal handler.
///
/// The reactor's own quit flag lives in non-`Sync` interior-mutability cells;
/// signal handlers need something async-signal-safe, so SIGPIPE and friends
/// funnel through this atomic instead.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Requests reactor shutdown.  Async-signal-safe.
pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

#[cfg(test)]
fn clear_shutdown() {
    SHUTDOWN.store(false, Ordering::Relaxed);
}

/// The readiness/timer multiplexer.
///
/// Held behind `Rc` so that callbacks can capture a handle and re-enter
/// `add_timer`/`remove_source`/`quit` while the loop is dispatching; interior
/// mutability keeps all of `run`'s borrows short-lived.
pub struct Reactor {
    sources: RefCell<Vec<Source>>,
    timers: RefCell<Vec<Timer>>,
    quit: Cell<bool>,
    required: Cell<Option<RawFd>>,
    failure: RefCell<Option<io::Error>>,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    pub fn new() -> Self {
        Self {
            sources: RefCell::new(Vec::new()),
            timers: RefCell::new(Vec::new()),
            quit: Cell::new(false),
            required: Cell::new(None),
            failure: RefCell::new(None),
        }
    }

    /// Registers a readiness callback for `fd`.
    ///
    /// The caller owns the fd and must call [`remove_source`](Self::remove_source)
    /// before closing it; the reactor only borrows the descriptor during poll.
    pub fn add_source<F>(&self, fd: RawFd, callback: F)
    where
        F: FnMut() -> io::Result<()> + 'static,
    {
        self.sources.borrow_mut().push(Source {
            fd,
            callback: Rc::new(RefCell::new(callback)),
        });
    }

    /// Unregisters every watch on `fd`.  Safe to call from within a callback,
    /// including the callback being dispatched for `fd` itself.
    pub fn remove_source(&self, fd: RawFd) {
        self.sources.borrow_mut().retain(|s| s.fd != fd);
    }

    /// Marks `fd` as mandatory: if it ever disappears from the registered
    /// set while the loop is running, the loop stops with
    /// [`ReactorError::RequiredSourceLost`].
    pub fn mark_required(&self, fd: RawFd) {
        self.required.set(Some(fd));
    }

    /// Schedules a one-shot timer `delay` from now.  There is no cancel:
    /// the callback runs unless the process exits first.
    pub fn add_timer<F>(&self, delay: Duration, callback: F)
    where
        F: FnOnce() + 'static,
    {
        self.timers.borrow_mut().push(Timer {
            deadline: Instant::now() + delay,
            callback: Box::new(callback),
        });
    }

    /// Asks the loop to stop after the current callback completes.
    pub fn quit(&self) {
        self.quit.set(true);
    }

    /// Stops the loop and makes [`run`](Self::run) return an error.  Timer
    /// callbacks have no error return of their own; a fatal condition
    /// detected in one is reported through here.
    pub fn fail(&self, error: io::Error) {
        *self.failure.borrow_mut() = Some(error);
        self.quit.set(true);
    }

    pub fn quit_requested(&self) -> bool {
        self.quit.get()
    }

    fn should_quit(&self) -> bool {
        self.quit.get() || SHUTDOWN.load(Ordering::Relaxed)
    }

    fn is_registered(&self, fd: RawFd) -> bool {
        self.sources.borrow().iter().any(|s| s.fd == fd)
    }

    /// Timeout for the next poll: time until the earliest pending timer,
    /// rounded up to a whole millisecond so a timer never fires early, or
    /// `None` to block indefinitely.
    fn next_timeout(&self) -> Option<Duration> {
        let timers = self.timers.borrow();
        let earliest = timers.iter().map(|t| t.deadline).min()?;
        Some(earliest.saturating_duration_since(Instant::now()))
    }

    fn fire_due_timers(&self) {
        let now = Instant::now();
        let mut due = Vec::new();
        {
            let mut timers = self.timers.borrow_mut();
            let mut i = 0;
            while i < timers.len() {
                if timers[i].deadline <= now {
                    due.push(timers.swap_remove(i));
                } else {
                    i += 1;
                }
            }
        }
        // Earliest deadline first; ties keep no particular order.
        due.sort_by_key(|t| t.deadline);

        // Timers scheduled by these callbacks land in `self.timers` and are
        // considered from the next iteration on.
        for timer in due {
            (timer.callback)();
        }
    }

    /// Runs the loop until [`quit`](Self::quit) is called, a shutdown is
    /// requested via [`request_shutdown`], or a fatal error occurs.
    pub fn run(&self) -> Result<(), ReactorError> {
        while !self.should_quit() {
            if let Some(required) = self.required.get() {
                if !self.is_registered(required) {
                    return Err(ReactorError::RequiredSourceLost(required));
                }
            }

            let fds: Vec<RawFd> = self.sources.borrow().iter().map(|s| s.fd).collect();

            // SAFETY: every registered fd is owned by the component that
            // registered it, which is required to call remove_source before
            // closing.  The borrow lasts only for this poll call.
            let borrowed: Vec<BorrowedFd<'_>> = fds
                .iter()
                .map(|&fd| unsafe { BorrowedFd::borrow_raw(fd) })
                .collect();
            let mut pollfds: Vec<PollFd<'_>> = borrowed
                .iter()
                .map(|fd| PollFd::new(*fd, PollFlags::POLLIN))
                .collect();

            match poll(&mut pollfds, poll_timeout(self.next_timeout())) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(ReactorError::Poll(err)),
            }

            let ready: Vec<RawFd> = pollfds
                .iter()
                .zip(&fds)
                .filter(|(pfd, _)| pfd.revents().is_some_and(|r| !r.is_empty()))
                .map(|(_, &fd)| fd)
                .collect();
            drop(pollfds);
            drop(borrowed);

            self.fire_due_timers();

            // Snapshot keeps registration order and lets callbacks mutate the
            // source list; a source removed by an earlier callback in the
            // same batch is skipped.
            let batch: Vec<(RawFd, SourceCallback)> = self
                .sources
                .borrow()
                .iter()
                .filter(|s| ready.contains(&s.fd))
                .map(|s| (s.fd, Rc::clone(&s.callback)))
                .collect();

            for (fd, callback) in batch {
                if self.should_quit() {
                    break;
                }
                if !self.is_registered(fd) {
                    continue;
                }
                if let Err(source) = (callback.borrow_mut())() {
                    return Err(ReactorError::SourceFailed { fd, source });
                }
            }
        }

        match self.failure.borrow_mut().take() {
            Some(error) => Err(ReactorError::Failed(error)),
            None => Ok(()),
        }
    }
}

fn poll_timeout(remaining: Option<Duration>) -> PollTimeout {
    let Some(remaining) = remaining else {
        return PollTimeout::NONE;
    };

    let mut millis = remaining.as_millis();
    if Duration::from_millis(millis as u64) < remaining {
        millis += 1; // round up, never wake early
    }
    let millis = millis.min(i32::MAX as u128) as i32;
    PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_timers_fire_earliest_first_regardless_of_insertion_order() {
        clear_shutdown();
        let reactor = Rc::new(Reactor::new());
        let order = Rc::new(RefCell::new(Vec::new()));

        // Inserted out of order on purpose.
        for (tag, ms) in [(3u8, 45u64), (1, 5), (2, 25)] {
            let order = Rc::clone(&order);
            let reactor_handle = Rc::clone(&reactor);
            reactor.add_timer(Duration::from_millis(ms), move || {
                order.borrow_mut().push(tag);
                if order.borrow().len() == 3 {
                    reactor_handle.quit();
                }
            });
        }

        reactor.run().expect("loop must exit cleanly");
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn test_ready_source_callback_runs_and_sees_data() {
        clear_shutdown();
        let reactor = Rc::new(Reactor::new());
        let (mut tx, rx) = UnixStream::pair().expect("socketpair");
        rx.set_nonblocking(true).unwrap();
        tx.write_all(b"ping").unwrap();

        let seen = Rc::new(Cell::new(0usize));
        let seen_cb = Rc::clone(&seen);
        let reactor_handle = Rc::clone(&reactor);
        let rx_fd = rx.as_raw_fd();
        let rx_cb = rx.try_clone().unwrap();
        reactor.add_source(rx_fd, move || {
            let mut buf = [0u8; 16];
            let n = std::io::Read::read(&mut (&rx_cb), &mut buf)?;
            seen_cb.set(seen_cb.get() + n);
            reactor_handle.quit();
            Ok(())
        });

        reactor.run().expect("loop must exit cleanly");
        assert_eq!(seen.get(), 4);
    }

    #[test]
    fn test_source_error_is_fatal() {
        clear_shutdown();
        let reactor = Reactor::new();
        let (mut tx, rx) = UnixStream::pair().unwrap();
        tx.write_all(b"x").unwrap();

        reactor.add_source(rx.as_raw_fd(), || {
            Err(io::Error::new(io::ErrorKind::InvalidData, "bad frame"))
        });

        let err = reactor.run().expect_err("callback error must stop the loop");
        assert!(matches!(err, ReactorError::SourceFailed { .. }));
    }

    #[test]
    fn test_fail_from_timer_surfaces_as_run_error() {
        clear_shutdown();
        let reactor = Rc::new(Reactor::new());
        let handle = Rc::clone(&reactor);
        reactor.add_timer(Duration::from_millis(5), move || {
            handle.fail(io::Error::other("power rail stuck"));
        });

        let err = reactor.run().expect_err("failure must not look like a clean exit");
        assert!(matches!(err, ReactorError::Failed(_)));
    }

    #[test]
    fn test_missing_required_source_is_fatal() {
        clear_shutdown();
        let reactor = Reactor::new();
        reactor.mark_required(0);
        // Source 0 was never registered.
        let err = reactor.run().expect_err("must detect the lost source");
        assert!(matches!(err, ReactorError::RequiredSourceLost(0)));
    }

    #[test]
    fn test_callback_may_remove_its_own_source() {
        clear_shutdown();
        let reactor = Rc::new(Reactor::new());
        let (mut tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        tx.write_all(b"once").unwrap();

        let calls = Rc::new(Cell::new(0u32));
        let calls_cb = Rc::clone(&calls);
        let reactor_handle = Rc::clone(&reactor);
        let rx_fd = rx.as_raw_fd();
        let rx_cb = rx.try_clone().unwrap();
        reactor.add_source(rx_fd, move || {
            let mut buf = [0u8; 16];
            let _ = std::io::Read::read(&mut (&rx_cb), &mut buf)?;
            calls_cb.set(calls_cb.get() + 1);
            reactor_handle.remove_source(rx_fd);
            Ok(())
        });

        // Unread data would keep the fd ready forever if removal failed.
        let reactor_handle = Rc::clone(&reactor);
        tx.write_all(b"more").unwrap();
        reactor.add_timer(Duration::from_millis(50), move || reactor_handle.quit());

        reactor.run().expect("loop must exit via the quit timer");
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_timer_added_by_timer_fires_next_iteration() {
        clear_shutdown();
        let reactor = Rc::new(Reactor::new());
        let fired = Rc::new(Cell::new(false));

        let reactor_outer = Rc::clone(&reactor);
        let fired_outer = Rc::clone(&fired);
        reactor.add_timer(Duration::from_millis(5), move || {
            let fired_inner = Rc::clone(&fired_outer);
            let reactor_inner = Rc::clone(&reactor_outer);
            reactor_outer.add_timer(Duration::from_millis(5), move || {
                fired_inner.set(true);
                reactor_inner.quit();
            });
        });

        reactor.run().expect("loop must exit cleanly");
        assert!(fired.get());
    }

    #[test]
    fn test_poll_timeout_rounds_up() {
        assert_eq!(poll_timeout(None), PollTimeout::NONE);
        assert_eq!(poll_timeout(Some(Duration::ZERO)), PollTimeout::ZERO);
        // 1.2 ms must not truncate down to 1 ms.
        let t = poll_timeout(Some(Duration::from_micros(1200)));
        assert_eq!(t, PollTimeout::try_from(2i32).unwrap());
    }
}
