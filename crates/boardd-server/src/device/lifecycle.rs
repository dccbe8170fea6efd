//! Power-on sequencing.
//!
//! Boards that strap a "force recovery" boot mode sample the boot key only
//! during a narrow window after power-up, so powering on is a timed sequence
//! rather than a single switch: keys are pre-asserted, power and USB are
//! energized, the power button is pressed and released, and the boot key is
//! held until its configured timeout expires.
//!
//! Each transition is driven by a one-shot reactor timer.  Timers are never
//! cancelled; a timer that outlives its power-on attempt (because the board
//! was powered off in between) compares the board's epoch and does nothing.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::device::Board;
use crate::hw::{ControlError, KeyKind};
use crate::reactor::Reactor;

const CONNECT_DELAY: Duration = Duration::from_millis(10);
const KEY_PRESS_DELAY: Duration = Duration::from_millis(250);
const KEY_HOLD: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Connecting,
    PressingKey,
    ReleasingPowerKey,
    ReleasingBootKey,
    Running,
}

/// Starts the power-on sequence.  A board that is already sequencing or
/// running must be powered off first.
pub fn power_on(board: &Rc<RefCell<Board>>, reactor: &Rc<Reactor>) {
    let mut b = board.borrow_mut();
    if b.state != LifecycleState::Idle {
        warn!("{}: power-on ignored in state {:?}", b.name(), b.state);
        return;
    }

    b.epoch += 1;
    let epoch = b.epoch;

    // Boot-mode straps are sampled at power-up, so the key goes down before
    // any power is applied.
    if b.boot_key_timeout().is_some() {
        b.key(KeyKind::Boot, true);
        if b.has_power_key() {
            b.key(KeyKind::Power, false);
        }
    }
    b.state = LifecycleState::Connecting;
    drop(b);

    schedule(board, reactor, epoch, LifecycleState::Connecting, CONNECT_DELAY);
}

/// Immediate and unconditional, valid in any state.
pub fn power_off(board: &Rc<RefCell<Board>>) -> Result<(), ControlError> {
    let mut b = board.borrow_mut();
    b.epoch += 1;

    let result = b.power(false);
    if !b.usb_always_on() {
        b.usb(false);
    }
    b.boot.reset();
    b.state = LifecycleState::Idle;
    result
}

fn schedule(
    board: &Rc<RefCell<Board>>,
    reactor: &Rc<Reactor>,
    epoch: u64,
    state: LifecycleState,
    delay: Duration,
) {
    let board = Rc::clone(board);
    let reactor_handle = Rc::clone(reactor);
    reactor.add_timer(delay, move || {
        enter(&board, &reactor_handle, epoch, state);
    });
}

fn enter(board: &Rc<RefCell<Board>>, reactor: &Rc<Reactor>, epoch: u64, state: LifecycleState) {
    let mut b = board.borrow_mut();
    if b.epoch != epoch {
        debug!("{}: stale {state:?} timer, sequence was restarted", b.name());
        return;
    }
    b.state = state;

    match state {
        LifecycleState::Connecting => {
            if let Err(err) = b.power(true) {
                warn!("{}: failed to power on: {err}", b.name());
                // The board is in an unknown electrical state; tear the
                // process down with a failing status.
                reactor.fail(io::Error::other(err));
                return;
            }
            b.usb(true);

            if b.has_power_key() {
                drop(b);
                schedule(board, reactor, epoch, LifecycleState::PressingKey, KEY_PRESS_DELAY);
            } else if let Some(timeout) = b.boot_key_timeout() {
                drop(b);
                schedule(board, reactor, epoch, LifecycleState::ReleasingBootKey, timeout);
            } else {
                b.state = LifecycleState::Running;
                debug!("{}: running", b.name());
            }
        }
        LifecycleState::PressingKey => {
            b.key(KeyKind::Power, true);
            drop(b);
            schedule(board, reactor, epoch, LifecycleState::ReleasingPowerKey, KEY_HOLD);
        }
        LifecycleState::ReleasingPowerKey => {
            b.key(KeyKind::Power, false);
            if let Some(timeout) = b.boot_key_timeout() {
                drop(b);
                schedule(board, reactor, epoch, LifecycleState::ReleasingBootKey, timeout);
            } else {
                b.state = LifecycleState::Running;
                debug!("{}: running", b.name());
            }
        }
        LifecycleState::ReleasingBootKey => {
            b.key(KeyKind::Boot, false);
            b.state = LifecycleState::Running;
            debug!("{}: running", b.name());
        }
        LifecycleState::Idle | LifecycleState::Running => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::hw::MockBoardControl;
    use mockall::Sequence;

    fn board(toml: &str) -> Rc<RefCell<Board>> {
        let config: Config = toml::from_str(toml).unwrap();
        Rc::new(RefCell::new(Board::new(
            config.boards.into_iter().next().unwrap(),
        )))
    }

    fn run_until_settled(reactor: &Rc<Reactor>, wait: Duration) {
        let handle = Rc::clone(reactor);
        reactor.add_timer(wait, move || handle.quit());
        reactor.run().unwrap();
    }

    #[test]
    fn test_full_key_sequence_in_order() {
        let board = board(
            r#"
            [[boards]]
            board = "strapped"
            console = "/dev/null"
            boot_key_timeout = 1
            [boards.gpio]
            power = { line = 1 }
            "#,
        );

        let mut control = MockBoardControl::new();
        let mut seq = Sequence::new();
        control.expect_has_power_key().return_const(true);
        control
            .expect_key()
            .withf(|k, on| *k == KeyKind::Boot && *on)
            .once()
            .in_sequence(&mut seq)
            .return_const(());
        control
            .expect_key()
            .withf(|k, on| *k == KeyKind::Power && !*on)
            .once()
            .in_sequence(&mut seq)
            .return_const(());
        control
            .expect_power()
            .withf(|on| *on)
            .once()
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        control
            .expect_usb()
            .withf(|on| *on)
            .once()
            .in_sequence(&mut seq)
            .return_const(());
        control
            .expect_key()
            .withf(|k, on| *k == KeyKind::Power && *on)
            .once()
            .in_sequence(&mut seq)
            .return_const(());
        control
            .expect_key()
            .withf(|k, on| *k == KeyKind::Power && !*on)
            .once()
            .in_sequence(&mut seq)
            .return_const(());
        control
            .expect_key()
            .withf(|k, on| *k == KeyKind::Boot && !*on)
            .once()
            .in_sequence(&mut seq)
            .return_const(());
        board.borrow_mut().set_control(Box::new(control));

        let reactor = Rc::new(Reactor::new());
        power_on(&board, &reactor);
        assert_eq!(board.borrow().state, LifecycleState::Connecting);

        run_until_settled(&reactor, Duration::from_millis(1600));
        assert_eq!(board.borrow().state, LifecycleState::Running);
    }

    #[test]
    fn test_plain_board_powers_straight_to_running() {
        let board = board(
            r#"
            [[boards]]
            board = "plain"
            console = "/dev/null"
            "#,
        );

        let mut control = MockBoardControl::new();
        control.expect_has_power_key().return_const(false);
        control.expect_key().never();
        control.expect_power().withf(|on| *on).once().returning(|_| Ok(()));
        control.expect_usb().withf(|on| *on).once().return_const(());
        board.borrow_mut().set_control(Box::new(control));

        let reactor = Rc::new(Reactor::new());
        power_on(&board, &reactor);
        run_until_settled(&reactor, Duration::from_millis(100));

        assert_eq!(board.borrow().state, LifecycleState::Running);
    }

    #[test]
    fn test_power_off_mid_sequence_cancels_pending_transitions() {
        let board = board(
            r#"
            [[boards]]
            board = "strapped"
            console = "/dev/null"
            boot_key_timeout = 1
            [boards.gpio]
            power = { line = 1 }
            "#,
        );

        let mut control = MockBoardControl::new();
        control.expect_has_power_key().return_const(true);
        control.expect_key().return_const(());
        // Power must never come up after the off request lands.
        control.expect_power().withf(|on| !*on).once().returning(|_| Ok(()));
        control.expect_usb().withf(|on| !*on).once().return_const(());
        board.borrow_mut().set_control(Box::new(control));

        let reactor = Rc::new(Reactor::new());
        power_on(&board, &reactor);
        power_off(&board).unwrap();

        run_until_settled(&reactor, Duration::from_millis(100));
        assert_eq!(board.borrow().state, LifecycleState::Idle);
    }

    #[test]
    fn test_power_fault_during_sequencing_is_fatal() {
        let board = board(
            r#"
            [[boards]]
            board = "plain"
            console = "/dev/null"
            "#,
        );

        let mut control = MockBoardControl::new();
        control.expect_has_power_key().return_const(false);
        control
            .expect_power()
            .withf(|on| *on)
            .once()
            .returning(|_| Err(ControlError::Rejected("rail fault".into())));
        board.borrow_mut().set_control(Box::new(control));

        let reactor = Rc::new(Reactor::new());
        power_on(&board, &reactor);

        reactor
            .run()
            .expect_err("a power fault must not exit as success");
    }

    #[test]
    fn test_duplicate_power_on_is_ignored() {
        let board = board(
            r#"
            [[boards]]
            board = "plain"
            console = "/dev/null"
            "#,
        );

        let mut control = MockBoardControl::new();
        control.expect_has_power_key().return_const(false);
        control.expect_power().withf(|on| *on).once().returning(|_| Ok(()));
        control.expect_usb().withf(|on| *on).once().return_const(());
        board.borrow_mut().set_control(Box::new(control));

        let reactor = Rc::new(Reactor::new());
        power_on(&board, &reactor);
        power_on(&board, &reactor);

        run_until_settled(&reactor, Duration::from_millis(100));
        assert_eq!(board.borrow().state, LifecycleState::Running);
    }
}
