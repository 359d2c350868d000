//! Property tests for the open/close permit and the serial queues.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use camera_core::capture::{CaptureConfig, PreviewSize};
use camera_core::hardware::MockHardware;
use camera_core::session::SessionController;
use camera_core::sync::{ResourceLock, SerialTaskQueue};
use camera_core::SessionPhase;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum LockOp {
    Acquire,
    Release,
    ReleaseGuard,
}

fn lock_op() -> impl Strategy<Value = LockOp> {
    prop_oneof![
        Just(LockOp::Acquire),
        Just(LockOp::Release),
        Just(LockOp::ReleaseGuard),
    ]
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Open,
    Preview,
    Close,
}

fn command() -> impl Strategy<Value = Command> {
    prop_oneof![Just(Command::Open), Just(Command::Preview), Just(Command::Close)]
}

proptest! {
    #[test]
    fn prop_permits_stay_binary(ops in prop::collection::vec(lock_op(), 1..64)) {
        let lock = ResourceLock::new();
        let mut held = false;
        for op in ops {
            match op {
                LockOp::Acquire => {
                    let acquired = lock.acquire("prop", Duration::ZERO).is_ok();
                    prop_assert_eq!(acquired, !held);
                    held = true;
                }
                LockOp::Release => {
                    prop_assert_eq!(lock.release("prop"), held);
                    held = false;
                }
                LockOp::ReleaseGuard => {
                    drop(lock.release_on_drop("prop"));
                    held = false;
                }
            }
            prop_assert!(lock.available_permits() <= 1);
            prop_assert_eq!(lock.available_permits(), u32::from(!held));
        }
    }

    #[test]
    fn prop_drain_discards_only_unstarted(backlog in 0usize..32) {
        let queue = SerialTaskQueue::new("prop-queue").unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();

        let counter = Arc::clone(&ran);
        queue.submit(move || {
            let _ = started_tx.send(());
            let _ = gate_rx.recv();
            counter.fetch_add(1, Ordering::SeqCst);
        }).unwrap();
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        for _ in 0..backlog {
            let counter = Arc::clone(&ran);
            queue.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }).unwrap();
        }
        prop_assert_eq!(queue.drain(), backlog);
        prop_assert_eq!(queue.pending(), 0);

        gate_tx.send(()).unwrap();
        prop_assert!(queue.wait_idle(Duration::from_secs(2)));
        prop_assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn prop_any_command_sequence_ends_released(commands in prop::collection::vec(command(), 1..6)) {
        let hw = MockHardware::new();
        let config = CaptureConfig::with_preview_size(PreviewSize::new(16, 16));
        let controller = SessionController::new(Arc::new(hw.clone()), config).unwrap();

        for command in commands {
            let _ = match command {
                Command::Open => controller.open_camera(0),
                Command::Preview => controller.start_preview(),
                Command::Close => controller.close_camera(),
            };
            prop_assert!(controller.lock_permits() <= 1);
            thread::sleep(Duration::from_millis(3));
        }

        controller.close_camera().wait(Duration::from_secs(8)).unwrap();
        prop_assert_eq!(controller.state(), SessionPhase::Closed);
        prop_assert_eq!(controller.lock_permits(), 1);
        prop_assert!(!controller.has_device());

        let mut open = hw.stats().open_devices;
        for _ in 0..500 {
            if open == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
            open = hw.stats().open_devices;
        }
        prop_assert_eq!(open, 0);
    }
}
