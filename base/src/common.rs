// Copyright 2024 The SensorNet Testbed Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Small timing helpers: condition polling and a cancelable one-shot timer.

use std::sync::mpsc;
use std::sync::mpsc::RecvTimeoutError;
use std::thread;
use std::time::Duration;
use std::time::Instant;

const POLL_PERIOD: Duration = Duration::from_millis(100);

/// Polls `cond` until it returns `expected` or `timeout` elapses.
///
/// Returns true when the condition reached the expected value. A zero
/// timeout still checks once.
pub fn wait_cond<F: Fn() -> bool>(timeout: Duration, expected: bool, cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() == expected {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(POLL_PERIOD.min(deadline.saturating_duration_since(Instant::now())));
    }
}

/// Runs a callback once after a delay unless canceled first.
///
/// Dropping the timer cancels it. Cancellation does not wait for a callback
/// that is already running; a late firing is the callback's own problem to
/// detect (the experiment timeout rechecks its experiment identity).
pub struct OneshotTimer {
    cancel_tx: mpsc::Sender<()>,
}

impl OneshotTimer {
    pub fn arm<F>(name: &str, delay: Duration, f: F) -> OneshotTimer
    where
        F: FnOnce() + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = mpsc::channel();
        thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(delay) {
                    f();
                }
            })
            .expect("failed to spawn timer thread");
        OneshotTimer { cancel_tx }
    }

    pub fn cancel(self) {
        let _ = self.cancel_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn wait_cond_immediate() {
        assert!(wait_cond(Duration::ZERO, true, || true));
        assert!(!wait_cond(Duration::ZERO, true, || false));
    }

    #[test]
    fn wait_cond_becomes_true() {
        let deadline = Instant::now() + Duration::from_millis(150);
        assert!(wait_cond(Duration::from_secs(5), true, move || {
            Instant::now() >= deadline
        }));
    }

    #[test]
    fn timer_fires_exactly_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let _timer = OneshotTimer::arm("test-timer", Duration::from_millis(50), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(300));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn canceled_timer_does_not_fire() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let timer = OneshotTimer::arm("test-timer", Duration::from_millis(100), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        timer.cancel();
        thread::sleep(Duration::from_millis(300));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropped_timer_does_not_fire() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        drop(OneshotTimer::arm(
            "test-timer",
            Duration::from_millis(100),
            move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            },
        ));
        thread::sleep(Duration::from_millis(300));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
