//! Subscription — the one-shot handshake gate between pipeline stages.
//!
//! One producer signals, one consumer waits and then resets. The mode decides
//! what happens when the two sides drift apart:
//!
//! - `DataDriven` (backtest, speed 0): the consumer waits without timeout.
//!   If the producer signals again before the consumer reset, that is an
//!   overrun — counted, and the producer blocks until the reset. Nothing is
//!   ever dropped.
//! - `ClockDriven` (backtest, speed > 0): the consumer waits with a timeout
//!   derived from the scaled bar interval; a timeout counts an overrun and
//!   the iteration is skipped. The producer never blocks.
//! - `Live`: the consumer waits with a configured timeout; timeouts are the
//!   caller's concern (flagged, not counted as overruns).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    DataDriven,
    ClockDriven { timeout: Duration },
    Live { timeout: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Default)]
struct Gate {
    signaled: bool,
    cancelled: bool,
}

/// One-shot event gate: signal → wait → reset.
pub struct Subscription {
    mode: SubscriptionMode,
    gate: Mutex<Gate>,
    cond: Condvar,
    overruns: AtomicU64,
}

impl Subscription {
    pub fn new(mode: SubscriptionMode) -> Self {
        Self {
            mode,
            gate: Mutex::new(Gate::default()),
            cond: Condvar::new(),
            overruns: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> SubscriptionMode {
        self.mode
    }

    /// Producer side. In `DataDriven` mode a signal that lands before the
    /// consumer reset blocks until the reset (never dropped); in the other
    /// modes the pending signal coalesces and an overrun is counted.
    pub fn signal(&self) {
        let mut gate = self.gate.lock();
        if gate.cancelled {
            return;
        }
        if gate.signaled {
            self.overruns.fetch_add(1, Ordering::Relaxed);
            if self.mode == SubscriptionMode::DataDriven {
                while gate.signaled && !gate.cancelled {
                    self.cond.wait(&mut gate);
                }
                if gate.cancelled {
                    return;
                }
            } else {
                // coalesce: the consumer will observe one pending signal
                return;
            }
        }
        gate.signaled = true;
        self.cond.notify_all();
    }

    /// Consumer side. Returns `Ready` once signaled; the signal stays pending
    /// until `reset()`.
    pub fn wait(&self) -> WaitOutcome {
        let mut gate = self.gate.lock();
        match self.mode {
            SubscriptionMode::DataDriven => loop {
                if gate.cancelled {
                    return WaitOutcome::Cancelled;
                }
                if gate.signaled {
                    return WaitOutcome::Ready;
                }
                self.cond.wait(&mut gate);
            },
            SubscriptionMode::ClockDriven { timeout } | SubscriptionMode::Live { timeout } => {
                let deadline = std::time::Instant::now() + timeout;
                loop {
                    if gate.cancelled {
                        return WaitOutcome::Cancelled;
                    }
                    if gate.signaled {
                        return WaitOutcome::Ready;
                    }
                    if self.cond.wait_until(&mut gate, deadline).timed_out() {
                        if gate.cancelled {
                            return WaitOutcome::Cancelled;
                        }
                        if gate.signaled {
                            return WaitOutcome::Ready;
                        }
                        if matches!(self.mode, SubscriptionMode::ClockDriven { .. }) {
                            self.overruns.fetch_add(1, Ordering::Relaxed);
                        }
                        return WaitOutcome::TimedOut;
                    }
                }
            }
        }
    }

    /// Consumer acknowledges the signal, re-arming the gate and unblocking a
    /// producer stuck in an overrun.
    pub fn reset(&self) {
        let mut gate = self.gate.lock();
        gate.signaled = false;
        self.cond.notify_all();
    }

    /// Unblock all waiters (both sides) with `Cancelled`. Irreversible.
    pub fn cancel(&self) {
        let mut gate = self.gate.lock();
        gate.cancelled = true;
        self.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.gate.lock().cancelled
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn signal_then_wait_is_ready() {
        let sub = Subscription::new(SubscriptionMode::DataDriven);
        sub.signal();
        assert_eq!(sub.wait(), WaitOutcome::Ready);
        sub.reset();
        assert_eq!(sub.overruns(), 0);
    }

    #[test]
    fn wait_blocks_until_signal() {
        let sub = Arc::new(Subscription::new(SubscriptionMode::DataDriven));
        let waiter = {
            let sub = Arc::clone(&sub);
            thread::spawn(move || sub.wait())
        };
        thread::sleep(Duration::from_millis(20));
        sub.signal();
        assert_eq!(waiter.join().unwrap(), WaitOutcome::Ready);
    }

    #[test]
    fn data_driven_overrun_blocks_producer_until_reset() {
        let sub = Arc::new(Subscription::new(SubscriptionMode::DataDriven));
        sub.signal();
        let producer = {
            let sub = Arc::clone(&sub);
            thread::spawn(move || {
                // second signal before reset: must block, then complete
                sub.signal();
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!producer.is_finished(), "producer must block on overrun");
        assert_eq!(sub.wait(), WaitOutcome::Ready);
        sub.reset();
        producer.join().unwrap();
        assert_eq!(sub.overruns(), 1);
        // the blocked signal landed after the reset
        assert_eq!(sub.wait(), WaitOutcome::Ready);
    }

    #[test]
    fn clock_driven_timeout_counts_overrun() {
        let sub = Subscription::new(SubscriptionMode::ClockDriven {
            timeout: Duration::from_millis(10),
        });
        assert_eq!(sub.wait(), WaitOutcome::TimedOut);
        assert_eq!(sub.overruns(), 1);
    }

    #[test]
    fn live_timeout_does_not_count_overrun() {
        let sub = Subscription::new(SubscriptionMode::Live {
            timeout: Duration::from_millis(10),
        });
        assert_eq!(sub.wait(), WaitOutcome::TimedOut);
        assert_eq!(sub.overruns(), 0);
    }

    #[test]
    fn clock_driven_producer_never_blocks() {
        let sub = Subscription::new(SubscriptionMode::ClockDriven {
            timeout: Duration::from_millis(10),
        });
        sub.signal();
        sub.signal(); // coalesces instead of blocking
        assert_eq!(sub.overruns(), 1);
        assert_eq!(sub.wait(), WaitOutcome::Ready);
        sub.reset();
        // the coalesced second signal was absorbed by the first wait
        assert_eq!(sub.wait(), WaitOutcome::TimedOut);
    }

    #[test]
    fn cancel_unblocks_waiters() {
        let sub = Arc::new(Subscription::new(SubscriptionMode::DataDriven));
        let waiter = {
            let sub = Arc::clone(&sub);
            thread::spawn(move || sub.wait())
        };
        thread::sleep(Duration::from_millis(20));
        sub.cancel();
        assert_eq!(waiter.join().unwrap(), WaitOutcome::Cancelled);
        // signals after cancel are inert
        sub.signal();
        assert_eq!(sub.wait(), WaitOutcome::Cancelled);
    }

    #[test]
    fn cancel_unblocks_overrun_producer() {
        let sub = Arc::new(Subscription::new(SubscriptionMode::DataDriven));
        sub.signal();
        let producer = {
            let sub = Arc::clone(&sub);
            thread::spawn(move || sub.signal())
        };
        thread::sleep(Duration::from_millis(20));
        sub.cancel();
        producer.join().unwrap();
    }
}
