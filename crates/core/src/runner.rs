//! 4.F Bounded-frequency runner.
//!
//! Coalesces many "please sync" requests into at most one reconciliation per
//! `min_period`, while guaranteeing a reconciliation runs at least every
//! `max_period` even with no requests at all. A small burst budget lets the
//! first couple of requests after a quiet period run back-to-back without
//! waiting out `min_period`.
//!
//! Modeled as a token bucket (one token refills every `min_period`, capacity
//! `burst`) gating explicit [`BoundedFrequencyRunner::run`] requests, plus an
//! unconditional timer that forces a reconciliation after `max_period` of
//! silence regardless of the bucket's state.

use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// How often the loop re-checks the stop flag while waiting out either the
/// token bucket's refill or the periodic forced-run timer. Keeps `Loop`
/// responsive to shutdown without needing a second channel.
const POLL_SLICE: Duration = Duration::from_millis(200);

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    fill_rate_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, min_period: Duration) -> Self {
        let fill_rate_per_sec = if min_period.is_zero() {
            f64::INFINITY
        } else {
            1.0 / min_period.as_secs_f64()
        };
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            fill_rate_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.fill_rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Consumes a token if one is available. Returns whether it succeeded.
    fn try_accept(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_available(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 || self.fill_rate_per_sec.is_infinite() {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.fill_rate_per_sec)
        }
    }
}

/// `Run()` (request a sync) and `Loop(stop)` (drive reconciliations) from
/// `spec.md` §4.F.
pub struct BoundedFrequencyRunner {
    name: String,
    max_period: Duration,
    run_tx: SyncSender<()>,
    run_rx: Mutex<Receiver<()>>,
    bucket: Mutex<TokenBucket>,
}

impl BoundedFrequencyRunner {
    pub fn new(name: impl Into<String>, min_period: Duration, max_period: Duration, burst: u32) -> Self {
        assert!(max_period >= min_period, "max_period must be >= min_period");
        // Capacity 1: a second pending Run() while one is already queued
        // coalesces into the same next pass, per the spec's coalescing
        // requirement.
        let (run_tx, run_rx) = sync_channel(1);
        Self {
            name: name.into(),
            max_period,
            run_tx,
            run_rx: Mutex::new(run_rx),
            bucket: Mutex::new(TokenBucket::new(burst, min_period)),
        }
    }

    /// Requests a sync. Never blocks: if a request is already pending, this
    /// one coalesces into it.
    pub fn run(&self) {
        match self.run_tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                log::debug!("{}: run requested after runner shut down", self.name);
            }
        }
    }

    /// Drives reconciliations by calling `reconcile` until `stop` is
    /// observed true. Blocks the calling thread — callers dedicate a thread
    /// to this (the "sync loop" in `spec.md` §5).
    pub fn loop_until(&self, stop: &AtomicBool, mut reconcile: impl FnMut()) {
        let mut silence = Duration::ZERO;

        loop {
            if stop.load(Ordering::Acquire) {
                return;
            }

            let slice = POLL_SLICE.min(self.max_period.saturating_sub(silence));
            let slice = if slice.is_zero() { POLL_SLICE } else { slice };

            match self.run_rx.lock().recv_timeout(slice) {
                Ok(()) => {
                    if stop.load(Ordering::Acquire) {
                        return;
                    }
                    if !self.wait_for_token(stop) {
                        return;
                    }
                    silence = Duration::ZERO;
                    reconcile();
                }
                Err(RecvTimeoutError::Timeout) => {
                    silence += slice;
                    if silence >= self.max_period {
                        silence = Duration::ZERO;
                        if stop.load(Ordering::Acquire) {
                            return;
                        }
                        log::debug!("{}: forced periodic run after {:?} of silence", self.name, self.max_period);
                        reconcile();
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// Blocks until a token is available, watching `stop`. Returns `false`
    /// if shutdown was observed instead.
    fn wait_for_token(&self, stop: &AtomicBool) -> bool {
        loop {
            if self.bucket.lock().try_accept() {
                return true;
            }
            if stop.load(Ordering::Acquire) {
                return false;
            }
            let wait = self.bucket.lock().time_until_available();
            std::thread::sleep(wait.min(Duration::from_millis(50)).max(Duration::from_millis(1)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn run_before_loop_starts_coalesces_into_first_pass() {
        let runner = BoundedFrequencyRunner::new("test", Duration::from_millis(20), Duration::from_secs(5), 2);
        runner.run();
        runner.run();
        runner.run();

        let stop = AtomicBool::new(false);
        let count = AtomicUsize::new(0);
        thread::scope(|scope| {
            scope.spawn(|| {
                thread::sleep(Duration::from_millis(50));
                stop.store(true, Ordering::Release);
            });
            runner.loop_until(&stop, || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        });

        // Three coalesced Run() calls plus burst headroom should not
        // produce more than a handful of passes in 50ms.
        assert!(count.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn burst_allows_back_to_back_runs_without_waiting_min_period() {
        let runner = Arc::new(BoundedFrequencyRunner::new(
            "test",
            Duration::from_secs(10),
            Duration::from_secs(10),
            2,
        ));
        let stop = Arc::new(AtomicBool::new(false));
        let count = Arc::new(AtomicUsize::new(0));

        let loop_runner = runner.clone();
        let loop_stop = stop.clone();
        let loop_count = count.clone();
        let handle = thread::spawn(move || {
            loop_runner.loop_until(&loop_stop, || {
                loop_count.fetch_add(1, Ordering::SeqCst);
            });
        });

        thread::sleep(Duration::from_millis(20));
        runner.run();
        thread::sleep(Duration::from_millis(20));
        runner.run();
        thread::sleep(Duration::from_millis(50));

        // Two requests within the burst budget (2) should both run even
        // though min_period (10s) hasn't elapsed between them.
        assert_eq!(count.load(Ordering::SeqCst), 2);

        stop.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn forced_run_fires_even_with_no_explicit_requests() {
        let runner = BoundedFrequencyRunner::new("test", Duration::from_millis(10), Duration::from_millis(60), 2);
        let stop = AtomicBool::new(false);
        let count = AtomicUsize::new(0);

        thread::scope(|scope| {
            scope.spawn(|| {
                thread::sleep(Duration::from_millis(150));
                stop.store(true, Ordering::Release);
            });
            runner.loop_until(&stop, || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        });

        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn loop_terminates_promptly_on_stop_with_no_activity() {
        let runner = BoundedFrequencyRunner::new("test", Duration::from_secs(1), Duration::from_secs(30), 2);
        let stop = AtomicBool::new(false);

        let start = Instant::now();
        thread::scope(|scope| {
            scope.spawn(|| {
                thread::sleep(Duration::from_millis(50));
                stop.store(true, Ordering::Release);
            });
            runner.loop_until(&stop, || {});
        });

        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
