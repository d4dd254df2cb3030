//! Polling barrier: turn a fire-and-forget fan-out into a synchronization point.
//!
//! The barrier re-evaluates an external count (jobs still queued under a tag)
//! until it equals the target, sleeping between polls. There is deliberately
//! no timeout: cluster jobs have unbounded runtime. The first poll happens
//! immediately, so a count that is already at the target returns without
//! sleeping. Cancellation is cooperative and only exists so tests and
//! embedding code can stop a blocked barrier between polls.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, instrument, warn};

use crate::core::format::Pad;
use crate::io::log_sink::{ALWAYS, DETAIL, LogSink};

/// Time source for the barrier.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `thread::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// A token for cooperative cancellation. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// How a barrier wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// The count reached the target on poll number `polls`.
    Satisfied { polls: u64, waited: Duration },
    /// The token was cancelled before the target was observed.
    Cancelled { polls: u64, waited: Duration },
}

impl BarrierOutcome {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, BarrierOutcome::Satisfied { .. })
    }

    pub fn polls(&self) -> u64 {
        match self {
            BarrierOutcome::Satisfied { polls, .. } | BarrierOutcome::Cancelled { polls, .. } => {
                *polls
            }
        }
    }
}

/// Blocks the calling thread until a count query reaches a target value.
pub struct PollingBarrier<'a> {
    clock: &'a dyn Clock,
    cancel: &'a CancellationToken,
    log: &'a dyn LogSink,
}

impl<'a> PollingBarrier<'a> {
    pub fn new(clock: &'a dyn Clock, cancel: &'a CancellationToken, log: &'a dyn LogSink) -> Self {
        Self { clock, cancel, log }
    }

    /// Poll `count_query` until it returns `target`.
    ///
    /// A query error counts as "not yet": it is logged and retried after the
    /// interval, never surfaced. `label` names the awaited jobs in messages.
    #[instrument(skip_all, fields(label, target, interval_secs = interval.as_secs()))]
    pub fn block_until<F>(
        &self,
        mut count_query: F,
        target: u64,
        interval: Duration,
        label: &str,
    ) -> BarrierOutcome
    where
        F: FnMut() -> Result<u64>,
    {
        let started = self.clock.now();
        let mut polls = 0u64;
        loop {
            if self.cancel.is_cancelled() {
                debug!(polls, "barrier cancelled");
                return BarrierOutcome::Cancelled {
                    polls,
                    waited: self.clock.now().saturating_duration_since(started),
                };
            }

            polls += 1;
            let observed = match count_query() {
                Ok(count) if count == target => {
                    let waited = self.clock.now().saturating_duration_since(started);
                    debug!(polls, waited_ms = waited.as_millis() as u64, "barrier satisfied");
                    return BarrierOutcome::Satisfied { polls, waited };
                }
                Ok(count) => Some(count),
                Err(err) => {
                    warn!(err = %format!("{err:#}"), polls, "count query failed, retrying");
                    None
                }
            };

            if polls == 1 {
                self.log.log(ALWAYS, &block_message(label, interval), Pad::NONE);
            }
            self.log.log(DETAIL, &wait_message(observed), Pad::NONE);

            self.clock.sleep(interval);
        }
    }
}

fn block_message(label: &str, interval: Duration) -> String {
    format!(
        "\n\tPostconditions are still running: multiple '{label}' instances\n\
         \tdetected in the cluster scheduler. Blocking until all scheduled jobs\n\
         \tare completed. Block interval = {} seconds.\n\n",
        interval.as_secs()
    )
}

fn wait_message(observed: Option<u64>) -> String {
    let count = match observed {
        Some(count) => format!("{count} outstanding"),
        None => "count unavailable".to_string(),
    };
    format!(
        "Waiting for scheduled jobs to complete ({count})... (hit <ctrl>-c to kill this run).\n"
    )
}
