use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Default interval between progress checks.
pub const DEFAULT_STALL_INTERVAL: Duration = Duration::from_secs(10);

/// Why a monitored operation did not produce a result.
#[derive(Debug, Error)]
pub enum StallError<E> {
    /// The check reported no progress.
    #[error("timed out after {elapsed:?} without progress ({checks} checks)")]
    Timeout { elapsed: Duration, checks: u32 },

    /// The check itself failed.
    #[error("progress check failed: {0}")]
    Check(E),

    /// The work failed.
    #[error("{0}")]
    Work(E),
}

impl<E> StallError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, StallError::Timeout { .. })
    }
}

/// Rolling timeout: work keeps running as long as every check made since
/// the last tick reports it alive.
#[derive(Debug, Clone)]
pub struct StallMonitor {
    interval: Duration,
}

impl StallMonitor {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Runs `work` while calling `check` every interval.
    ///
    /// `check` receives the previous progress value (starting with
    /// `initial`) and returns the next one plus whether the work is still
    /// alive. The token handed to `work` is cancelled when this returns,
    /// however it returns.
    pub async fn run<T, V, E, C, CF, W, WF>(
        &self,
        initial: T,
        mut check: C,
        work: W,
    ) -> Result<V, StallError<E>>
    where
        C: FnMut(T) -> CF,
        CF: Future<Output = Result<(T, bool), E>>,
        W: FnOnce(CancellationToken) -> WF,
        WF: Future<Output = Result<V, E>>,
    {
        let token = CancellationToken::new();
        let _cancel_on_exit = token.clone().drop_guard();

        let started = Instant::now();
        let mut ticker = tokio::time::interval_at(started + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let work = work(token);
        tokio::pin!(work);

        let mut previous = initial;
        let mut checks = 0u32;

        loop {
            tokio::select! {
                result = &mut work => return result.map_err(StallError::Work),
                _ = ticker.tick() => {}
            }

            checks += 1;

            // Keep polling the work while the check runs.
            let checked = tokio::select! {
                result = &mut work => return result.map_err(StallError::Work),
                checked = check(previous) => checked,
            };

            match checked {
                Ok((next, true)) => previous = next,
                Ok((_, false)) => {
                    tracing::debug!(checks, elapsed = ?started.elapsed(), "work stalled");
                    return Err(StallError::Timeout {
                        elapsed: started.elapsed(),
                        checks,
                    });
                }
                Err(err) => return Err(StallError::Check(err)),
            }
        }
    }
}

impl Default for StallMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_STALL_INTERVAL)
    }
}
