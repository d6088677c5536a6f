// src/scheduler/reactor.rs - Monotonic clock and suspension points
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

/// Wake time meaning "as soon as possible".
pub const NOW: f64 = 0.0;
/// Wake time meaning "never".
pub const NEVER: f64 = 9_999_999_999_999_999.9;

/// Longest single sleep; callers re-check their condition after waking.
const MAX_PAUSE: f64 = 3600.0;

/// Time source for the single motion task.
///
/// `pause` is the only way the motion task gives up control; everything else
/// on the task runs to completion between pauses.
#[async_trait(?Send)]
pub trait Reactor {
    /// Seconds since an arbitrary fixed origin.
    fn monotonic(&self) -> f64;

    /// Suspend until `waketime` and return the time the task resumed.
    async fn pause(&self, waketime: f64) -> f64;
}

/// Wall clock reactor backed by the tokio timer.
#[derive(Debug, Clone)]
pub struct TokioReactor {
    origin: Instant,
}

impl TokioReactor {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for TokioReactor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl Reactor for TokioReactor {
    fn monotonic(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    async fn pause(&self, waketime: f64) -> f64 {
        let delay = waketime - self.monotonic();
        if delay > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(delay.min(MAX_PAUSE))).await;
        } else {
            tokio::task::yield_now().await;
        }
        self.monotonic()
    }
}
