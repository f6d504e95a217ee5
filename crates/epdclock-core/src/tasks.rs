//! Concurrent wake-time work
//!
//! Network time sync and the sensor measurement are independent and both
//! slow, so they run side by side. A shared deadline bounds the pair; a worker
//! still running at the deadline is dropped and its partial work discarded.

use embassy_futures::join::join;
use embassy_time::{Duration, Instant, Timer, with_deadline};
use log::{info, warn};

/// Result of one bounded worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome<T> {
    Completed(T),
    /// Dropped at the deadline.
    TimedOut,
}

impl<T> TaskOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            TaskOutcome::Completed(v) => Some(v),
            TaskOutcome::TimedOut => None,
        }
    }
}

pub struct TaskCoordinator {
    timeout: Duration,
}

impl TaskCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run both workers to completion or until the shared deadline.
    pub async fn run<N, S>(
        &self,
        network: N,
        sensor: S,
    ) -> (TaskOutcome<N::Output>, TaskOutcome<S::Output>)
    where
        N: Future,
        S: Future,
    {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let (network, sensor) =
            join(with_deadline(deadline, network), with_deadline(deadline, sensor)).await;

        let network = match network {
            Ok(v) => TaskOutcome::Completed(v),
            Err(_) => {
                warn!("Tasks: network worker exceeded {} ms, dropped", self.timeout.as_millis());
                TaskOutcome::TimedOut
            }
        };
        let sensor = match sensor {
            Ok(v) => TaskOutcome::Completed(v),
            Err(_) => {
                warn!("Tasks: sensor worker exceeded {} ms, dropped", self.timeout.as_millis());
                TaskOutcome::TimedOut
            }
        };
        info!("Tasks: workers finished after {} ms", started.elapsed().as_millis());
        (network, sensor)
    }
}

/// Result of [`poll_until`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome<T, E> {
    Ready(T),
    TimedOut,
    Error(E),
}

/// Call `check` up to `attempts` times, sleeping `interval` between calls,
/// until it reports a value or fails.
pub async fn poll_until<T, E, F>(
    attempts: u32,
    interval: Duration,
    mut check: F,
) -> PollOutcome<T, E>
where
    F: AsyncFnMut() -> Result<Option<T>, E>,
{
    for attempt in 0..attempts {
        match check().await {
            Ok(Some(value)) => return PollOutcome::Ready(value),
            Ok(None) => {}
            Err(e) => return PollOutcome::Error(e),
        }
        if attempt + 1 < attempts {
            Timer::after(interval).await;
        }
    }
    PollOutcome::TimedOut
}
