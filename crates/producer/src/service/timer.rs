use std::time::Duration;

use palisade_primitives::Timestamp;
use tokio::time::{sleep_until, Instant, Sleep};

/// What the scheduler should do when the timer elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerAction {
    /// Re-enter the production loop (`start_block` and re-arm).
    RestartLoop,
    /// Finalize, sign, and commit the pending block.
    ProduceBlock,
}

/// A timer firing, tagged with the correlation id captured at arming time.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FiredTimer {
    pub correlation_id: u64,
    pub action: TimerAction,
}

/// The scheduler's single timer.
///
/// Timer primitives cannot guarantee that a cancelled wait will not still
/// deliver its handler, so cancellation is replaced by idempotence: every
/// re-arm increments a correlation id, the firing carries the id captured at
/// arming time, and a handler whose id no longer matches drops itself. At
/// most one wait is outstanding at any moment.
#[derive(Debug)]
pub(crate) struct ProductionTimer {
    sleep: std::pin::Pin<Box<Sleep>>,
    armed: Option<FiredTimer>,
    correlation_id: u64,
}

impl ProductionTimer {
    pub fn new() -> Self {
        Self {
            sleep: Box::pin(sleep_until(Instant::now())),
            armed: None,
            correlation_id: 0,
        }
    }

    /// Invalidates any outstanding wait. An already-delivered firing will
    /// fail the [`is_current`](Self::is_current) check.
    pub fn cancel(&mut self) {
        self.correlation_id += 1;
        self.armed = None;
    }

    /// Arms the timer to fire at the wall-clock `deadline`. Returns the new
    /// correlation id.
    pub fn arm_at(&mut self, deadline: Timestamp, action: TimerAction) -> u64 {
        let delay = deadline.saturating_since(Timestamp::now());
        self.arm_in(delay, action)
    }

    /// Arms the timer to fire after `delay`.
    pub fn arm_in(&mut self, delay: Duration, action: TimerAction) -> u64 {
        self.correlation_id += 1;
        self.armed = Some(FiredTimer { correlation_id: self.correlation_id, action });
        self.sleep.as_mut().reset(Instant::now() + delay);
        self.correlation_id
    }

    /// Resolves when the armed deadline elapses; pends forever while the
    /// timer is disarmed. Cancel-safe: dropping the future before completion
    /// leaves the armed wait intact.
    pub async fn fired(&mut self) -> FiredTimer {
        let Some(armed) = self.armed else {
            return std::future::pending().await;
        };

        self.sleep.as_mut().await;
        self.armed = None;
        armed
    }

    /// Whether `fired` belongs to the most recent arming.
    pub fn is_current(&self, fired: &FiredTimer) -> bool {
        fired.correlation_id == self.correlation_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_with_the_armed_action() {
        let mut timer = ProductionTimer::new();
        timer.arm_in(Duration::from_millis(10), TimerAction::ProduceBlock);

        let fired = timer.fired().await;
        assert_eq!(fired.action, TimerAction::ProduceBlock);
        assert!(timer.is_current(&fired));
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_invalidates_in_flight_firings() {
        let mut timer = ProductionTimer::new();
        timer.arm_in(Duration::ZERO, TimerAction::ProduceBlock);
        let stale = timer.fired().await;

        // a handler that re-arms before the stale firing is inspected
        timer.arm_in(Duration::from_secs(5), TimerAction::RestartLoop);
        assert!(!timer.is_current(&stale));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_invalidates_without_rearming() {
        let mut timer = ProductionTimer::new();
        timer.arm_in(Duration::ZERO, TimerAction::RestartLoop);
        let fired = timer.fired().await;

        timer.cancel();
        assert!(!timer.is_current(&fired));
    }

    #[tokio::test(start_paused = true)]
    async fn disarmed_timer_never_fires() {
        let mut timer = ProductionTimer::new();
        let wait = tokio::time::timeout(Duration::from_secs(60), timer.fired());
        assert!(wait.await.is_err());
    }
}
