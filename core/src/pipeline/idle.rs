//! Cooperative idle scheduling.
//!
//! Quality-tier generation and budget cleanup must never compete with
//! interaction. Both park on an [`IdleScheduler`] and resume only when the
//! host signals an idle window via [`IdleScheduler::tick`]. When no host
//! signal is wired up, [`IdleScheduler::spawn_timer`] provides a
//! low-frequency fallback tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default fallback tick period when no host idle signal exists.
pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_millis(200);

/// Wakes parked low-priority work on each idle tick.
#[derive(Debug, Default)]
pub struct IdleScheduler {
    notify: Notify,
}

impl IdleScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Signal one idle window; all currently parked waiters resume.
    pub fn tick(&self) {
        self.notify.notify_waiters();
    }

    /// Park until the next idle tick.
    pub async fn idle(&self) {
        self.notify.notified().await;
    }

    /// Drive ticks from a timer as a stand-in for a host idle callback.
    pub fn spawn_timer(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                scheduler.tick();
            }
        })
    }
}

/// Per-invocation time budget for work drained during an idle window.
#[derive(Debug, Clone, Copy)]
pub struct TimeSlice {
    deadline: Instant,
}

impl TimeSlice {
    pub fn new(budget: Duration) -> Self {
        Self { deadline: Instant::now() + budget }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tick_wakes_parked_waiter() {
        let scheduler = IdleScheduler::new();
        let waiter = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                scheduler.idle().await;
                true
            })
        };

        // Let the waiter park before ticking.
        tokio::task::yield_now().await;
        scheduler.tick();
        assert!(waiter.await.expect("waiter completes"));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fallback_produces_ticks() {
        let scheduler = IdleScheduler::new();
        let timer = scheduler.spawn_timer(Duration::from_millis(50));

        let waiter = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.idle().await })
        };
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_millis(120)).await;
        waiter.await.expect("waiter resumed by timer tick");
        timer.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn time_slice_expires() {
        let slice = TimeSlice::new(Duration::from_millis(10));
        assert!(!slice.expired());
        tokio::time::advance(Duration::from_millis(11)).await;
        assert!(slice.expired());
    }
}
