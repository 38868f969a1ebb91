//! Phase deadline scheduling
//!
//! A `PhaseClock` is armed from the aggregate's absolute deadline and
//! resolves exactly once when it passes. The engine re-arms it after every
//! commit, and its advance guard absorbs any duplicate or stale delivery,
//! so at-least-once timer behavior upstream is harmless.

use std::time::Duration;

use tokio::time::{sleep_until, Instant};

use crate::util::time::unix_millis;

#[derive(Debug, Default)]
pub struct PhaseClock {
    deadline: Option<Instant>,
}

impl PhaseClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or disarm, with `None`) from an absolute Unix-millis deadline.
    /// Deadlines already in the past fire immediately.
    pub fn arm_unix_millis(&mut self, deadline_ms: Option<u64>) {
        self.deadline = deadline_ms.map(|deadline| {
            let delta = deadline.saturating_sub(unix_millis());
            Instant::now() + Duration::from_millis(delta)
        });
    }

    /// Arm relative to now
    pub fn arm_in(&mut self, delay: Duration) {
        self.deadline = Some(Instant::now() + delay);
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves when the armed deadline passes, then disarms so the signal
    /// fires at most once per arming. Pends forever while disarmed, which
    /// makes it safe to poll inside a `select!` loop.
    pub async fn expired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                sleep_until(deadline).await;
                self.deadline = None;
            }
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_once_per_arming() {
        let mut clock = PhaseClock::new();
        clock.arm_in(Duration::from_millis(50));
        assert!(clock.is_armed());

        clock.expired().await;
        assert!(!clock.is_armed());

        // a second poll pends forever; give it a bounded window
        let second = tokio::time::timeout(Duration::from_millis(100), clock.expired()).await;
        assert!(second.is_err(), "disarmed clock must not fire again");
    }

    #[tokio::test(start_paused = true)]
    async fn past_deadlines_fire_immediately() {
        let mut clock = PhaseClock::new();
        // an already-expired unix deadline saturates to "now"
        clock.arm_unix_millis(Some(0));
        tokio::time::timeout(Duration::from_millis(10), clock.expired())
            .await
            .expect("past deadline should fire at once");
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_the_deadline() {
        let mut clock = PhaseClock::new();
        clock.arm_in(Duration::from_secs(60));
        clock.arm_in(Duration::from_millis(10));
        tokio::time::timeout(Duration::from_millis(20), clock.expired())
            .await
            .expect("re-armed deadline should apply");
    }
}
