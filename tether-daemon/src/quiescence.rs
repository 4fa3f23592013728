//! Per-template debounce timer.
//!
//! A burst of changes settles once `min` passes without news, or is forced
//! through once `max` has passed since the first change of the burst.

use std::time::Duration;

use tokio::time::Instant;

use tether_core::WaitConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quiescence {
    min: Duration,
    max: Option<Duration>,
    first: Option<Instant>,
    last: Option<Instant>,
}

impl Quiescence {
    pub fn new(wait: WaitConfig) -> Self {
        Self {
            min: wait.min,
            max: wait.max,
            first: None,
            last: None,
        }
    }

    /// Record a change at `now`, arming the timer if it is idle.
    pub fn observe(&mut self, now: Instant) {
        self.first.get_or_insert(now);
        self.last = Some(now);
    }

    pub fn is_armed(&self) -> bool {
        self.first.is_some()
    }

    /// Earliest instant at which the timer fires, if armed.
    ///
    /// A wait too long to represent as an instant never fires.
    pub fn deadline(&self) -> Option<Instant> {
        let settle = self.last?.checked_add(self.min);
        let forced = self.max.and_then(|max| self.first?.checked_add(max));
        match (settle, forced) {
            (Some(settle), Some(forced)) => Some(settle.min(forced)),
            (settle, forced) => settle.or(forced),
        }
    }

    pub fn ready(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    /// Disarm. Called when the template fires, before it renders.
    pub fn reset(&mut self) {
        self.first = None;
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wait(min_ms: u64, max_ms: Option<u64>) -> WaitConfig {
        WaitConfig {
            min: Duration::from_millis(min_ms),
            max: max_ms.map(Duration::from_millis),
        }
    }

    #[test]
    fn idle_timer_never_fires() {
        let q = Quiescence::new(wait(0, None));
        assert!(!q.is_armed());
        assert_eq!(q.deadline(), None);
        assert!(!q.ready(Instant::now()));
    }

    #[test]
    fn zero_min_fires_immediately() {
        let mut q = Quiescence::new(wait(0, None));
        let now = Instant::now();
        q.observe(now);
        assert!(q.ready(now));
    }

    #[test]
    fn single_change_settles_after_min() {
        let mut q = Quiescence::new(wait(1000, None));
        let start = Instant::now();
        q.observe(start);
        assert!(!q.ready(start + Duration::from_millis(999)));
        assert!(q.ready(start + Duration::from_millis(1000)));
    }

    #[test]
    fn later_changes_push_settle_deadline() {
        let mut q = Quiescence::new(wait(1000, None));
        let start = Instant::now();
        q.observe(start);
        q.observe(start + Duration::from_millis(600));
        assert!(!q.ready(start + Duration::from_millis(1200)));
        assert_eq!(q.deadline(), Some(start + Duration::from_millis(1600)));
    }

    #[test]
    fn continuous_changes_are_forced_at_max() {
        let mut q = Quiescence::new(wait(1000, Some(3000)));
        let start = Instant::now();
        let mut now = start;
        while now < start + Duration::from_millis(3000) {
            q.observe(now);
            assert!(!q.ready(now), "fired early at {:?}", now - start);
            now += Duration::from_millis(500);
        }
        assert_eq!(q.deadline(), Some(start + Duration::from_millis(3000)));
        assert!(q.ready(start + Duration::from_millis(3000)));
    }

    #[test]
    fn unrepresentable_wait_does_not_overflow() {
        let mut q = Quiescence::new(WaitConfig {
            min: Duration::MAX,
            max: None,
        });
        let now = Instant::now();
        q.observe(now);
        assert!(q.is_armed());
        assert_eq!(q.deadline(), None);
        assert!(!q.ready(now));

        let mut q = Quiescence::new(WaitConfig {
            min: Duration::MAX,
            max: Some(Duration::from_secs(5)),
        });
        q.observe(now);
        assert_eq!(q.deadline(), Some(now + Duration::from_secs(5)));
    }

    #[test]
    fn reset_disarms() {
        let mut q = Quiescence::new(wait(0, Some(10)));
        q.observe(Instant::now());
        q.reset();
        assert!(!q.is_armed());
        assert_eq!(q.deadline(), None);
    }
}
