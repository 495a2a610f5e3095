//! Periodic and one-shot timer subscriptions, fired from the main loop
//! between reactor ticks.

use std::time::{Duration, Instant};

pub type TimerId = u64;

struct Sub {
    id: TimerId,
    interval: Duration,
    due: Instant,
    one_shot: bool,
}

#[derive(Default)]
pub struct TimerService {
    subs: Vec<Sub>,
    next_id: TimerId,
}

impl TimerService {
    pub fn new() -> TimerService {
        TimerService {
            subs: Vec::new(),
            next_id: 1,
        }
    }

    pub fn add_periodic(&mut self, interval: Duration) -> TimerId {
        self.insert(interval, false)
    }

    pub fn add_oneshot(&mut self, delay: Duration) -> TimerId {
        self.insert(delay, true)
    }

    fn insert(&mut self, interval: Duration, one_shot: bool) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;

        self.subs.push(Sub {
            id,
            interval,
            due: Instant::now() + interval,
            one_shot,
        });

        id
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        let before = self.subs.len();
        self.subs.retain(|sub| sub.id != id);
        self.subs.len() != before
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    pub fn clear(&mut self) {
        self.subs.clear();
    }

    /// Collects the subscriptions due at `now`. Periodic timers re-arm from
    /// their due time so a slow tick does not shift the cadence; one-shots
    /// are removed.
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerId> {
        let mut due = Vec::new();

        for sub in self.subs.iter_mut() {
            if sub.due <= now {
                due.push(sub.id);
                if !sub.one_shot {
                    sub.due += sub.interval;
                    // A long stall must not queue a burst of catch-up fires.
                    if sub.due <= now {
                        sub.due = now + sub.interval;
                    }
                }
            }
        }

        self.subs.retain(|sub| !(sub.one_shot && due.contains(&sub.id)));

        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_periodic_fires_and_rearms() {
        let mut timers = TimerService::new();
        let id = timers.add_periodic(Duration::from_millis(10));

        let later = Instant::now() + Duration::from_millis(20);
        assert_eq!(timers.take_due(later), vec![id]);
        assert_eq!(timers.len(), 1);

        // Immediately after firing it is not due again.
        assert!(timers.take_due(later).is_empty());

        let much_later = later + Duration::from_millis(20);
        assert_eq!(timers.take_due(much_later), vec![id]);
    }

    #[test]
    fn test_oneshot_fires_once() {
        let mut timers = TimerService::new();
        let id = timers.add_oneshot(Duration::from_millis(5));

        let later = Instant::now() + Duration::from_millis(10);
        assert_eq!(timers.take_due(later), vec![id]);
        assert!(timers.is_empty());
        assert!(timers.take_due(later + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_not_due_yet() {
        let mut timers = TimerService::new();
        timers.add_periodic(Duration::from_secs(60));
        assert!(timers.take_due(Instant::now()).is_empty());
    }

    #[test]
    fn test_cancel() {
        let mut timers = TimerService::new();
        let id = timers.add_periodic(Duration::from_millis(1));

        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));

        let later = Instant::now() + Duration::from_secs(1);
        assert!(timers.take_due(later).is_empty());
    }
}
