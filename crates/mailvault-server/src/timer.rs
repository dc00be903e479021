//! Timer bookkeeping.
//!
//! A timer is a deadline with an owning continuation. Timers are armed and
//! cancelled through the reactor handle; the reactor fires expired timers in
//! deadline order on every iteration, removing one-shot timers as they fire
//! and re-arming repeating ones.

use std::time::{Duration, Instant};

use crate::event::OwnerRef;

/// Identifies an armed timer for later cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

pub(crate) struct Timer {
    pub(crate) id: TimerId,
    pub(crate) deadline: Instant,
    pub(crate) repeat: Option<Duration>,
    pub(crate) owner: OwnerRef,
}

/// Removes every timer due at `now` from `timers` and returns them in
/// deadline order. Repeating timers are re-armed in place.
pub(crate) fn take_due(timers: &mut Vec<Timer>, now: Instant) -> Vec<Timer> {
    let mut due = Vec::new();
    let mut i = 0;
    while i < timers.len() {
        if timers[i].deadline <= now {
            let t = timers.remove(i);
            if let Some(interval) = t.repeat {
                timers.push(Timer {
                    id: t.id,
                    deadline: t.deadline + interval,
                    repeat: t.repeat,
                    owner: t.owner.clone(),
                });
            }
            due.push(t);
        } else {
            i += 1;
        }
    }
    due.sort_by_key(|t| t.deadline);
    due
}

/// Returns the earliest deadline among `timers`, if any.
pub(crate) fn earliest(timers: &[Timer]) -> Option<Instant> {
    timers.iter().map(|t| t.deadline).min()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::rc::Weak;

    fn timer(id: u64, deadline: Instant, repeat: Option<Duration>) -> Timer {
        Timer {
            id: TimerId(id),
            deadline,
            repeat,
            owner: Weak::<std::cell::RefCell<Noop>>::new() as OwnerRef,
        }
    }

    struct Noop;
    impl crate::event::EventHandler for Noop {
        fn resume(&mut self) {}
    }

    #[test]
    fn due_timers_fire_in_deadline_order() {
        let base = Instant::now();
        let mut timers = vec![
            timer(1, base + Duration::from_secs(5), None),
            timer(2, base + Duration::from_secs(1), None),
            timer(3, base + Duration::from_secs(3), None),
        ];

        let due = take_due(&mut timers, base + Duration::from_secs(4));
        let ids: Vec<_> = due.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![TimerId(2), TimerId(3)]);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].id, TimerId(1));
    }

    #[test]
    fn repeating_timers_are_rearmed() {
        let base = Instant::now();
        let mut timers = vec![timer(7, base, Some(Duration::from_secs(10)))];

        let due = take_due(&mut timers, base);
        assert_eq!(due.len(), 1);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].deadline, base + Duration::from_secs(10));
    }

    #[test]
    fn earliest_deadline() {
        let base = Instant::now();
        assert!(earliest(&[]).is_none());
        let timers = vec![
            timer(1, base + Duration::from_secs(9), None),
            timer(2, base + Duration::from_secs(2), None),
        ];
        assert_eq!(earliest(&timers), Some(base + Duration::from_secs(2)));
    }
}
