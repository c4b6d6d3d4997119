//! Manager timers
//!
//! A list kept sorted by due time. Callbacks get the current time and
//! nothing else; anything that has to reach a connection goes through state
//! the callback captured (a flag, a queue) and is picked up by a handler on
//! its next `Poll` event.

use alloc::boxed::Box;
use alloc::vec::Vec;

/// Identifies a timer for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

struct Timer {
    id: TimerId,
    due_ms: u64,
    period_ms: u64,
    repeat: bool,
    callback: Box<dyn FnMut(u64)>,
}

/// Timers ordered by due time
#[derive(Default)]
pub struct TimerList {
    timers: Vec<Timer>,
    next_id: u64,
}

impl TimerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Schedule `callback` `period_ms` from `now_ms`
    pub fn add(
        &mut self,
        now_ms: u64,
        period_ms: u64,
        repeat: bool,
        callback: Box<dyn FnMut(u64)>,
    ) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.insert(Timer {
            id,
            due_ms: now_ms.saturating_add(period_ms),
            period_ms,
            repeat,
            callback,
        });
        id
    }

    /// Returns false if no such timer was pending
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.timers.iter().position(|t| t.id == id) {
            Some(idx) => {
                self.timers.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Due time of the soonest timer
    pub fn next_due(&self) -> Option<u64> {
        self.timers.first().map(|t| t.due_ms)
    }

    /// Run every timer due at `now_ms`; returns how many fired
    pub fn fire_expired(&mut self, now_ms: u64) -> usize {
        let due = self.timers.partition_point(|t| t.due_ms <= now_ms);
        let expired: Vec<Timer> = self.timers.drain(..due).collect();
        let fired = expired.len();

        for mut timer in expired {
            (timer.callback)(now_ms);
            if timer.repeat {
                let step = timer.period_ms.max(1);
                timer.due_ms = timer.due_ms.saturating_add(step);
                if timer.due_ms <= now_ms {
                    // Fell behind; do not replay missed ticks
                    timer.due_ms = now_ms.saturating_add(step);
                }
                self.insert(timer);
            }
        }
        fired
    }

    fn insert(&mut self, timer: Timer) {
        let idx = self.timers.partition_point(|t| t.due_ms <= timer.due_ms);
        self.timers.insert(idx, timer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::rc::Rc;
    use alloc::vec;
    use core::cell::RefCell;

    #[test]
    fn test_timers_fire_in_due_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut list = TimerList::new();

        let l = log.clone();
        list.add(0, 30, false, Box::new(move |_| l.borrow_mut().push(30)));
        let l = log.clone();
        list.add(0, 10, false, Box::new(move |_| l.borrow_mut().push(10)));

        assert_eq!(list.next_due(), Some(10));
        assert_eq!(list.fire_expired(5), 0);
        assert_eq!(list.fire_expired(40), 2);
        assert_eq!(*log.borrow(), vec![10, 30]);
        assert!(list.is_empty());
    }

    #[test]
    fn test_repeating_timer_reschedules() {
        let count = Rc::new(RefCell::new(0));
        let mut list = TimerList::new();
        let c = count.clone();
        list.add(0, 100, true, Box::new(move |_| *c.borrow_mut() += 1));

        list.fire_expired(100);
        assert_eq!(list.next_due(), Some(200));
        // Long stall: one catch-up tick, not five
        list.fire_expired(750);
        assert_eq!(*count.borrow(), 2);
        assert_eq!(list.next_due(), Some(850));
    }

    #[test]
    fn test_cancel() {
        let mut list = TimerList::new();
        let id = list.add(0, 10, false, Box::new(|_| {}));
        assert!(list.cancel(id));
        assert!(!list.cancel(id));
        assert_eq!(list.next_due(), None);
    }
}
