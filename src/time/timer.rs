use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::network::ConnId;

use super::event::{Event, EventKind};

/// Handle of a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Time ordered timers; equal fire times keep scheduling order
#[derive(Debug, Default)]
pub struct TimerQueue {
    timers: BTreeMap<(Instant, u64), Event>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `event` to fire at `at`
    pub fn schedule(&mut self, at: Instant, event: Event) -> TimerId {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timers.insert((at, seq), event);
        TimerId(seq)
    }

    /// Schedules `event` to fire `delay` from now
    pub fn schedule_in(&mut self, delay: Duration, event: Event) -> TimerId {
        self.schedule(Instant::now() + delay, event)
    }

    /// Removes and returns the earliest timer due at or before `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<Event> {
        let (&(at, _), _) = self.timers.first_key_value()?;
        if at > now {
            return None;
        }
        self.timers.pop_first().map(|(_, event)| event)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.keys().next().map(|&(at, _)| at)
    }

    pub fn cancel(&mut self, id: TimerId) -> Option<Event> {
        let key = self.timers.keys().find(|&&(_, seq)| seq == id.0).copied()?;
        self.timers.remove(&key)
    }

    /// Discards every pending timer of `kind`
    pub fn delete_timers(&mut self, kind: EventKind) -> usize {
        let before = self.timers.len();
        self.timers.retain(|_, event| event.kind != kind);
        before - self.timers.len()
    }

    /// Discards timers addressed to a connection
    pub fn delete_targeted(&mut self, conn: ConnId) -> usize {
        let before = self.timers.len();
        self.timers.retain(|_, event| event.target != Some(conn));
        before - self.timers.len()
    }

    pub fn has_timer(&self, kind: EventKind) -> bool {
        self.timers.values().any(|event| event.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::EventPayload;

    fn custom(n: u32) -> Event {
        Event::new(EventKind::Custom(n))
    }

    #[test]
    fn test_ties_fire_in_scheduling_order() {
        let base = Instant::now();
        let t1 = base + Duration::from_millis(10);
        let t3 = base + Duration::from_millis(20);

        let mut timers = TimerQueue::new();
        timers.schedule(t3, custom(3));
        timers.schedule(t1, custom(1));
        timers.schedule(t1, custom(2));

        assert_eq!(timers.next_deadline(), Some(t1));
        assert_eq!(timers.pop_due(t1).unwrap().kind, EventKind::Custom(1));
        assert_eq!(timers.pop_due(t1).unwrap().kind, EventKind::Custom(2));
        // not due yet
        assert!(timers.pop_due(t1).is_none());
        assert!(timers.pop_due(t3 - Duration::from_nanos(1)).is_none());
        assert_eq!(timers.pop_due(t3).unwrap().kind, EventKind::Custom(3));
        assert!(timers.is_empty());
    }

    #[test]
    fn test_delete_timers_by_kind() {
        let now = Instant::now();
        let mut timers = TimerQueue::new();
        timers.schedule(now, Event::new(EventKind::ExposureEnd));
        timers.schedule(now, Event::new(EventKind::KeepAlive));
        timers.schedule(now, Event::new(EventKind::ExposureEnd));

        assert_eq!(timers.delete_timers(EventKind::ExposureEnd), 2);
        assert!(!timers.has_timer(EventKind::ExposureEnd));
        assert_eq!(timers.pop_due(now).unwrap().kind, EventKind::KeepAlive);
    }

    #[test]
    fn test_cancel_and_targeted() {
        let now = Instant::now();
        let conn = ConnId::new(4, 1);
        let mut timers = TimerQueue::new();
        let id = timers.schedule(now, custom(1).with_payload(EventPayload::Integer(5)));
        timers.schedule(now, Event::targeted(EventKind::Reconnect, conn));

        assert_eq!(
            timers.cancel(id).unwrap().payload,
            EventPayload::Integer(5)
        );
        assert!(timers.cancel(id).is_none());
        assert_eq!(timers.delete_targeted(conn), 1);
        assert!(timers.is_empty());
    }
}
