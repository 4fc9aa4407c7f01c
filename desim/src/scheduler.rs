use std::any::{Any, TypeId};
use std::cell::Cell;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use crate::{Clock, ComponentId};

/// Identifier of a scheduled event, issued by [`Scheduler::schedule`].
///
/// It can be passed to [`Scheduler::cancel`] to withdraw the event before it
/// fires; cancelling an event that has already fired is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(u64);

/// An event addressed to a component, with the component type erased.
///
/// This is the unit the scheduler stores and delivers. It is also used by
/// [`Resource`](crate::Resource) to wake a waiting component when a queued
/// request is granted.
pub struct Wakeup {
    pub(crate) component: usize,
    pub(crate) inner: Box<dyn Any>,
    pub(crate) event_type: TypeId,
}

impl Wakeup {
    /// Creates a wake-up notice delivering `event` to `component`.
    #[must_use]
    pub fn new<E: fmt::Debug + 'static>(component: ComponentId<E>, event: E) -> Self {
        Self {
            component: component.id,
            inner: Box::new(event),
            event_type: TypeId::of::<E>(),
        }
    }
}

impl fmt::Debug for Wakeup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wakeup")
            .field("component", &self.component)
            .field("event_type", &self.event_type)
            .finish()
    }
}

/// Entry stored in the scheduler: the target wake-up, the time when it is due,
/// and the registration sequence number used to break ties deterministically.
#[derive(Debug)]
pub struct EventEntry {
    time: Reverse<Duration>,
    seq: Reverse<u64>,
    id: EventId,
    wakeup: Wakeup,
}

impl EventEntry {
    /// The time at which this event is due.
    #[must_use]
    pub fn time(&self) -> Duration {
        self.time.0
    }

    /// Index of the component this event is addressed to.
    #[must_use]
    pub(crate) fn component_idx(&self) -> usize {
        self.wakeup.component
    }

    pub(crate) fn event(&self) -> &dyn Any {
        self.wakeup.inner.as_ref()
    }

    /// Tries to downcast the entry to one holding an event of type `E`.
    /// Returns `None` if the entry holds a different event type.
    #[must_use]
    pub fn downcast<E: fmt::Debug + 'static>(&self) -> Option<EventEntryTyped<'_, E>> {
        self.wakeup
            .inner
            .downcast_ref::<E>()
            .map(|event| EventEntryTyped {
                time: self.time.0,
                component_idx: self.wakeup.component,
                event,
            })
    }
}

impl PartialEq for EventEntry {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for EventEntry {}

impl PartialOrd for EventEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EventEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.time, self.seq).cmp(&(other.time, other.seq))
    }
}

/// A typed view of an [`EventEntry`], produced by [`EventEntry::downcast`].
#[derive(Debug)]
pub struct EventEntryTyped<'e, E: fmt::Debug> {
    /// The time at which the event is due.
    pub time: Duration,
    /// Index of the target component.
    pub component_idx: usize,
    /// The event value.
    pub event: &'e E,
}

/// This struct has only immutable access to the simulation clock exposed.
pub struct ClockRef {
    clock: Clock,
}

impl From<Clock> for ClockRef {
    fn from(clock: Clock) -> Self {
        Self { clock }
    }
}

impl ClockRef {
    /// Return the current simulation time.
    #[must_use]
    pub fn time(&self) -> Duration {
        self.clock.get()
    }
}

/// Keeps the current simulation time and the queue of upcoming events.
///
/// Events due at the same time fire in the order in which they were
/// scheduled, which makes runs reproducible given deterministic random draws.
pub struct Scheduler {
    events: BinaryHeap<EventEntry>,
    cancelled: HashSet<EventId>,
    clock: Clock,
    next_seq: u64,
    next_id: u64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            events: BinaryHeap::new(),
            cancelled: HashSet::new(),
            clock: Rc::new(Cell::new(Duration::default())),
            next_seq: 0,
            next_id: 0,
        }
    }
}

impl Scheduler {
    /// Schedules `event` to be delivered to `component` at `self.time() + delay`.
    pub fn schedule<E: fmt::Debug + 'static>(
        &mut self,
        delay: Duration,
        component: ComponentId<E>,
        event: E,
    ) -> EventId {
        self.schedule_wakeup(delay, Wakeup::new(component, event))
    }

    /// Schedules `event` to be delivered to `component` at the current time.
    ///
    /// The event still goes through the queue, so it fires after the running
    /// callback returns and after any event scheduled earlier for this time.
    pub fn schedule_immediately<E: fmt::Debug + 'static>(
        &mut self,
        component: ComponentId<E>,
        event: E,
    ) -> EventId {
        self.schedule(Duration::default(), component, event)
    }

    /// Schedules a type-erased wake-up notice at `self.time() + delay`.
    pub fn schedule_wakeup(&mut self, delay: Duration, wakeup: Wakeup) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.push(EventEntry {
            time: Reverse(self.time() + delay),
            seq: Reverse(seq),
            id,
            wakeup,
        });
        id
    }

    /// Withdraws a scheduled event before it fires.
    ///
    /// A cancelled event is silently discarded when its due time arrives.
    /// Cancelling an event that has already fired (or was already cancelled)
    /// has no effect.
    pub fn cancel(&mut self, event: EventId) {
        self.cancelled.insert(event);
    }

    /// Returns the current simulation time.
    #[must_use]
    pub fn time(&self) -> Duration {
        self.clock.get()
    }

    /// Returns a structure with immutable access to the simulation time.
    #[must_use]
    pub fn clock(&self) -> ClockRef {
        ClockRef {
            clock: Rc::clone(&self.clock),
        }
    }

    /// Removes and returns the next scheduled event, advancing the clock to
    /// its due time. Cancelled events are skipped. Returns `None` when no
    /// events are left.
    pub fn pop(&mut self) -> Option<EventEntry> {
        while let Some(entry) = self.events.pop() {
            if self.cancelled.remove(&entry.id) {
                continue;
            }
            self.clock.replace(entry.time.0);
            return Some(entry);
        }
        None
    }

    /// The due time of the next pending event, if any.
    #[must_use]
    pub fn peek_time(&self) -> Option<Duration> {
        self.events
            .iter()
            .filter(|e| !self.cancelled.contains(&e.id))
            .map(|e| e.time.0)
            .min()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::marker::PhantomData;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Tick(u32);

    fn component(id: usize) -> ComponentId<Tick> {
        ComponentId {
            id,
            _marker: PhantomData,
        }
    }

    #[test]
    fn test_events_fire_in_time_order() {
        let mut scheduler = Scheduler::default();
        scheduler.schedule(Duration::from_secs(2), component(0), Tick(2));
        scheduler.schedule(Duration::from_secs(1), component(1), Tick(1));
        scheduler.schedule(Duration::from_secs(3), component(2), Tick(3));

        for expected in 1..=3 {
            let entry = scheduler.pop().unwrap();
            assert_eq!(entry.time(), Duration::from_secs(expected));
            let typed = entry.downcast::<Tick>().unwrap();
            assert_eq!(typed.event, &Tick(expected as u32));
            assert_eq!(scheduler.time(), Duration::from_secs(expected));
        }
        assert!(scheduler.pop().is_none());
    }

    #[test]
    fn test_ties_fire_in_registration_order() {
        let mut scheduler = Scheduler::default();
        for n in 0..10 {
            scheduler.schedule(Duration::from_secs(5), component(n), Tick(n as u32));
        }
        for n in 0..10 {
            let entry = scheduler.pop().unwrap();
            assert_eq!(entry.downcast::<Tick>().unwrap().event, &Tick(n));
        }
    }

    #[test]
    fn test_cancelled_event_does_not_fire() {
        let mut scheduler = Scheduler::default();
        let keep = scheduler.schedule(Duration::from_secs(1), component(0), Tick(1));
        let cancel = scheduler.schedule(Duration::from_secs(2), component(0), Tick(2));
        scheduler.cancel(cancel);

        let entry = scheduler.pop().unwrap();
        assert_eq!(entry.downcast::<Tick>().unwrap().event, &Tick(1));
        assert!(scheduler.pop().is_none());
        // Cancelling after the fact is a no-op.
        scheduler.cancel(keep);
        assert!(scheduler.pop().is_none());
    }

    #[test]
    fn test_downcast_to_wrong_type_fails() {
        let mut scheduler = Scheduler::default();
        scheduler.schedule(Duration::default(), component(0), Tick(0));
        let entry = scheduler.pop().unwrap();
        assert!(entry.downcast::<String>().is_none());
        assert!(entry.downcast::<Tick>().is_some());
    }

    #[test]
    fn test_peek_time_skips_cancelled() {
        let mut scheduler = Scheduler::default();
        let early = scheduler.schedule(Duration::from_secs(1), component(0), Tick(0));
        scheduler.schedule(Duration::from_secs(4), component(0), Tick(1));
        assert_eq!(scheduler.peek_time(), Some(Duration::from_secs(1)));
        scheduler.cancel(early);
        assert_eq!(scheduler.peek_time(), Some(Duration::from_secs(4)));
    }
}
