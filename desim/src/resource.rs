use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

use crate::{EventId, Scheduler, Wakeup};

/// Identifier of a resource request, issued by [`Resource::request`] and its
/// variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

/// Proof of holding one unit of a resource.
///
/// A grant cannot be cloned, and releasing the unit consumes it, so a single
/// acquisition can never be released twice.
#[derive(Debug)]
pub struct Grant {
    request: RequestId,
}

impl Grant {
    /// The request this grant was issued for.
    #[must_use]
    pub fn request_id(&self) -> RequestId {
        self.request
    }
}

/// Outcome of [`Resource::request`].
#[derive(Debug)]
pub enum Acquire {
    /// A unit was free; the caller holds it now.
    Granted(Grant),
    /// All units are busy; the request is queued and the registered wake-up
    /// will fire once a unit is assigned to it.
    Waiting(RequestId),
}

/// Outcome of [`Resource::request_with_timeout`].
#[derive(Debug)]
pub enum TimedAcquire {
    /// A unit was free; no timeout event was scheduled.
    Granted(Grant),
    /// The request is queued, racing against the scheduled timeout event.
    /// The caller is responsible for cancelling the timeout when the grant
    /// arrives first, and for cancelling the request when the timeout fires
    /// first.
    Waiting {
        /// The queued request.
        request: RequestId,
        /// The scheduled timeout event.
        timeout: EventId,
    },
}

struct Pending {
    priority: u64,
    seq: u64,
    id: RequestId,
    on_grant: Wakeup,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap; lower (priority, seq) must come out first.
        (Reverse(self.priority), Reverse(self.seq))
            .cmp(&(Reverse(other.priority), Reverse(other.seq)))
    }
}

/// A capacity-limited resource with a queue of pending requests.
///
/// Requests made while all units are busy wait in a priority queue: lower
/// priority keys are served first, ties in arrival order, so requests with
/// the default priority form a FIFO queue. When a unit frees up, the next
/// request is assigned the unit right away (the unit is never observably
/// idle) and its wake-up event is scheduled for the current time; the
/// requester then [`claim`](Resource::claim)s its [`Grant`] from within that
/// callback.
///
/// A pending request can be [`cancel`](Resource::cancel)led; a cancelled
/// request is never granted. If the cancel arrives after the unit was
/// already assigned but before the grant was claimed, the unit is passed on
/// to the next waiter in the same simulation step.
pub struct Resource {
    name: String,
    capacity: usize,
    in_use: usize,
    pending: BinaryHeap<Pending>,
    withdrawn: HashSet<RequestId>,
    ready: HashSet<RequestId>,
    next_request: u64,
    next_seq: u64,
    granted_total: u64,
    released_total: u64,
}

/// Default priority of a request; lower values are served first.
pub const DEFAULT_PRIORITY: u64 = 0;

impl Resource {
    /// Creates a resource with the given number of units.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        assert!(capacity > 0, "a resource must have at least one unit");
        Self {
            name: name.into(),
            capacity,
            in_use: 0,
            pending: BinaryHeap::new(),
            withdrawn: HashSet::new(),
            ready: HashSet::new(),
            next_request: 0,
            next_seq: 0,
            granted_total: 0,
            released_total: 0,
        }
    }

    fn next_request_id(&mut self) -> RequestId {
        let id = RequestId(self.next_request);
        self.next_request += 1;
        id
    }

    /// Requests one unit with the default priority.
    ///
    /// If a unit is free and nobody is waiting, it is granted immediately
    /// and `on_grant` is dropped without firing. Otherwise the request is
    /// queued and `on_grant` fires once a unit is assigned to it.
    pub fn request(&mut self, on_grant: Wakeup) -> Acquire {
        self.request_with_priority(DEFAULT_PRIORITY, on_grant)
    }

    /// Requests one unit with an explicit priority (lower is served first).
    pub fn request_with_priority(&mut self, priority: u64, on_grant: Wakeup) -> Acquire {
        let id = self.next_request_id();
        if self.in_use < self.capacity && self.pending.is_empty() {
            self.in_use += 1;
            self.granted_total += 1;
            Acquire::Granted(Grant { request: id })
        } else {
            self.enqueue(priority, id, on_grant);
            Acquire::Waiting(id)
        }
    }

    /// Requests one unit, racing the queued request against a timeout.
    ///
    /// If the request is not granted immediately, `on_timeout` is scheduled
    /// to fire after `timeout`. The two are independent: the caller cancels
    /// whichever loses the race.
    pub fn request_with_timeout(
        &mut self,
        scheduler: &mut Scheduler,
        timeout: Duration,
        on_grant: Wakeup,
        on_timeout: Wakeup,
    ) -> TimedAcquire {
        match self.request(on_grant) {
            Acquire::Granted(grant) => TimedAcquire::Granted(grant),
            Acquire::Waiting(request) => TimedAcquire::Waiting {
                request,
                timeout: scheduler.schedule_wakeup(timeout, on_timeout),
            },
        }
    }

    fn enqueue(&mut self, priority: u64, id: RequestId, on_grant: Wakeup) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push(Pending {
            priority,
            seq,
            id,
            on_grant,
        });
    }

    /// Claims the grant for a request whose wake-up has fired.
    ///
    /// Returns `None` if no unit is assigned to this request, which happens
    /// when the request was cancelled between the assignment and the claim.
    pub fn claim(&mut self, request: RequestId) -> Option<Grant> {
        if self.ready.remove(&request) {
            Some(Grant { request })
        } else {
            None
        }
    }

    /// Returns one unit, consuming the grant, and assigns the freed unit to
    /// the next waiting request, if any.
    pub fn release(&mut self, scheduler: &mut Scheduler, grant: Grant) {
        drop(grant);
        self.in_use -= 1;
        self.released_total += 1;
        self.grant_next(scheduler);
    }

    /// Withdraws a request. A cancelled request is never granted.
    ///
    /// If the unit was already assigned to the request but not yet claimed,
    /// the unit is freed and passed on to the next waiter immediately.
    /// Cancelling a request that was already claimed or cancelled has no
    /// effect.
    pub fn cancel(&mut self, scheduler: &mut Scheduler, request: RequestId) {
        if self.ready.remove(&request) {
            self.in_use -= 1;
            self.released_total += 1;
            self.grant_next(scheduler);
        } else if self.pending.iter().any(|p| p.id == request) {
            self.withdrawn.insert(request);
        }
    }

    fn grant_next(&mut self, scheduler: &mut Scheduler) {
        while let Some(next) = self.pending.pop() {
            if self.withdrawn.remove(&next.id) {
                continue;
            }
            self.in_use += 1;
            self.granted_total += 1;
            self.ready.insert(next.id);
            scheduler.schedule_wakeup(Duration::default(), next.on_grant);
            return;
        }
    }

    /// The resource name, used in logs and statistics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The total number of units.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of units currently granted or assigned.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// The number of free units.
    #[must_use]
    pub fn available(&self) -> usize {
        self.capacity - self.in_use
    }

    /// The number of requests waiting in the queue, not counting withdrawn
    /// ones.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.pending.len() - self.withdrawn.len()
    }

    /// The total number of grants handed out since creation.
    #[must_use]
    pub fn granted_total(&self) -> u64 {
        self.granted_total
    }

    /// The total number of releases since creation.
    #[must_use]
    pub fn released_total(&self) -> u64 {
        self.released_total
    }
}
