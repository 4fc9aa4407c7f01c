use std::time::Duration;

use desim::{ComponentId, QueueId, Scheduler, State};

use crate::{buffer, carrier, combine, delay, select, sink, station, Wafer};

/// A handle to any node that can receive wafers.
///
/// The variants form a closed set; routing never dispatches through trait
/// objects.
#[derive(Debug, Clone, Copy)]
pub enum NodeHandle {
    /// A wafer buffer.
    Buffer(ComponentId<buffer::Event>),
    /// A hold-and-wait station section.
    Carrier(ComponentId<carrier::Event>),
    /// A batch joiner.
    Combine(ComponentId<combine::Event>),
    /// A pure timer.
    Delay(ComponentId<delay::Event>),
    /// A two-way router.
    Select(ComponentId<select::Event>),
    /// A terminal accumulator.
    Sink(ComponentId<sink::Event>),
    /// A processing station.
    Station(ComponentId<station::Event>),
}

impl NodeHandle {
    /// Tells the node that a wafer was pushed into its inbound queue.
    pub fn notify_arrival(self, scheduler: &mut Scheduler) {
        match self {
            NodeHandle::Buffer(id) => {
                scheduler.schedule_immediately(id, buffer::Event::Arrival);
            }
            NodeHandle::Carrier(id) => {
                scheduler.schedule_immediately(id, carrier::Event::Arrival);
            }
            NodeHandle::Combine(id) => {
                scheduler.schedule_immediately(id, combine::Event::Arrival);
            }
            NodeHandle::Delay(id) => {
                scheduler.schedule_immediately(id, delay::Event::Arrival);
            }
            NodeHandle::Select(id) => {
                scheduler.schedule_immediately(id, select::Event::Arrival);
            }
            NodeHandle::Sink(id) => {
                scheduler.schedule_immediately(id, sink::Event::Arrival);
            }
            NodeHandle::Station(id) => {
                scheduler.schedule_immediately(id, station::Event::Arrival);
            }
        }
    }
}

/// An edge of the flow graph: the inbound wafer queue of the downstream node
/// together with its handle.
///
/// Pushing a wafer through a link places it in the queue and schedules an
/// arrival notification, so the downstream node picks it up in the same
/// simulation step.
#[derive(Debug, Clone, Copy)]
pub struct Link {
    queue: QueueId<Wafer>,
    target: NodeHandle,
}

impl Link {
    /// Creates a link delivering into `queue`, owned by `target`.
    #[must_use]
    pub fn new(queue: QueueId<Wafer>, target: NodeHandle) -> Self {
        Self { queue, target }
    }

    /// The inbound queue of the downstream node.
    #[must_use]
    pub fn queue(&self) -> QueueId<Wafer> {
        self.queue
    }

    /// Hands `wafer` over to the downstream node.
    ///
    /// # Errors
    ///
    /// If the downstream queue is full, the wafer is handed back and no
    /// notification is scheduled.
    pub fn send(
        &self,
        scheduler: &mut Scheduler,
        state: &mut State,
        wafer: Wafer,
    ) -> Result<(), Wafer> {
        state.send(self.queue, wafer)?;
        self.target.notify_arrival(scheduler);
        Ok(())
    }
}

/// Per-node counters backing the wafer-conservation checks and the run
/// statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NodeStats {
    /// Wafers that entered the node.
    pub entered: u64,
    /// Wafers passed on downstream.
    pub exited: u64,
    /// Wafers rejected on arrival (full finite-capacity buffer).
    pub rejected: u64,
    /// Wafers dropped inside the node with a diagnostic.
    pub dropped: u64,
    /// Wafers currently inside the node.
    pub held: u64,
    /// Total time wafers spent waiting in the node's queue.
    pub queue_wait: Duration,
    /// Total time the node's instances spent processing.
    pub busy: Duration,
}

impl NodeStats {
    pub(crate) fn enter(&mut self) {
        self.entered += 1;
        self.held += 1;
    }

    pub(crate) fn exit(&mut self) {
        self.exited += 1;
        self.held = self.held.saturating_sub(1);
    }

    pub(crate) fn drop_wafer(&mut self) {
        self.dropped += 1;
        self.held = self.held.saturating_sub(1);
    }

    pub(crate) fn reject(&mut self) {
        self.rejected += 1;
        self.held = self.held.saturating_sub(1);
    }

    /// Every wafer that entered is either still inside or accounted for in
    /// exactly one outcome counter.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.entered == self.exited + self.rejected + self.dropped + self.held
    }

    /// Fraction of `elapsed` the node spent processing, across all its
    /// instances.
    #[must_use]
    pub fn utilization(&self, elapsed: Duration, instances: usize) -> f64 {
        let total = elapsed.as_secs_f64() * instances.max(1) as f64;
        if total > 0.0 {
            self.busy.as_secs_f64() / total
        } else {
            0.0
        }
    }
}
