use std::time::Duration;

use desim::{Component, ComponentId, Key, QueueId, Scheduler, State};

use crate::{Link, NodeStats, Wafer, WaferLog};

/// Combine events.
#[derive(Debug, Copy, Clone)]
pub enum Event {
    /// A wafer was pushed into the inbound queue.
    Arrival,
    /// The batch open when this event was scheduled timed out.
    Timeout {
        /// Which batch the timer was armed for; stale timers are ignored.
        batch: u64,
    },
}

/// Joins wafers into batches of a fixed size before passing them on.
///
/// Wafers accumulate until the batch is full, then all of them are released
/// at once. With a timeout configured, an incomplete batch is forced through
/// once its first wafer has waited that long.
pub struct Combine {
    incoming: QueueId<Wafer>,
    outgoing: Link,
    size: usize,
    timeout: Option<Duration>,
    waiting: Vec<Wafer>,
    batch: u64,
    log: Key<WaferLog>,
    stats: Key<NodeStats>,
}

impl Combine {
    /// Constructs a combine node forming batches of `size` wafers.
    #[must_use]
    pub fn new(
        incoming: QueueId<Wafer>,
        outgoing: Link,
        size: usize,
        timeout: Option<Duration>,
        log: Key<WaferLog>,
        stats: Key<NodeStats>,
    ) -> Self {
        Self {
            incoming,
            outgoing,
            size,
            timeout,
            waiting: Vec::new(),
            batch: 0,
            log,
            stats,
        }
    }

    fn release_batch(&mut self, scheduler: &mut Scheduler, state: &mut State) {
        self.batch += 1;
        for wafer in self.waiting.drain(..) {
            state
                .get_mut(self.stats)
                .expect("Cannot find combine stats")
                .exit();
            if let Err(wafer) = self.outgoing.send(scheduler, state, wafer) {
                log::warn!(
                    "[{:?}] wafer {} rejected after batching",
                    scheduler.time(),
                    wafer.id
                );
                state
                    .get_mut(self.log)
                    .expect("Cannot find wafer log")
                    .drop_wafer(wafer, "rejected after batching");
            }
        }
    }
}

impl Component for Combine {
    type Event = Event;

    fn process_event(
        &mut self,
        self_id: ComponentId<Event>,
        event: &Event,
        scheduler: &mut Scheduler,
        state: &mut State,
    ) {
        match *event {
            Event::Arrival => {
                while let Some(wafer) = state.recv(self.incoming) {
                    state
                        .get_mut(self.stats)
                        .expect("Cannot find combine stats")
                        .enter();
                    self.waiting.push(wafer);
                    if self.waiting.len() == 1 {
                        if let Some(timeout) = self.timeout {
                            scheduler.schedule(timeout, self_id, Event::Timeout {
                                batch: self.batch,
                            });
                        }
                    }
                    if self.waiting.len() >= self.size {
                        self.release_batch(scheduler, state);
                    }
                }
            }
            Event::Timeout { batch } => {
                if batch == self.batch && !self.waiting.is_empty() {
                    log::debug!(
                        "[{:?}] forcing incomplete batch of {} through",
                        scheduler.time(),
                        self.waiting.len()
                    );
                    self.release_batch(scheduler, state);
                }
            }
        }
    }
}
