use std::time::Duration;

use desim::{Component, ComponentId, Key, QueueId, Scheduler, State};
use serde::{Deserialize, Serialize};

use crate::{Link, NodeStats, Wafer, WaferLog};

/// Order in which a buffer releases its wafers.
#[derive(
    Debug,
    Default,
    PartialEq,
    Eq,
    Clone,
    Copy,
    strum::EnumString,
    strum::ToString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Discipline {
    /// First in, first out.
    #[default]
    Fifo,
    /// The wafer furthest along the flow leaves first; ties in arrival
    /// order.
    FurthestStep,
}

/// Buffer events.
#[derive(Debug, Copy, Clone)]
pub enum Event {
    /// A wafer was pushed into the buffer's inbound queue.
    Arrival,
    /// The downstream node freed a slot; one more wafer may be released.
    DownstreamReady,
}

/// Holds wafers until the downstream node can accept them.
///
/// The buffer keeps a credit per free downstream slot. Releasing a wafer
/// consumes a credit; the downstream node returns it with
/// [`Event::DownstreamReady`] once the wafer moves on. Arrivals beyond the
/// buffer's capacity are dropped.
pub struct Buffer {
    incoming: QueueId<Wafer>,
    outgoing: Link,
    discipline: Discipline,
    capacity: usize,
    credits: usize,
    waiting: Vec<(Wafer, Duration)>,
    log: Key<WaferLog>,
    stats: Key<NodeStats>,
}

impl Buffer {
    /// Constructs a buffer draining `incoming` into `outgoing`.
    ///
    /// `credits` is the number of wafers the downstream node accepts before
    /// the first [`Event::DownstreamReady`] arrives.
    #[must_use]
    pub fn new(
        incoming: QueueId<Wafer>,
        outgoing: Link,
        discipline: Discipline,
        capacity: usize,
        credits: usize,
        log: Key<WaferLog>,
        stats: Key<NodeStats>,
    ) -> Self {
        Self {
            incoming,
            outgoing,
            discipline,
            capacity,
            credits,
            waiting: Vec::new(),
            log,
            stats,
        }
    }

    fn next_index(&self) -> Option<usize> {
        match self.discipline {
            Discipline::Fifo => {
                if self.waiting.is_empty() {
                    None
                } else {
                    Some(0)
                }
            }
            Discipline::FurthestStep => self
                .waiting
                .iter()
                .enumerate()
                .max_by_key(|(index, (wafer, _))| (wafer.seq, std::cmp::Reverse(*index)))
                .map(|(index, _)| index),
        }
    }

    fn try_release(&mut self, scheduler: &mut Scheduler, state: &mut State) {
        while self.credits > 0 {
            let index = match self.next_index() {
                Some(index) => index,
                None => return,
            };
            let (wafer, arrived) = self.waiting.remove(index);
            match self.outgoing.send(scheduler, state, wafer) {
                Ok(()) => {
                    self.credits -= 1;
                    let stats = state
                        .get_mut(self.stats)
                        .expect("Cannot find buffer stats");
                    stats.exit();
                    stats.queue_wait += scheduler.time() - arrived;
                }
                Err(wafer) => {
                    // Downstream queue full; put the wafer back and wait for
                    // the ready signal.
                    self.waiting.insert(index, (wafer, arrived));
                    return;
                }
            }
        }
    }
}

impl Component for Buffer {
    type Event = Event;

    fn process_event(
        &mut self,
        _self_id: ComponentId<Event>,
        event: &Event,
        scheduler: &mut Scheduler,
        state: &mut State,
    ) {
        match event {
            Event::Arrival => {
                while let Some(wafer) = state.recv(self.incoming) {
                    let stats = state
                        .get_mut(self.stats)
                        .expect("Cannot find buffer stats");
                    stats.enter();
                    if self.waiting.len() >= self.capacity {
                        log::warn!(
                            "[{:?}] buffer full; rejecting wafer {}",
                            scheduler.time(),
                            wafer.id
                        );
                        stats.reject();
                        state
                            .get_mut(self.log)
                            .expect("Cannot find wafer log")
                            .drop_wafer(wafer, "entry buffer full");
                        continue;
                    }
                    self.waiting.push((wafer, scheduler.time()));
                }
            }
            Event::DownstreamReady => {
                self.credits += 1;
            }
        }
        self.try_release(scheduler, state);
    }
}
