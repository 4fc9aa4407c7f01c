use std::time::Duration;

use desim::{Component, ComponentId, Key, QueueId, Scheduler, State};
use rand_chacha::ChaCha8Rng;

use crate::{FlowStep, Link, NodeStats, ProcessingRecord, SeqId, Wafer, WaferLog};

/// Delay events.
#[derive(Debug, Copy, Clone)]
pub enum Event {
    /// A wafer was pushed into the inbound queue.
    Arrival,
    /// The timer of the wafer stored under the given key ran out.
    Done(Key<(Wafer, Duration)>),
}

/// Holds each wafer for a sampled amount of time, without taking any station
/// instance.
///
/// Used for transfer steps at stations configured to treat transfers as pure
/// delays. The step's interval is recorded with `-` as the resource.
pub struct Delay {
    incoming: QueueId<Wafer>,
    outgoing: Link,
    step: FlowStep,
    next_seq: Option<SeqId>,
    rng: ChaCha8Rng,
    log: Key<WaferLog>,
    stats: Key<NodeStats>,
}

impl Delay {
    /// Constructs a delay node for the given transfer step.
    #[must_use]
    pub fn new(
        incoming: QueueId<Wafer>,
        outgoing: Link,
        step: FlowStep,
        next_seq: Option<SeqId>,
        rng: ChaCha8Rng,
        log: Key<WaferLog>,
        stats: Key<NodeStats>,
    ) -> Self {
        Self {
            incoming,
            outgoing,
            step,
            next_seq,
            rng,
            log,
            stats,
        }
    }

    fn forward(&mut self, wafer: Wafer, scheduler: &mut Scheduler, state: &mut State) {
        state
            .get_mut(self.stats)
            .expect("Cannot find delay stats")
            .exit();
        if let Err(wafer) = self.outgoing.send(scheduler, state, wafer) {
            log::warn!(
                "[{:?}] wafer {} rejected after delay at step {}",
                scheduler.time(),
                wafer.id,
                self.step.seq_id
            );
            state
                .get_mut(self.log)
                .expect("Cannot find wafer log")
                .drop_wafer(wafer, "rejected after delay");
        }
    }
}

impl Component for Delay {
    type Event = Event;

    fn process_event(
        &mut self,
        self_id: ComponentId<Event>,
        event: &Event,
        scheduler: &mut Scheduler,
        state: &mut State,
    ) {
        match event {
            Event::Arrival => {
                while let Some(wafer) = state.recv(self.incoming) {
                    state
                        .get_mut(self.stats)
                        .expect("Cannot find delay stats")
                        .enter();
                    let duration = self.step.sample_duration(&mut self.rng);
                    let key = state.insert((wafer, scheduler.time()));
                    scheduler.schedule(duration, self_id, Event::Done(key));
                }
            }
            Event::Done(key) => {
                let (mut wafer, started) =
                    state.remove(*key).expect("Cannot find delayed wafer");
                let end = scheduler.time();
                state
                    .get_mut(self.stats)
                    .expect("Cannot find delay stats")
                    .busy += end - started;
                state
                    .get_mut(self.log)
                    .expect("Cannot find wafer log")
                    .record(ProcessingRecord {
                        wafer: wafer.id,
                        lot: wafer.lot,
                        station: self.step.station.clone(),
                        seq: self.step.seq_id,
                        resource: String::from("-"),
                        start: started,
                        end,
                    });
                if let Some(next) = self.next_seq {
                    wafer.seq = next;
                }
                self.forward(wafer, scheduler, state);
            }
        }
    }
}
