use std::collections::HashMap;
use std::time::Duration;

use desim::{Component, ComponentId, Grant, Key, QueueId, Resource, Scheduler, State, Wakeup};

use rand_chacha::ChaCha8Rng;

use crate::{buffer, FlowStep, Link, NodeStats, ProcessingRecord, SeqId, Wafer, WaferLog};

type Parked = (Wafer, Duration);

/// Station events.
#[derive(Debug, Copy, Clone)]
pub enum Event {
    /// A wafer was pushed into the inbound queue.
    Arrival,
    /// An instance was assigned to the parked wafer.
    Granted {
        /// Where the wafer is stored in the state.
        wafer: Key<Parked>,
        /// Index into the station's instance list.
        instance: usize,
    },
    /// Processing of the parked wafer finished.
    Done {
        /// Where the wafer is stored in the state.
        wafer: Key<Parked>,
        /// Index into the station's instance list.
        instance: usize,
        /// When the instance was acquired.
        started: Duration,
    },
}

/// Performs one flow step on a group of interchangeable instances.
///
/// Arriving wafers are assigned instances in rotation, independent of which
/// instance frees up first, and wait in that instance's request queue. The
/// instances are shared resources: another station listing the same instance
/// name competes for the same units.
pub struct Station {
    step: FlowStep,
    next_seq: Option<SeqId>,
    incoming: QueueId<Wafer>,
    outgoing: Link,
    instances: Vec<(String, Key<Resource>)>,
    setup: Duration,
    rotation: usize,
    pending: HashMap<Key<Parked>, desim::RequestId>,
    busy: HashMap<Key<Parked>, Grant>,
    upstream_ready: Key<Option<ComponentId<buffer::Event>>>,
    rng: ChaCha8Rng,
    log: Key<WaferLog>,
    stats: Key<NodeStats>,
}

impl Station {
    /// Constructs a station node for the given step.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        step: FlowStep,
        next_seq: Option<SeqId>,
        incoming: QueueId<Wafer>,
        outgoing: Link,
        instances: Vec<(String, Key<Resource>)>,
        setup: Duration,
        upstream_ready: Key<Option<ComponentId<buffer::Event>>>,
        rng: ChaCha8Rng,
        log: Key<WaferLog>,
        stats: Key<NodeStats>,
    ) -> Self {
        Self {
            step,
            next_seq,
            incoming,
            outgoing,
            instances,
            setup,
            rotation: 0,
            pending: HashMap::new(),
            busy: HashMap::new(),
            upstream_ready,
            rng,
            log,
            stats,
        }
    }

    fn handle_arrival(
        &mut self,
        wafer: Wafer,
        self_id: ComponentId<Event>,
        scheduler: &mut Scheduler,
        state: &mut State,
    ) {
        state
            .get_mut(self.stats)
            .expect("Cannot find station stats")
            .enter();
        if wafer.seq != self.step.seq_id {
            log::warn!(
                "[{:?}] wafer {} expects step {} but arrived at step {}; forwarding",
                scheduler.time(),
                wafer.id,
                wafer.seq,
                self.step.seq_id
            );
            self.forward(wafer, scheduler, state);
            return;
        }
        if self.instances.is_empty() {
            log::warn!(
                "[{:?}] station {} has no instances; dropping wafer {}",
                scheduler.time(),
                self.step.station,
                wafer.id
            );
            state
                .get_mut(self.stats)
                .expect("Cannot find station stats")
                .drop_wafer();
            state
                .get_mut(self.log)
                .expect("Cannot find wafer log")
                .drop_wafer(wafer, "station has no instances");
            return;
        }
        if self.step.duration_mean <= 0.0 {
            // Bookkeeping step; takes no instance and no time.
            let now = scheduler.time();
            let mut wafer = wafer;
            state
                .get_mut(self.log)
                .expect("Cannot find wafer log")
                .record(ProcessingRecord {
                    wafer: wafer.id,
                    lot: wafer.lot,
                    station: self.step.station.clone(),
                    seq: self.step.seq_id,
                    resource: String::from("-"),
                    start: now,
                    end: now,
                });
            if let Some(next) = self.next_seq {
                wafer.seq = next;
            }
            self.forward(wafer, scheduler, state);
            return;
        }

        let instance = self.rotation % self.instances.len();
        self.rotation += 1;
        let key = state.insert((wafer, scheduler.time()));
        let acquire = state
            .get_mut(self.instances[instance].1)
            .expect("Cannot find station instance")
            .request(Wakeup::new(self_id, Event::Granted {
                wafer: key,
                instance,
            }));
        match acquire {
            desim::Acquire::Granted(grant) => {
                self.start_processing(key, instance, grant, self_id, scheduler, state);
            }
            desim::Acquire::Waiting(request) => {
                self.pending.insert(key, request);
            }
        }
    }

    fn start_processing(
        &mut self,
        key: Key<Parked>,
        instance: usize,
        grant: Grant,
        self_id: ComponentId<Event>,
        scheduler: &mut Scheduler,
        state: &mut State,
    ) {
        let started = scheduler.time();
        let arrived = state.get(key).expect("Cannot find parked wafer").1;
        state
            .get_mut(self.stats)
            .expect("Cannot find station stats")
            .queue_wait += started - arrived;
        self.busy.insert(key, grant);
        let duration = self.setup + self.step.sample_duration(&mut self.rng);
        scheduler.schedule(duration, self_id, Event::Done {
            wafer: key,
            instance,
            started,
        });
    }

    fn forward(&mut self, wafer: Wafer, scheduler: &mut Scheduler, state: &mut State) {
        state
            .get_mut(self.stats)
            .expect("Cannot find station stats")
            .exit();
        if let Some(buffer) = state
            .get(self.upstream_ready)
            .copied()
            .flatten()
        {
            scheduler.schedule_immediately(buffer, buffer::Event::DownstreamReady);
        }
        if let Err(wafer) = self.outgoing.send(scheduler, state, wafer) {
            log::warn!(
                "[{:?}] wafer {} rejected after step {}",
                scheduler.time(),
                wafer.id,
                self.step.seq_id
            );
            state
                .get_mut(self.log)
                .expect("Cannot find wafer log")
                .drop_wafer(wafer, "rejected between stations");
        }
    }
}

impl Component for Station {
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
                    self.handle_arrival(wafer, self_id, scheduler, state);
                }
            }
            Event::Granted { wafer, instance } => {
                let request = match self.pending.remove(&wafer) {
                    Some(request) => request,
                    None => return,
                };
                let grant = state
                    .get_mut(self.instances[instance].1)
                    .expect("Cannot find station instance")
                    .claim(request);
                match grant {
                    Some(grant) => {
                        self.start_processing(wafer, instance, grant, self_id, scheduler, state);
                    }
                    None => {
                        log::error!(
                            "station {} lost an assignment for step {}",
                            self.step.station,
                            self.step.seq_id
                        );
                    }
                }
            }
            Event::Done {
                wafer: key,
                instance,
                started,
            } => {
                let (mut wafer, _) = state.remove(key).expect("Cannot find parked wafer");
                let grant = self.busy.remove(&key).expect("Cannot find held grant");
                let end = scheduler.time();
                let (instance_name, resource) = self.instances[instance].clone();
                state
                    .get_mut(resource)
                    .expect("Cannot find station instance")
                    .release(scheduler, grant);
                state
                    .get_mut(self.stats)
                    .expect("Cannot find station stats")
                    .busy += end - started;
                state
                    .get_mut(self.log)
                    .expect("Cannot find wafer log")
                    .record(ProcessingRecord {
                        wafer: wafer.id,
                        lot: wafer.lot,
                        station: self.step.station.clone(),
                        seq: self.step.seq_id,
                        resource: instance_name,
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
