use std::mem;
use std::time::Duration;

use desim::{
    Acquire, Component, ComponentId, EventId, Grant, Key, QueueId, RequestId, Resource, Scheduler,
    State, Wakeup,
};
use rand_chacha::ChaCha8Rng;

use crate::{buffer, FlowStep, Link, NodeStats, ProcessingRecord, SeqId, Wafer, WaferLog};

/// Carrier events.
#[derive(Debug, Copy, Clone)]
pub enum Event {
    /// A wafer was pushed into the inbound queue.
    Arrival,
    /// An instance was assigned to the wafer stored under the given key.
    Granted {
        /// Where the wafer's state is stored.
        wafer: Key<WaferState>,
        /// The step the request was issued for.
        step: usize,
        /// Index into the step's instance list.
        instance: usize,
    },
    /// The wafer waited too long for the next step's instances.
    WaitTimeout {
        /// Where the wafer's state is stored.
        wafer: Key<WaferState>,
    },
    /// Processing of the wafer's current step finished.
    StepDone {
        /// Where the wafer's state is stored.
        wafer: Key<WaferState>,
    },
}

/// One unit held by a wafer.
#[derive(Debug)]
struct Held {
    step: usize,
    instance: usize,
    grant: Grant,
    since: Duration,
}

#[derive(Debug)]
enum Phase {
    /// Racing requests to all instances of the step against the wait bound,
    /// possibly while still holding the previous step's instance.
    Acquiring {
        pending: Vec<(usize, RequestId)>,
        timeout: Option<EventId>,
        held: Option<Held>,
    },
    /// Processing on the held instance.
    Processing { held: Held },
}

fn placeholder() -> Phase {
    Phase::Acquiring {
        pending: Vec::new(),
        timeout: None,
        held: None,
    }
}

/// Per-wafer state of the hold-and-wait protocol, stored in the simulation
/// state while the wafer is inside a [`Carrier`].
#[derive(Debug)]
pub struct WaferState {
    wafer: Wafer,
    step: usize,
    phase: Phase,
    retries: u32,
    arrived: Duration,
}

/// Runs a consecutive run of flow steps under the hold-and-wait protocol.
///
/// A wafer keeps the instance of its current step while it races requests to
/// every instance of the next step. Once one is granted, the previous
/// interval is logged, the previous instance is released, and processing
/// continues on the new one; a wafer therefore holds at most two instances,
/// and only at the instant of hand-over. If no instance is granted within
/// the wait bound, all requests are withdrawn and the wafer re-processes its
/// current step on the instance it still holds; a wafer still waiting for
/// its first instance is dropped instead.
pub struct Carrier {
    steps: Vec<FlowStep>,
    instances: Vec<Vec<(String, Key<Resource>)>>,
    next_seq: Option<SeqId>,
    incoming: QueueId<Wafer>,
    outgoing: Link,
    max_wait: Duration,
    max_retries: Option<u32>,
    upstream_ready: Key<Option<ComponentId<buffer::Event>>>,
    rng: ChaCha8Rng,
    log: Key<WaferLog>,
    stats: Key<NodeStats>,
}

impl Carrier {
    /// Constructs a carrier for the given steps.
    ///
    /// `instances` holds, per step, the named resources of the step's
    /// station; it must be parallel to `steps`.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        steps: Vec<FlowStep>,
        instances: Vec<Vec<(String, Key<Resource>)>>,
        next_seq: Option<SeqId>,
        incoming: QueueId<Wafer>,
        outgoing: Link,
        max_wait: Duration,
        max_retries: Option<u32>,
        upstream_ready: Key<Option<ComponentId<buffer::Event>>>,
        rng: ChaCha8Rng,
        log: Key<WaferLog>,
        stats: Key<NodeStats>,
    ) -> Self {
        assert_eq!(steps.len(), instances.len());
        Self {
            steps,
            instances,
            next_seq,
            incoming,
            outgoing,
            max_wait,
            max_retries,
            upstream_ready,
            rng,
            log,
            stats,
        }
    }

    fn return_entry_credit(&self, scheduler: &mut Scheduler, state: &mut State) {
        if let Some(buffer) = state.get(self.upstream_ready).copied().flatten() {
            scheduler.schedule_immediately(buffer, buffer::Event::DownstreamReady);
        }
    }

    /// Logs the held interval, releases the instance, and returns the entry
    /// credit if it was the first step's instance.
    fn log_and_release(
        &mut self,
        wafer: &Wafer,
        held: Held,
        end: Duration,
        scheduler: &mut Scheduler,
        state: &mut State,
    ) {
        let step = &self.steps[held.step];
        let (instance_name, resource) = self.instances[held.step][held.instance].clone();
        state
            .get_mut(self.log)
            .expect("Cannot find wafer log")
            .record(ProcessingRecord {
                wafer: wafer.id,
                lot: wafer.lot,
                station: step.station.clone(),
                seq: step.seq_id,
                resource: instance_name,
                start: held.since,
                end,
            });
        state
            .get_mut(self.stats)
            .expect("Cannot find carrier stats")
            .busy += end - held.since;
        state
            .get_mut(resource)
            .expect("Cannot find carrier instance")
            .release(scheduler, held.grant);
        if held.step == 0 {
            self.return_entry_credit(scheduler, state);
        }
    }

    fn cancel_requests(
        &self,
        step: usize,
        pending: Vec<(usize, RequestId)>,
        scheduler: &mut Scheduler,
        state: &mut State,
    ) {
        for (instance, request) in pending {
            let resource = self.instances[step][instance].1;
            state
                .get_mut(resource)
                .expect("Cannot find carrier instance")
                .cancel(scheduler, request);
        }
    }

    /// Issues requests to every instance of `step`, short-circuiting on an
    /// immediate grant.
    fn begin_acquire(
        &mut self,
        key: Key<WaferState>,
        step: usize,
        carried: Option<Held>,
        self_id: ComponentId<Event>,
        scheduler: &mut Scheduler,
        state: &mut State,
    ) {
        if self.instances[step].is_empty() {
            self.drop_wafer(key, carried, "station has no instances", scheduler, state);
            return;
        }
        let mut pending = Vec::new();
        let mut immediate = None;
        for instance in 0..self.instances[step].len() {
            let resource = self.instances[step][instance].1;
            let acquire = state
                .get_mut(resource)
                .expect("Cannot find carrier instance")
                .request(Wakeup::new(
                    self_id,
                    Event::Granted {
                        wafer: key,
                        step,
                        instance,
                    },
                ));
            match acquire {
                Acquire::Granted(grant) => {
                    immediate = Some((instance, grant));
                    break;
                }
                Acquire::Waiting(request) => pending.push((instance, request)),
            }
        }
        if let Some((instance, grant)) = immediate {
            self.cancel_requests(step, pending, scheduler, state);
            self.finish_acquire(key, step, instance, grant, carried, self_id, scheduler, state);
        } else {
            let timeout = scheduler.schedule(
                self.max_wait,
                self_id,
                Event::WaitTimeout { wafer: key },
            );
            let ws = state.get_mut(key).expect("Cannot find wafer state");
            ws.step = step;
            ws.phase = Phase::Acquiring {
                pending,
                timeout: Some(timeout),
                held: carried,
            };
        }
    }

    /// Hands the wafer over to the granted instance: the previous interval
    /// is logged and its instance released, then processing starts.
    #[allow(clippy::too_many_arguments)]
    fn finish_acquire(
        &mut self,
        key: Key<WaferState>,
        step: usize,
        instance: usize,
        grant: Grant,
        carried: Option<Held>,
        self_id: ComponentId<Event>,
        scheduler: &mut Scheduler,
        state: &mut State,
    ) {
        let now = scheduler.time();
        let wafer = state
            .get(key)
            .expect("Cannot find wafer state")
            .wafer
            .clone();
        match carried {
            Some(held) => self.log_and_release(&wafer, held, now, scheduler, state),
            None => {
                let arrived = state.get(key).expect("Cannot find wafer state").arrived;
                state
                    .get_mut(self.stats)
                    .expect("Cannot find carrier stats")
                    .queue_wait += now - arrived;
            }
        }
        let duration = self.steps[step].sample_duration(&mut self.rng);
        let ws = state.get_mut(key).expect("Cannot find wafer state");
        ws.step = step;
        ws.retries = 0;
        ws.phase = Phase::Processing {
            held: Held {
                step,
                instance,
                grant,
                since: now,
            },
        };
        scheduler.schedule(duration, self_id, Event::StepDone { wafer: key });
    }

    /// Removes the wafer, releasing anything it still holds.
    fn drop_wafer(
        &mut self,
        key: Key<WaferState>,
        held: Option<Held>,
        reason: &str,
        scheduler: &mut Scheduler,
        state: &mut State,
    ) {
        let ws = state.remove(key).expect("Cannot find wafer state");
        log::warn!(
            "[{:?}] dropping wafer {}: {}",
            scheduler.time(),
            ws.wafer.id,
            reason
        );
        match held {
            Some(held) => {
                let end = scheduler.time();
                self.log_and_release(&ws.wafer, held, end, scheduler, state);
            }
            None => self.return_entry_credit(scheduler, state),
        }
        state
            .get_mut(self.stats)
            .expect("Cannot find carrier stats")
            .drop_wafer();
        state
            .get_mut(self.log)
            .expect("Cannot find wafer log")
            .drop_wafer(ws.wafer, reason);
    }

    fn forward(&mut self, mut wafer: Wafer, scheduler: &mut Scheduler, state: &mut State) {
        if let Some(next) = self.next_seq {
            wafer.seq = next;
        }
        state
            .get_mut(self.stats)
            .expect("Cannot find carrier stats")
            .exit();
        if let Err(wafer) = self.outgoing.send(scheduler, state, wafer) {
            log::warn!(
                "[{:?}] wafer {} rejected after hold-and-wait section",
                scheduler.time(),
                wafer.id
            );
            state
                .get_mut(self.log)
                .expect("Cannot find wafer log")
                .drop_wafer(wafer, "rejected after hold-and-wait section");
        }
    }
}

impl Component for Carrier {
    type Event = Event;

    #[allow(clippy::too_many_lines)]
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
                        .expect("Cannot find carrier stats")
                        .enter();
                    if wafer.seq != self.steps[0].seq_id {
                        log::warn!(
                            "[{:?}] wafer {} expects step {} but arrived at step {}; forwarding",
                            scheduler.time(),
                            wafer.id,
                            wafer.seq,
                            self.steps[0].seq_id
                        );
                        state
                            .get_mut(self.stats)
                            .expect("Cannot find carrier stats")
                            .exit();
                        // The wafer occupied an admission slot without ever
                        // taking an instance.
                        self.return_entry_credit(scheduler, state);
                        if let Err(wafer) = self.outgoing.send(scheduler, state, wafer) {
                            state
                                .get_mut(self.log)
                                .expect("Cannot find wafer log")
                                .drop_wafer(wafer, "rejected after hold-and-wait section");
                        }
                        continue;
                    }
                    let key = state.insert(WaferState {
                        wafer,
                        step: 0,
                        phase: placeholder(),
                        retries: 0,
                        arrived: scheduler.time(),
                    });
                    self.begin_acquire(key, 0, None, self_id, scheduler, state);
                }
            }
            Event::Granted {
                wafer: key,
                step,
                instance,
            } => {
                let ws = match state.get_mut(key) {
                    Some(ws) => ws,
                    // The wafer has already left the section.
                    None => return,
                };
                if ws.step != step || matches!(ws.phase, Phase::Processing { .. }) {
                    return;
                }
                let (mut pending, timeout, held) = match mem::replace(&mut ws.phase, placeholder())
                {
                    Phase::Acquiring {
                        pending,
                        timeout,
                        held,
                    } => (pending, timeout, held),
                    Phase::Processing { held } => {
                        ws.phase = Phase::Processing { held };
                        return;
                    }
                };
                let position = pending.iter().position(|(i, _)| *i == instance);
                let request = match position {
                    Some(position) => pending.remove(position).1,
                    None => {
                        ws.phase = Phase::Acquiring {
                            pending,
                            timeout,
                            held,
                        };
                        return;
                    }
                };
                let resource = self.instances[step][instance].1;
                let grant = state
                    .get_mut(resource)
                    .expect("Cannot find carrier instance")
                    .claim(request);
                match grant {
                    Some(grant) => {
                        if let Some(timeout) = timeout {
                            scheduler.cancel(timeout);
                        }
                        self.cancel_requests(step, pending, scheduler, state);
                        self.finish_acquire(
                            key, step, instance, grant, held, self_id, scheduler, state,
                        );
                    }
                    None => {
                        // The assignment was withdrawn; keep waiting on the
                        // remaining requests.
                        let ws = state.get_mut(key).expect("Cannot find wafer state");
                        ws.phase = Phase::Acquiring {
                            pending,
                            timeout,
                            held,
                        };
                    }
                }
            }
            Event::WaitTimeout { wafer: key } => {
                let ws = match state.get_mut(key) {
                    Some(ws) => ws,
                    None => return,
                };
                let (pending, held) = match mem::replace(&mut ws.phase, placeholder()) {
                    Phase::Acquiring { pending, held, .. } => (pending, held),
                    Phase::Processing { held } => {
                        ws.phase = Phase::Processing { held };
                        return;
                    }
                };
                let step = ws.step;
                ws.retries += 1;
                let retries = ws.retries;
                let wafer = ws.wafer.clone();
                self.cancel_requests(step, pending, scheduler, state);
                match held {
                    None => {
                        self.drop_wafer(
                            key,
                            None,
                            "timed out acquiring first station",
                            scheduler,
                            state,
                        );
                    }
                    Some(held) => {
                        if self.max_retries.map_or(false, |max| retries > max) {
                            self.drop_wafer(
                                key,
                                Some(held),
                                "exceeded hold-and-wait retries",
                                scheduler,
                                state,
                            );
                            return;
                        }
                        // Back off: re-process the current step on the
                        // instance the wafer still holds.
                        log::debug!(
                            "[{:?}] wafer {} timed out waiting for step {}; re-processing step {}",
                            scheduler.time(),
                            wafer.id,
                            self.steps[step].seq_id,
                            self.steps[held.step].seq_id
                        );
                        let current = held.step;
                        let duration = self.steps[current].sample_duration(&mut self.rng);
                        let ws = state.get_mut(key).expect("Cannot find wafer state");
                        ws.step = current;
                        ws.phase = Phase::Processing { held };
                        scheduler.schedule(duration, self_id, Event::StepDone { wafer: key });
                    }
                }
            }
            Event::StepDone { wafer: key } => {
                let ws = match state.get_mut(key) {
                    Some(ws) => ws,
                    None => return,
                };
                let held = match mem::replace(&mut ws.phase, placeholder()) {
                    Phase::Processing { held } => held,
                    Phase::Acquiring {
                        pending,
                        timeout,
                        held,
                    } => {
                        // Stale completion from before a hand-over.
                        ws.phase = Phase::Acquiring {
                            pending,
                            timeout,
                            held,
                        };
                        return;
                    }
                };
                if held.step + 1 == self.steps.len() {
                    let ws = state.remove(key).expect("Cannot find wafer state");
                    let end = scheduler.time();
                    self.log_and_release(&ws.wafer, held, end, scheduler, state);
                    self.forward(ws.wafer, scheduler, state);
                } else {
                    let next = held.step + 1;
                    self.begin_acquire(key, next, Some(held), self_id, scheduler, state);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Buffer, Discipline, LotId, NodeHandle, NodeStats, Sink, WaferId};

    use desim::Simulation;
    use rand::SeedableRng;

    #[test]
    fn test_forwarding_an_unexpected_wafer_returns_the_entry_credit() {
        let mut sim = Simulation::default();
        let log = sim.state.insert(WaferLog::new(
            sim.scheduler.clock(),
            Duration::from_secs(3600),
        ));
        let resource = sim.state.insert(Resource::new("A-1", 1));
        let ready = sim.state.insert(None);

        let sink_queue = sim.add_queue::<Wafer>();
        let sink_stats = sim.state.insert(NodeStats::default());
        let sink = sim.add_component(Sink::new(sink_queue, log, sink_stats));

        let carrier_queue = sim.add_queue::<Wafer>();
        let carrier_stats = sim.state.insert(NodeStats::default());
        let step = FlowStep {
            seq_id: SeqId::from(10),
            station: String::from("A"),
            duration_mean: 1.0,
            duration_std: 0.0,
            duration_min: 0.0,
            is_transfer: false,
        };
        let carrier = sim.add_component(Carrier::new(
            vec![step],
            vec![vec![(String::from("A-1"), resource)]],
            None,
            carrier_queue,
            Link::new(sink_queue, NodeHandle::Sink(sink)),
            Duration::from_secs(10),
            None,
            ready,
            ChaCha8Rng::seed_from_u64(17),
            log,
            carrier_stats,
        ));

        let buffer_queue = sim.add_queue::<Wafer>();
        let buffer_stats = sim.state.insert(NodeStats::default());
        let buffer = sim.add_component(Buffer::new(
            buffer_queue,
            Link::new(carrier_queue, NodeHandle::Carrier(carrier)),
            Discipline::Fifo,
            usize::MAX,
            1,
            log,
            buffer_stats,
        ));
        *sim.state.get_mut(ready).unwrap() = Some(buffer);

        // Neither wafer expects the section's step, so both are forwarded
        // straight to the sink. The buffer starts with a single credit; the
        // second wafer only gets released if the first one's credit comes
        // back.
        for id in 0..2_usize {
            let wafer = Wafer {
                id: WaferId::from(id),
                lot: LotId::from(0),
                created: Duration::default(),
                seq: SeqId::from(99),
            };
            sim.state.get_mut(log).unwrap().start(wafer.clone());
            sim.state.send(buffer_queue, wafer).unwrap();
        }
        sim.schedule(Duration::default(), buffer, buffer::Event::Arrival);
        sim.run();

        assert_eq!(sim.state.get(log).unwrap().completed_wafers(), 2);
        let stats = sim.state.get(buffer_stats).unwrap();
        assert_eq!(stats.exited, 2);
        assert_eq!(stats.held, 0);
    }
}
