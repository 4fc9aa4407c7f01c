use std::time::Duration;

use desim::{Component, ComponentId, Key, Scheduler, State};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Exp};

use crate::{Link, LotId, NodeStats, SeqId, Wafer, WaferId, WaferLog};

/// The interval between consecutive lot releases.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LotInterval {
    /// Lots arrive a fixed time apart.
    Fixed(Duration),
    /// Exponentially distributed inter-arrival times with the given mean.
    Exponential(Duration),
}

impl LotInterval {
    fn sample<R: Rng>(&self, rng: &mut R) -> Duration {
        match *self {
            LotInterval::Fixed(interval) => interval,
            LotInterval::Exponential(mean) => match Exp::new(1.0 / mean.as_secs_f64()) {
                Ok(exp) => Duration::from_secs_f64(exp.sample(rng)),
                Err(_) => mean,
            },
        }
    }
}

/// Events processed by [`WaferSource`].
#[derive(Debug, Clone, Copy)]
pub enum Event {
    /// Release the next lot of wafers.
    NextLot,
    /// Release the next wafer of the current lot.
    NextWafer {
        /// The lot being released.
        lot: LotId,
        /// How many wafers of the lot are still to be released, including
        /// this one.
        remaining: usize,
    },
}

/// Releases wafers into the line, one lot at a time.
///
/// A lot of `lot_size` wafers is released at each lot interval; within a
/// lot, consecutive wafers are separated by a small uniform random stagger.
pub struct WaferSource {
    outgoing: Link,
    lot_size: usize,
    interval: LotInterval,
    stagger_max: Duration,
    max_lots: Option<usize>,
    first_seq: SeqId,
    lots_released: usize,
    next_wafer_id: usize,
    rng: ChaCha8Rng,
    log: Key<WaferLog>,
    stats: Key<NodeStats>,
}

impl WaferSource {
    /// Constructs a source releasing wafers through `outgoing`.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        outgoing: Link,
        lot_size: usize,
        interval: LotInterval,
        stagger_max: Duration,
        max_lots: Option<usize>,
        first_seq: SeqId,
        rng: ChaCha8Rng,
        log: Key<WaferLog>,
        stats: Key<NodeStats>,
    ) -> Self {
        Self {
            outgoing,
            lot_size,
            interval,
            stagger_max,
            max_lots,
            first_seq,
            lots_released: 0,
            next_wafer_id: 0,
            rng,
            log,
            stats,
        }
    }

    fn release_wafer(&mut self, lot: LotId, scheduler: &mut Scheduler, state: &mut State) {
        let wafer = Wafer {
            id: WaferId::from(self.next_wafer_id),
            lot,
            created: scheduler.time(),
            seq: self.first_seq,
        };
        self.next_wafer_id += 1;
        state
            .get_mut(self.log)
            .expect("Cannot find wafer log")
            .start(wafer.clone());
        state
            .get_mut(self.stats)
            .expect("Cannot find source stats")
            .enter();
        match self.outgoing.send(scheduler, state, wafer) {
            Ok(()) => {
                state
                    .get_mut(self.stats)
                    .expect("Cannot find source stats")
                    .exit();
            }
            Err(wafer) => {
                log::warn!(
                    "[{:?}] wafer {} rejected at the line entry",
                    scheduler.time(),
                    wafer.id
                );
                state
                    .get_mut(self.stats)
                    .expect("Cannot find source stats")
                    .reject();
                state
                    .get_mut(self.log)
                    .expect("Cannot find wafer log")
                    .drop_wafer(wafer, "rejected at line entry");
            }
        }
    }

    fn stagger(&mut self) -> Duration {
        if self.stagger_max.as_secs_f64() > 0.0 {
            Duration::from_secs_f64(self.rng.gen_range(0.0..self.stagger_max.as_secs_f64()))
        } else {
            Duration::default()
        }
    }
}

impl Component for WaferSource {
    type Event = Event;

    fn process_event(
        &mut self,
        self_id: ComponentId<Event>,
        event: &Event,
        scheduler: &mut Scheduler,
        state: &mut State,
    ) {
        match *event {
            Event::NextLot => {
                if let Some(max_lots) = self.max_lots {
                    if self.lots_released >= max_lots {
                        return;
                    }
                }
                let lot = LotId::from(self.lots_released);
                self.lots_released += 1;
                log::debug!("[{:?}] releasing lot {}", scheduler.time(), lot);
                scheduler.schedule_immediately(
                    self_id,
                    Event::NextWafer {
                        lot,
                        remaining: self.lot_size,
                    },
                );
                let interval = self.interval.sample(&mut self.rng);
                scheduler.schedule(interval, self_id, Event::NextLot);
            }
            Event::NextWafer { lot, remaining } => {
                if remaining == 0 {
                    return;
                }
                self.release_wafer(lot, scheduler, state);
                if remaining > 1 {
                    let stagger = self.stagger();
                    scheduler.schedule(
                        stagger,
                        self_id,
                        Event::NextWafer {
                            lot,
                            remaining: remaining - 1,
                        },
                    );
                }
            }
        }
    }
}
