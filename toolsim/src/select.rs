use desim::{Component, ComponentId, Key, QueueId, Scheduler, State};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::{Link, NodeStats, SeqId, Wafer, WaferLog};

/// Which wafers the select routes into its primary branch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SelectPredicate {
    /// Each wafer is selected independently with this probability.
    Probability(f64),
    /// Every n-th wafer is selected.
    EveryNth {
        /// The sampling period; 1 selects every wafer.
        period: u32,
    },
}

/// Select events.
#[derive(Debug, Copy, Clone)]
pub enum Event {
    /// A wafer was pushed into the inbound queue.
    Arrival,
}

/// Routes each arriving wafer into one of two branches, taking no simulated
/// time.
///
/// Selected wafers continue into the sampled step unchanged; the rest skip
/// it, so their expected step is advanced past it before they are forwarded.
pub struct Select {
    incoming: QueueId<Wafer>,
    selected: Link,
    skipped: Link,
    skip_seq: Option<SeqId>,
    predicate: SelectPredicate,
    seen: u32,
    rng: ChaCha8Rng,
    log: Key<WaferLog>,
    stats: Key<NodeStats>,
}

impl Select {
    /// Constructs a select routing into `selected` or `skipped`.
    ///
    /// `skip_seq` is the step a skipping wafer expects next; `None` leaves
    /// the wafer's step unchanged.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        incoming: QueueId<Wafer>,
        selected: Link,
        skipped: Link,
        skip_seq: Option<SeqId>,
        predicate: SelectPredicate,
        rng: ChaCha8Rng,
        log: Key<WaferLog>,
        stats: Key<NodeStats>,
    ) -> Self {
        Self {
            incoming,
            selected,
            skipped,
            skip_seq,
            predicate,
            seen: 0,
            rng,
            log,
            stats,
        }
    }

    fn selects(&mut self) -> bool {
        match self.predicate {
            SelectPredicate::Probability(probability) => self.rng.gen_bool(probability),
            SelectPredicate::EveryNth { period } => {
                self.seen += 1;
                self.seen % period == 0
            }
        }
    }
}

impl Component for Select {
    type Event = Event;

    fn process_event(
        &mut self,
        _self_id: ComponentId<Event>,
        event: &Event,
        scheduler: &mut Scheduler,
        state: &mut State,
    ) {
        let Event::Arrival = event;
        while let Some(mut wafer) = state.recv(self.incoming) {
            {
                let stats = state
                    .get_mut(self.stats)
                    .expect("Cannot find select stats");
                stats.enter();
                stats.exit();
            }
            let link = if self.selects() {
                self.selected
            } else {
                if let Some(seq) = self.skip_seq {
                    wafer.seq = seq;
                }
                self.skipped
            };
            if let Err(wafer) = link.send(scheduler, state, wafer) {
                log::warn!(
                    "[{:?}] wafer {} rejected at sampling stage",
                    scheduler.time(),
                    wafer.id
                );
                state
                    .get_mut(self.log)
                    .expect("Cannot find wafer log")
                    .drop_wafer(wafer, "rejected at sampling stage");
            }
        }
    }
}
