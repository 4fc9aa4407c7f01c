use desim::{Component, ComponentId, Key, QueueId, Scheduler, State};

use crate::{NodeStats, Wafer, WaferLog};

/// Sink events.
#[derive(Debug, Copy, Clone)]
pub enum Event {
    /// A wafer was pushed into the inbound queue.
    Arrival,
}

/// Terminal node; wafers arriving here have completed the flow.
pub struct Sink {
    incoming: QueueId<Wafer>,
    log: Key<WaferLog>,
    stats: Key<NodeStats>,
}

impl Sink {
    /// Constructs a sink feeding the wafer log.
    #[must_use]
    pub fn new(incoming: QueueId<Wafer>, log: Key<WaferLog>, stats: Key<NodeStats>) -> Self {
        Self {
            incoming,
            log,
            stats,
        }
    }
}

impl Component for Sink {
    type Event = Event;

    fn process_event(
        &mut self,
        _self_id: ComponentId<Event>,
        event: &Event,
        scheduler: &mut Scheduler,
        state: &mut State,
    ) {
        let Event::Arrival = event;
        while let Some(wafer) = state.recv(self.incoming) {
            log::debug!(
                "[{:?}] wafer {} completed the flow",
                scheduler.time(),
                wafer.id
            );
            {
                let stats = state.get_mut(self.stats).expect("Cannot find sink stats");
                stats.enter();
                stats.exit();
            }
            state
                .get_mut(self.log)
                .expect("Cannot find wafer log")
                .finish(wafer);
        }
    }
}
