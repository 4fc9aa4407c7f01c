use std::fmt;
use std::time::Duration;

use crate::{Component, ComponentId, Components, EventId, QueueId, Scheduler, State};

/// All pieces of a simulation: the value store, the event scheduler, and the
/// component registry.
///
/// `state` and `scheduler` are public so that callbacks and set-up code can
/// borrow them independently.
#[derive(Default)]
pub struct Simulation {
    /// The value store shared by all components.
    pub state: State,
    /// The event scheduler and simulation clock.
    pub scheduler: Scheduler,
    components: Components,
}

impl Simulation {
    /// Registers `component` and returns its typed identifier.
    pub fn add_component<C: Component + 'static>(&mut self, component: C) -> ComponentId<C::Event> {
        self.components.add(component)
    }

    /// Creates an unbounded queue in the state.
    pub fn add_queue<V: 'static>(&mut self) -> QueueId<V> {
        self.state.new_queue()
    }

    /// Creates a bounded queue in the state.
    pub fn add_bounded_queue<V: 'static>(&mut self, capacity: usize) -> QueueId<V> {
        self.state.new_bounded_queue(capacity)
    }

    /// Schedules `event` to fire at the current time plus `delay`.
    pub fn schedule<E: fmt::Debug + 'static>(
        &mut self,
        delay: Duration,
        component: ComponentId<E>,
        event: E,
    ) -> EventId {
        self.scheduler.schedule(delay, component, event)
    }

    /// Fires the next scheduled event. Returns `false` when no events are
    /// left.
    pub fn step(&mut self) -> bool {
        match self.scheduler.pop() {
            Some(entry) => {
                self.components.process(
                    entry.component_idx(),
                    entry.event(),
                    &mut self.scheduler,
                    &mut self.state,
                );
                true
            }
            None => false,
        }
    }

    /// Runs until no scheduled events are left.
    pub fn run(&mut self) {
        while self.step() {}
    }

    /// Runs until the event queue is exhausted or the next event is due
    /// after `horizon`. Events due exactly at the horizon still fire.
    pub fn run_until(&mut self, horizon: Duration) {
        while let Some(due) = self.scheduler.peek_time() {
            if due > horizon {
                break;
            }
            self.step();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::Key;

    #[derive(Debug)]
    struct Ball;

    struct Player {
        // The opponent's ID is not known when the first player is built, so
        // it is looked up in the state instead.
        opponent: Key<Option<ComponentId<Ball>>>,
        hits: QueueId<&'static str>,
        name: &'static str,
    }

    impl Component for Player {
        type Event = Ball;

        fn process_event(
            &mut self,
            _self_id: ComponentId<Ball>,
            _event: &Ball,
            scheduler: &mut Scheduler,
            state: &mut State,
        ) {
            let _ = state.send(self.hits, self.name);
            if let Some(Some(opponent)) = state.get(self.opponent) {
                scheduler.schedule(Duration::from_secs(1), *opponent, Ball);
            }
        }
    }

    #[test]
    fn test_ping_pong_until_horizon() {
        let mut simulation = Simulation::default();
        let hits = simulation.add_queue::<&'static str>();
        let to_pong = simulation.state.insert(None);
        let to_ping = simulation.state.insert(None);
        let ping = simulation.add_component(Player {
            opponent: to_pong,
            hits,
            name: "ping",
        });
        let pong = simulation.add_component(Player {
            opponent: to_ping,
            hits,
            name: "pong",
        });
        *simulation.state.get_mut(to_pong).unwrap() = Some(pong);
        *simulation.state.get_mut(to_ping).unwrap() = Some(ping);

        simulation.schedule(Duration::default(), ping, Ball);
        simulation.run_until(Duration::from_secs(3));

        assert_eq!(simulation.scheduler.time(), Duration::from_secs(3));
        let mut order = Vec::new();
        while let Some(name) = simulation.state.recv(hits) {
            order.push(name);
        }
        assert_eq!(order, vec!["ping", "pong", "ping", "pong"]);
    }

    #[test]
    fn test_run_drains_all_events() {
        let mut simulation = Simulation::default();
        let hits = simulation.add_queue::<&'static str>();
        let nobody = simulation.state.insert(None);
        let player = simulation.add_component(Player {
            opponent: nobody,
            hits,
            name: "solo",
        });
        for n in 0..5 {
            simulation.schedule(Duration::from_secs(n), player, Ball);
        }
        simulation.run();
        assert!(!simulation.step());
        assert_eq!(simulation.state.len(hits), 5);
    }
}
