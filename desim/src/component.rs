use std::any::Any;
use std::fmt;
use std::marker::PhantomData;

use crate::{Scheduler, State};

/// A type-safe identifier of a registered component, generic over the
/// component's event type.
///
/// Issued by [`Components::add`]; used to address events to the component.
pub struct ComponentId<E> {
    pub(crate) id: usize,
    pub(crate) _marker: PhantomData<E>,
}

impl<E> fmt::Debug for ComponentId<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ComponentId").field(&self.id).finish()
    }
}

impl<E> Clone for ComponentId<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            _marker: PhantomData,
        }
    }
}
impl<E> Copy for ComponentId<E> {}

impl<E> PartialEq for ComponentId<E> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl<E> Eq for ComponentId<E> {}

/// Interface of a simulation component.
///
/// The simulation calls [`process_event`](Component::process_event) whenever
/// an event addressed to this component fires. The callback runs to
/// completion before any further event is popped, and may mutate the shared
/// state and schedule new events.
pub trait Component {
    /// Type of the events processed by this component.
    type Event: fmt::Debug + 'static;

    /// Reacts to `event` fired at the current simulation time.
    fn process_event(
        &mut self,
        self_id: ComponentId<Self::Event>,
        event: &Self::Event,
        scheduler: &mut Scheduler,
        state: &mut State,
    );
}

trait ErasedComponent {
    fn process(
        &mut self,
        self_idx: usize,
        event: &dyn Any,
        scheduler: &mut Scheduler,
        state: &mut State,
    );
}

impl<C: Component> ErasedComponent for C {
    fn process(
        &mut self,
        self_idx: usize,
        event: &dyn Any,
        scheduler: &mut Scheduler,
        state: &mut State,
    ) {
        let event = event
            .downcast_ref::<C::Event>()
            .expect("component received an event of a foreign type");
        let self_id = ComponentId {
            id: self_idx,
            _marker: PhantomData,
        };
        self.process_event(self_id, event, scheduler, state);
    }
}

/// Registry of all components taking part in a simulation.
///
/// Components are stored type-erased; the typed [`ComponentId`] returned at
/// registration is the only handle needed to address them afterwards.
#[derive(Default)]
pub struct Components {
    components: Vec<Box<dyn ErasedComponent>>,
}

impl Components {
    /// Registers `component` and returns its typed identifier.
    pub fn add<C: Component + 'static>(&mut self, component: C) -> ComponentId<C::Event> {
        let id = self.components.len();
        self.components.push(Box::new(component));
        ComponentId {
            id,
            _marker: PhantomData,
        }
    }

    /// Delivers `event` to the component at index `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of range or the event type does not match the
    /// component's event type. Neither can happen for events scheduled
    /// through a [`ComponentId`] issued by this registry.
    pub(crate) fn process(
        &mut self,
        idx: usize,
        event: &dyn Any,
        scheduler: &mut Scheduler,
        state: &mut State,
    ) {
        self.components[idx].process(idx, event, scheduler, state);
    }

    /// The number of registered components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// `true` if no components have been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}
