#![warn(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications
)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::default_trait_access)]

//! A single-threaded, cooperative discrete-event simulation library.
//!
//! The building blocks are:
//! - a [`Scheduler`] that keeps the simulation clock and a priority queue of
//!   pending events, popping them in `(due time, registration order)` order,
//! - a [`State`] value store with type-safe keys and message queues,
//! - [`Component`]s that receive typed events and react by mutating the state
//!   and scheduling further events,
//! - capacity-limited [`Resource`]s with FIFO or priority pending queues,
//!   grant tokens, and cancellable requests.
//!
//! A callback always runs to completion before the next event fires, so
//! resource-count invariants hold without any locking.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

/// Simulation clock.
pub type Clock = Rc<Cell<Duration>>;

pub use component::{Component, ComponentId, Components};
pub use queue::Queue;
pub use resource::{Acquire, Grant, RequestId, Resource, TimedAcquire, DEFAULT_PRIORITY};
pub use scheduler::{ClockRef, EventEntry, EventId, Scheduler, Wakeup};
pub use simulation::Simulation;
pub use state::{Key, QueueId, State};

mod component;
mod queue;
mod resource;
mod scheduler;
mod simulation;
mod state;
