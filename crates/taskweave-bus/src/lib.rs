//! Priority-ordered publish/subscribe event bus for Taskweave.
//!
//! Every Taskweave component talks through the bus: the workflow engine emits
//! lifecycle events, executors receive `task.dispatched` and answer with
//! `task.result`, and observers (journals, metrics) subscribe to whatever they
//! need.
//!
//! # Main types
//!
//! - [`EventBus`]: Sync and async subscribers, bounded queue with backpressure.
//! - [`Event`]: Immutable message with type tag, priority and correlation id.
//! - [`BusConfig`]: Queue capacity, history size and handler timeout.
//! - [`event_types`]: Well-known event type tags.

/// Bus implementation and subscription handles.
pub mod bus;
/// Event record and the well-known type tags.
pub mod event;

pub use bus::{BusConfig, BusStats, EventBus, HandlerFuture, SubscriptionHandle};
pub use event::{event_types, Event, EventPriority};
