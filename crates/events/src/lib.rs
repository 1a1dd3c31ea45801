//! Run lifecycle events
//!
//! This crate provides the event bus and event types used to observe an
//! operation while it runs.

mod bus;
mod types;

pub use bus::{EventBus, Subscriber};
pub use types::*;
