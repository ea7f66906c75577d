//! Coordinator module - drives workers over the bus and records their activity
//!
//! The Coordinator subscribes one handler per registered [`Worker`]. Task requests are
//! executed, timed, recorded in the [`ContextStore`](crate::context::ContextStore) and
//! answered on the bus; status queries are answered from the store; everything else is
//! handed to the worker as an event.

mod core;
mod worker;

pub use self::core::Coordinator;
pub use worker::Worker;
