//! Crewbus - in-process messaging and shared state for a crew of test agents
//!
//! A fixed set of participants (a test author, a documenter, an analyst and a
//! coordinator) cooperate on automated browser testing. Crewbus gives them a typed
//! message bus and a shared, observable context store.
//!
//! # Modules
//!
//! - [`participant`] - The fixed participant identities and the broadcast recipient
//! - [`bus`] - Unicast, broadcast and correlated request/response with a bounded audit log
//! - [`context`] - Shared test, agent and metadata state with change notifications
//! - [`coordinator`] - Worker registration and task dispatch over the bus
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod bus;
pub mod cli;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod participant;

pub use bus::{BusConfig, BusError, BusResult, LogFilter, Message, MessageBus, MessageType, OutgoingMessage};
pub use config::Config;
pub use context::{Channel, ContextStore, SharedContext};
pub use coordinator::{Coordinator, Worker};
pub use participant::{Participant, Recipient};
