//! Message bus for participant-to-participant communication
//!
//! The bus offers three delivery primitives over a fixed participant set:
//! - **Unicast:** `publish` to a single participant
//! - **Broadcast:** `publish` to every participant except the sender
//! - **Request/Response:** `request` with correlation id and timeout, answered via `respond`
//!
//! Every published message is appended to a bounded audit log.

mod config;
mod core;
mod handler;
mod messages;

pub use config::{BusConfig, DEFAULT_MAX_LOG_ENTRIES, DEFAULT_REQUEST_TIMEOUT_MS};
pub use self::core::MessageBus;
pub use handler::{MessageHandler, Subscription};
pub use messages::{BusError, BusMetrics, BusResult, LogFilter, Message, MessageType, OutgoingMessage};
