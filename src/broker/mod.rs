//! The broker: an engine accepting transport connections and a per-connection
//! protocol state machine.

mod connection;
mod engine;
mod log;

pub use engine::{Engine, EngineOptions, OnError};
pub use log::{LogEvent, Logger};
