//! Change notifications for external observers.
//!
//! Events are pushed through a [`broadcast`] channel. Sending never blocks
//! and never fails the caller: with no subscribers the event is dropped, and
//! a subscriber that falls behind skips to the newest events.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::EndpointDefinition;

/// Capacity of the event channel.
const EVENT_CAPACITY: usize = 256;

/// Severity of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Event emitted to observers such as the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MockEvent {
    /// Operator visible log line
    Log {
        message: String,
        level: LogLevel,
        timestamp: String,
    },
    /// A new registry generation was installed
    #[serde(rename_all = "camelCase")]
    EndpointUpdate {
        version: u64,
        endpoints: Vec<EndpointDefinition>,
    },
    /// A request went through the pipeline
    #[serde(rename_all = "camelCase")]
    Request {
        method: String,
        path: String,
        status: u16,
        /// Route pattern of the matched endpoint
        endpoint: Option<String>,
        elapsed_ms: u64,
    },
}

/// Cloneable handle for publishing and subscribing to [`MockEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MockEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<MockEvent> {
        self.tx.subscribe()
    }

    /// Publish an event.
    pub fn emit(&self, event: MockEvent) {
        // Err only means nobody is listening
        let _ = self.tx.send(event);
    }

    /// Log through `tracing` and publish a log event.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => info!("{}", message),
            LogLevel::Warn => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }
        self.emit(MockEvent::Log {
            message,
            level,
            timestamp: timestamp(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Current time as an RFC 3339 UTC timestamp with millisecond precision.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
