//! Protocol-engine abstraction
//!
//! The runtime never encodes AMQP frames itself. Everything below the
//! connection/channel level is reached through the traits in this module so
//! that any engine (a socket-backed driver, or the in-memory engine in
//! [`crate::testing`]) can be injected.

use crate::config::ConnectionConfig;
use crate::protocol::value::{WireTable, WireValue};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Property name carrying the header table, kept apart from plain properties
pub const HEADERS_PROPERTY: &str = "application_headers";

/// Message properties as the engine exposes them
pub type PropertyMap = BTreeMap<String, WireValue>;

/// Delivery metadata attached by the broker
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryInfo {
    /// `None` for messages fetched with `basic.get`
    pub consumer_tag: Option<String>,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

/// Engine-level message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawMessage {
    pub body: Vec<u8>,
    pub properties: PropertyMap,
    pub delivery: DeliveryInfo,
}

/// Errors raised by the protocol engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Broker closed the channel with a reply code
    #[error("{reply_text}")]
    ChannelClosed { reply_code: u16, reply_text: String },
    /// Broker or socket closed the connection
    #[error("{reply_text}")]
    ConnectionClosed { reply_code: u16, reply_text: String },
    #[error("Operation timed out")]
    Timeout,
    #[error("Missed server heartbeat")]
    HeartbeatMissed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Runtime(String),
}

impl EngineError {
    /// Numeric reply code, zero when the error carries none
    pub fn reply_code(&self) -> u16 {
        match self {
            EngineError::ChannelClosed { reply_code, .. }
            | EngineError::ConnectionClosed { reply_code, .. } => *reply_code,
            _ => 0,
        }
    }

    /// Stable name of the error class for diagnostics
    pub fn class_name(&self) -> &'static str {
        match self {
            EngineError::ChannelClosed { .. } => "ChannelClosed",
            EngineError::ConnectionClosed { .. } => "ConnectionClosed",
            EngineError::Timeout => "Timeout",
            EngineError::HeartbeatMissed => "HeartbeatMissed",
            EngineError::Io(_) => "Io",
            EngineError::Runtime(_) => "Runtime",
        }
    }
}

/// Which half of the socket a timeout applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketDirection {
    Receive,
    Send,
}

/// Socket timeout decomposed the way OS socket options expect it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketTimeout {
    pub seconds: u64,
    pub microseconds: u32,
}

impl SocketTimeout {
    /// Split fractional seconds into whole seconds and microseconds
    pub fn from_secs_f64(secs: f64) -> Self {
        let secs = secs.max(0.0);
        let whole = secs.trunc();
        let micros = ((secs - whole) * 1_000_000.0).round() as u32;
        Self {
            seconds: whole as u64,
            microseconds: micros.min(999_999),
        }
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.seconds) + Duration::from_micros(self.microseconds.into())
    }
}

/// Arguments for `queue.declare`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDeclare {
    pub queue: String,
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub no_wait: bool,
    pub arguments: WireTable,
}

/// Reply to `queue.declare`; fields are absent when the engine got no reply
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDeclareOk {
    pub queue: Option<String>,
    pub message_count: Option<u32>,
    pub consumer_count: Option<u32>,
}

/// Arguments for `exchange.declare`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExchangeDeclare {
    pub exchange: String,
    pub kind: String,
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub no_wait: bool,
    pub arguments: WireTable,
}

/// Arguments shared by queue and exchange (un)bind
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Binding {
    /// Queue name for queue bindings, destination exchange otherwise
    pub destination: String,
    pub source: String,
    pub routing_key: String,
    pub no_wait: bool,
    pub arguments: WireTable,
}

/// Arguments for `basic.consume`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicConsume {
    pub queue: String,
    /// Empty lets the broker assign a tag
    pub consumer_tag: String,
    pub no_local: bool,
    pub no_ack: bool,
    pub exclusive: bool,
    pub no_wait: bool,
    pub arguments: WireTable,
}

/// Routing part of `basic.publish`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicPublish {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
}

/// Opens engine connections
///
/// Injected into connections so tests and alternative engines can replace
/// the real driver.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection using the given configuration
    async fn open(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn EngineConnection>, EngineError>;
}

/// One live engine connection
#[async_trait]
pub trait EngineConnection: Send + Sync {
    /// Whether the underlying socket is still usable
    fn is_connected(&self) -> bool;

    /// Whether a frame write is currently in flight
    fn is_writing(&self) -> bool;

    /// Wall-clock time of the last frame sent or received
    fn last_activity(&self) -> DateTime<Utc>;

    /// Negotiated heartbeat interval in seconds, 0 when disabled
    fn heartbeat(&self) -> u16;

    /// Send a heartbeat frame and fail if the broker's heartbeats were missed
    async fn check_heartbeat(&self) -> Result<(), EngineError>;

    /// Open a new channel on this connection
    async fn open_channel(&self) -> Result<Arc<dyn EngineChannel>, EngineError>;

    /// Reconfigure a socket timeout in place
    fn set_socket_timeout(
        &self,
        direction: SocketDirection,
        timeout: SocketTimeout,
    ) -> Result<(), EngineError>;

    /// Close the connection
    async fn close(&self) -> Result<(), EngineError>;
}

/// One engine channel
#[async_trait]
pub trait EngineChannel: Send + Sync {
    fn channel_id(&self) -> u16;

    fn is_open(&self) -> bool;

    async fn basic_qos(
        &self,
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    ) -> Result<(), EngineError>;

    async fn basic_publish(
        &self,
        message: RawMessage,
        publish: BasicPublish,
    ) -> Result<(), EngineError>;

    /// Subscribe and return the consumer tag in effect
    async fn basic_consume(&self, consume: BasicConsume) -> Result<String, EngineError>;

    async fn basic_cancel(&self, consumer_tag: &str, no_wait: bool) -> Result<(), EngineError>;

    /// Fetch one message without subscribing
    async fn basic_get(
        &self,
        queue: &str,
        no_ack: bool,
    ) -> Result<Option<RawMessage>, EngineError>;

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), EngineError>;

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), EngineError>;

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), EngineError>;

    async fn basic_recover(&self, requeue: bool) -> Result<(), EngineError>;

    async fn exchange_declare(&self, declare: ExchangeDeclare) -> Result<(), EngineError>;

    async fn exchange_delete(
        &self,
        exchange: &str,
        if_unused: bool,
        no_wait: bool,
    ) -> Result<(), EngineError>;

    async fn exchange_bind(&self, binding: Binding) -> Result<(), EngineError>;

    async fn exchange_unbind(&self, binding: Binding) -> Result<(), EngineError>;

    async fn queue_declare(&self, declare: QueueDeclare) -> Result<QueueDeclareOk, EngineError>;

    async fn queue_bind(&self, binding: Binding) -> Result<(), EngineError>;

    async fn queue_unbind(&self, binding: Binding) -> Result<(), EngineError>;

    /// Returns the number of purged messages
    async fn queue_purge(&self, queue: &str) -> Result<u32, EngineError>;

    /// Returns the number of messages deleted with the queue
    async fn queue_delete(
        &self,
        queue: &str,
        if_unused: bool,
        if_empty: bool,
        no_wait: bool,
    ) -> Result<u32, EngineError>;

    async fn tx_select(&self) -> Result<(), EngineError>;

    async fn tx_commit(&self) -> Result<(), EngineError>;

    async fn tx_rollback(&self) -> Result<(), EngineError>;

    /// Block until the next delivery, or `EngineError::Timeout` once `timeout` elapses
    ///
    /// `None` waits without bound.
    async fn wait(&self, timeout: Option<Duration>) -> Result<RawMessage, EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_timeout_decomposition() {
        let timeout = SocketTimeout::from_secs_f64(2.5);
        assert_eq!(timeout.seconds, 2);
        assert_eq!(timeout.microseconds, 500_000);
        assert_eq!(timeout.as_duration(), Duration::from_millis(2500));

        let zero = SocketTimeout::from_secs_f64(0.0);
        assert_eq!(zero, SocketTimeout { seconds: 0, microseconds: 0 });
    }

    #[test]
    fn test_engine_error_codes() {
        let err = EngineError::ChannelClosed {
            reply_code: 404,
            reply_text: "NOT_FOUND".to_string(),
        };
        assert_eq!(err.reply_code(), 404);
        assert_eq!(err.class_name(), "ChannelClosed");
        assert_eq!(EngineError::Timeout.reply_code(), 0);
    }
}
