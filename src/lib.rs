//! AMQP 0-9-1 client runtime core
//!
//! The runtime sits between an application and an AMQP protocol engine. It
//! owns the connection lifecycle, keeps idle connections alive with
//! client-side heartbeats, and turns engine deliveries into typed
//! [`Envelope`]s (and publish attributes back into engine messages).
//!
//! # Overview
//!
//! - [`client`]: connections, channels, queues, exchanges and consumers
//! - [`heartbeat`]: heartbeat decision logic and scheduling strategies
//! - [`protocol`]: flags, field values, envelopes and message transformation
//! - [`transport`]: the engine traits a protocol implementation provides
//! - [`error`]: the error taxonomy and engine error translation
//! - [`config`]: runtime configuration and per-connection credentials
//!
//! # Quick Start
//!
//! ```rust
//! use amqp_runtime::testing::{MockBroker, MockConnector};
//! use amqp_runtime::{
//!     Channel, ConnectionFactory, Credentials, Exchange, Queue, RuntimeConfig, Table, AUTOACK,
//!     NOPARAM,
//! };
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let connector = Arc::new(MockConnector::with_broker(MockBroker::new()));
//! let factory = ConnectionFactory::from_config(&RuntimeConfig::default(), connector);
//!
//! let mut connection = factory.connection(Credentials::default())?;
//! connection.connect().await?;
//! let channel = Channel::open(&connection).await?;
//!
//! let mut queue = Queue::new(&channel);
//! queue.set_name("greetings")?;
//! queue.declare().await?;
//!
//! Exchange::new(&channel)
//!     .publish("hello", Some("greetings"), NOPARAM, &Table::new())
//!     .await?;
//!
//! let envelope = queue.get(AUTOACK).await?.expect("message was routed");
//! assert_eq!(envelope.body(), Some("hello"));
//! # Ok::<(), amqp_runtime::AmqpError>(())
//! # }).unwrap();
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use client::{
    consumer_fn, Channel, ConnectionFactory, ConnectionState, ConsumeOutcome, Consumer,
    Connection, Exchange, Queue, TuningChange,
};
pub use config::{ConfigError, ConnectionConfig, ConnectionDefaults, Credentials, RuntimeConfig};
pub use error::{AmqpError, AmqpResult, ErrorKind, ExceptionHandler};
pub use heartbeat::{scheduler_for, HeartbeatScheduler};
pub use protocol::*;
pub use transport::{Connector, EngineChannel, EngineConnection, EngineError};
