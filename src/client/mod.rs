//! Application-facing AMQP objects
//!
//! [`Connection`] owns the engine connection. [`Channel`] borrows nothing from
//! it and notices a dropped connection through a weak bridge. [`Queue`] and
//! [`Exchange`] borrow a channel and are cheap to create per operation.

pub mod channel;
pub mod connection;
pub mod consumer;
pub mod exchange;
pub mod factory;
pub mod queue;

pub use channel::{Channel, ChannelBridge, Prefetch};
pub use connection::{Connection, ConnectionBridge, ConnectionState, TuningChange};
pub use consumer::{consumer_fn, ConsumeOutcome, Consumer, ConsumerRegistry, FnConsumer};
pub use exchange::{Exchange, EXCHANGE_DIRECT, EXCHANGE_FANOUT, EXCHANGE_HEADERS, EXCHANGE_TOPIC};
pub use factory::ConnectionFactory;
pub use queue::{Queue, MAX_NAME_LENGTH};
