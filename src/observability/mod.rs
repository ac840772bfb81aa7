//! Observability for the AMQP runtime
//!
//! Structured logging setup and the span macros used across connection,
//! channel, consume and heartbeat code paths.

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

// Span macros for structured logging
pub use logging::{channel_span, connection_span, consume_span, heartbeat_span};
