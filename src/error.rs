//! Error taxonomy for the AMQP runtime
//!
//! Every public operation fails with an [`AmqpError`]. Validation errors are
//! raised before any engine call. Engine failures go through
//! [`ExceptionHandler`], which logs the full engine detail and re-raises a
//! reduced, stable message in the caller's error kind.

use crate::protocol::envelope::Envelope;
use crate::transport::EngineError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::error;

/// Trailing `(class, method)` pair some engines append to reply texts
static TRAILING_METHOD_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\s*\(\d+,\s*\d+\)\s*$").expect("trailing method id pattern is valid")
});

/// Main error type for runtime operations
#[derive(Debug, Error)]
pub enum AmqpError {
    #[error("{message}")]
    Connection { message: String },

    #[error("{message}")]
    Channel { message: String },

    #[error("{message}")]
    Exchange { message: String },

    #[error("{message}")]
    Queue { message: String },

    /// A delivery that could not be handled; carries the offending envelope
    #[error("{message}")]
    Envelope {
        message: String,
        envelope: Box<Envelope>,
    },

    #[error("{message}")]
    Value { message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl AmqpError {
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn channel<S: Into<String>>(message: S) -> Self {
        Self::Channel {
            message: message.into(),
        }
    }

    pub fn exchange<S: Into<String>>(message: S) -> Self {
        Self::Exchange {
            message: message.into(),
        }
    }

    pub fn queue<S: Into<String>>(message: S) -> Self {
        Self::Queue {
            message: message.into(),
        }
    }

    pub fn value<S: Into<String>>(message: S) -> Self {
        Self::Value {
            message: message.into(),
        }
    }

    pub fn envelope<S: Into<String>>(message: S, envelope: Envelope) -> Self {
        Self::Envelope {
            message: message.into(),
            envelope: Box::new(envelope),
        }
    }

    /// Kind of this error, `None` for configuration errors
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            AmqpError::Connection { .. } => Some(ErrorKind::Connection),
            AmqpError::Channel { .. } => Some(ErrorKind::Channel),
            AmqpError::Exchange { .. } => Some(ErrorKind::Exchange),
            AmqpError::Queue { .. } => Some(ErrorKind::Queue),
            AmqpError::Envelope { .. } => Some(ErrorKind::Envelope),
            AmqpError::Value { .. } => Some(ErrorKind::Value),
            AmqpError::Config(_) => None,
        }
    }

    /// The envelope attached to an envelope error
    pub fn envelope_ref(&self) -> Option<&Envelope> {
        match self {
            AmqpError::Envelope { envelope, .. } => Some(envelope),
            _ => None,
        }
    }
}

/// Error category an operation reports engine failures as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Channel,
    Exchange,
    Queue,
    Envelope,
    Value,
}

impl ErrorKind {
    /// Build an error of this kind
    ///
    /// Envelope errors built this way carry a bare envelope.
    pub fn into_error(self, message: String) -> AmqpError {
        match self {
            ErrorKind::Connection => AmqpError::connection(message),
            ErrorKind::Channel => AmqpError::channel(message),
            ErrorKind::Exchange => AmqpError::exchange(message),
            ErrorKind::Queue => AmqpError::queue(message),
            ErrorKind::Envelope => AmqpError::envelope(message, Envelope::new()),
            ErrorKind::Value => AmqpError::value(message),
        }
    }
}

/// Result type for runtime operations
pub type AmqpResult<T> = Result<T, AmqpError>;

/// Translates engine failures into [`AmqpError`]
pub struct ExceptionHandler;

impl ExceptionHandler {
    /// Translate a failure from an ordinary (non-consuming) operation
    pub fn translate(err: EngineError, operation: &str, kind: ErrorKind) -> AmqpError {
        Self::log(&err, operation);
        Self::reduce(err, kind, false)
    }

    /// Translate a failure raised while waiting for deliveries
    pub fn translate_consuming(err: EngineError, operation: &str, kind: ErrorKind) -> AmqpError {
        Self::log(&err, operation);
        Self::reduce(err, kind, true)
    }

    fn log(err: &EngineError, operation: &str) {
        error!(
            operation = operation,
            error_class = err.class_name(),
            reply_code = err.reply_code(),
            "Engine error during {}: {}",
            operation,
            err
        );
    }

    fn reduce(err: EngineError, kind: ErrorKind, consuming: bool) -> AmqpError {
        match err {
            EngineError::Timeout if consuming => AmqpError::queue("Consumer timeout exceed"),
            EngineError::ChannelClosed {
                reply_code,
                reply_text,
            } => kind.into_error(format!(
                "Server channel error: {reply_code}, message: {reply_text}"
            )),
            EngineError::HeartbeatMissed
            | EngineError::Io(_)
            | EngineError::ConnectionClosed { .. } => {
                AmqpError::connection(Self::connection_message(&err))
            }
            other => kind.into_error(Self::connection_message(&other)),
        }
    }

    fn connection_message(err: &EngineError) -> String {
        let text = err.to_string();
        let stripped = TRAILING_METHOD_ID.replace(&text, "");
        format!(
            "Server connection error: {}, message: {}",
            err.reply_code(),
            stripped
        )
    }
}
