//! Application-facing message model
//!
//! Values and tables, the delivered-message envelope, integer flag constants
//! and the transformer that moves messages across the engine boundary.

pub mod envelope;
pub mod flags;
pub mod transformer;
pub mod value;

pub use envelope::{BasicProperties, Envelope};
pub use flags::*;
pub use transformer::{MessageTransformer, DEFAULT_CONTENT_TYPE};
pub use value::{Decimal, Table, Timestamp, Value, ValueCodec, WireDecimal, WireTable, WireValue};
