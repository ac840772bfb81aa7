//! Application values and their protocol-engine representation
//!
//! [`Value`] is what callers put in argument tables, headers and publish
//! attributes. [`WireValue`] is the representation the protocol engine
//! consumes. [`ValueCodec`] converts between the two, recursing through tables
//! and arrays while preserving entry order.
//!
//! Two conversions are not plain pass-through:
//!
//! - [`Decimal`] is `(exponent, significand)` while [`WireDecimal`] is
//!   `(significand, exponent)`. The positional swap is part of the engine
//!   contract and must not be "fixed".
//! - [`Timestamp`] is whole Unix seconds; on the wire it becomes a calendar
//!   time. Sub-second precision is truncated, never rounded.

use crate::error::{AmqpError, AmqpResult};
use chrono::{DateTime, Utc};
use std::fmt;

/// Fixed-point decimal as exposed to applications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decimal {
    exponent: u8,
    significand: u32,
}

impl Decimal {
    pub const EXPONENT_MIN: i64 = 0;
    pub const EXPONENT_MAX: i64 = 255;
    pub const SIGNIFICAND_MIN: i64 = 0;
    pub const SIGNIFICAND_MAX: i64 = 4_294_967_295;

    /// Build a decimal, rejecting an exponent or significand out of range
    pub fn new(exponent: i64, significand: i64) -> AmqpResult<Self> {
        if exponent < Self::EXPONENT_MIN {
            return Err(AmqpError::value(format!(
                "Decimal exponent value must be unsigned, {exponent} given."
            )));
        }
        if exponent > Self::EXPONENT_MAX {
            return Err(AmqpError::value(format!(
                "Decimal exponent value must be less than {}, {exponent} given.",
                Self::EXPONENT_MAX
            )));
        }
        if significand < Self::SIGNIFICAND_MIN {
            return Err(AmqpError::value(format!(
                "Decimal significand value must be unsigned, {significand} given."
            )));
        }
        if significand > Self::SIGNIFICAND_MAX {
            return Err(AmqpError::value(format!(
                "Decimal significand value must be less than {}, {significand} given.",
                Self::SIGNIFICAND_MAX
            )));
        }

        Ok(Self {
            exponent: exponent as u8,
            significand: significand as u32,
        })
    }

    pub fn exponent(&self) -> u8 {
        self.exponent
    }

    pub fn significand(&self) -> u32 {
        self.significand
    }
}

/// Unix timestamp in whole seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp {
    seconds: u64,
}

impl Timestamp {
    pub const MIN: f64 = 0.0;
    /// 2^64
    pub const MAX: f64 = 18_446_744_073_709_551_616.0;

    /// Build a timestamp from fractional seconds, truncating the fraction
    pub fn new(seconds: f64) -> AmqpResult<Self> {
        if seconds.is_nan() || seconds < Self::MIN {
            return Err(AmqpError::value(format!(
                "The timestamp parameter must be greater than {}.",
                Self::MIN
            )));
        }
        if seconds > Self::MAX {
            return Err(AmqpError::value(format!(
                "The timestamp parameter must be less than {}.",
                Self::MAX
            )));
        }

        // `as` saturates, so exactly 2^64 lands on u64::MAX
        Ok(Self {
            seconds: seconds.trunc() as u64,
        })
    }

    pub fn from_secs(seconds: u64) -> Self {
        Self { seconds }
    }

    pub fn as_secs(&self) -> u64 {
        self.seconds
    }

    fn to_datetime(self) -> DateTime<Utc> {
        i64::try_from(self.seconds)
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn from_datetime(datetime: &DateTime<Utc>) -> Self {
        Self {
            seconds: u64::try_from(datetime.timestamp()).unwrap_or(0),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.seconds)
    }
}

/// Insertion-ordered string-keyed table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    entries: Vec<(String, Value)>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace, keeping the original position of an existing key
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Table {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut table = Table::new();
        for (key, value) in iter {
            table.insert(key, value);
        }
        table
    }
}

impl IntoIterator for Table {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Application-facing value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Decimal(Decimal),
    Timestamp(Timestamp),
    Table(Table),
    Array(Vec<Value>),
}

impl Value {
    /// Name used in validation messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Decimal(_) => "decimal",
            Value::Timestamp(_) => "timestamp",
            Value::Table(_) => "table",
            Value::Array(_) => "array",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn is_empty_string(&self) -> bool {
        matches!(self, Value::String(s) if s.is_empty())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Int(v.into())
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<Timestamp> for Value {
    fn from(v: Timestamp) -> Self {
        Value::Timestamp(v)
    }
}

impl From<Table> for Value {
    fn from(v: Table) -> Self {
        Value::Table(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Decimal as the protocol engine lays it out: `(value, scale)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireDecimal(pub u32, pub u8);

impl WireDecimal {
    pub fn new(value: u32, scale: u8) -> Self {
        Self(value, scale)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn scale(&self) -> u8 {
        self.1
    }
}

/// Ordered field table in engine form
pub type WireTable = Vec<(String, WireValue)>;

/// Protocol-engine native value
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Void,
    Bool(bool),
    Long(i64),
    Double(f64),
    LongString(String),
    Decimal(WireDecimal),
    Timestamp(DateTime<Utc>),
    Table(WireTable),
    Array(Vec<WireValue>),
}

/// Converts values across the engine boundary
pub struct ValueCodec;

impl ValueCodec {
    /// Application value to engine value
    pub fn to_wire(value: &Value) -> WireValue {
        match value {
            Value::Null => WireValue::Void,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Int(i) => WireValue::Long(*i),
            Value::Float(f) => WireValue::Double(*f),
            Value::String(s) => WireValue::LongString(s.clone()),
            Value::Decimal(d) => WireValue::Decimal(WireDecimal::new(d.significand, d.exponent)),
            Value::Timestamp(t) => WireValue::Timestamp(t.to_datetime()),
            Value::Table(t) => WireValue::Table(Self::table_to_wire(t)),
            Value::Array(items) => WireValue::Array(items.iter().map(Self::to_wire).collect()),
        }
    }

    /// Engine value to application value
    pub fn from_wire(value: &WireValue) -> Value {
        match value {
            WireValue::Void => Value::Null,
            WireValue::Bool(b) => Value::Bool(*b),
            WireValue::Long(i) => Value::Int(*i),
            WireValue::Double(f) => Value::Float(*f),
            WireValue::LongString(s) => Value::String(s.clone()),
            WireValue::Decimal(d) => Value::Decimal(Decimal {
                exponent: d.scale(),
                significand: d.value(),
            }),
            WireValue::Timestamp(dt) => Value::Timestamp(Timestamp::from_datetime(dt)),
            WireValue::Table(t) => Value::Table(Self::table_from_wire(t)),
            WireValue::Array(items) => Value::Array(items.iter().map(Self::from_wire).collect()),
        }
    }

    pub fn table_to_wire(table: &Table) -> WireTable {
        table
            .iter()
            .map(|(key, value)| (key.to_string(), Self::to_wire(value)))
            .collect()
    }

    pub fn table_from_wire(table: &[(String, WireValue)]) -> Table {
        Table {
            entries: table
                .iter()
                .map(|(key, value)| (key.clone(), Self::from_wire(value)))
                .collect(),
        }
    }
}
