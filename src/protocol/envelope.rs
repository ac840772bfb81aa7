//! Immutable snapshot of one delivered message

use super::flags::DELIVERY_MODE_TRANSIENT;
use super::value::{Table, Value};

/// Basic-class message properties with neutral defaults instead of absence
#[derive(Debug, Clone, PartialEq)]
pub struct BasicProperties {
    pub content_type: String,
    pub content_encoding: String,
    pub headers: Table,
    pub delivery_mode: u8,
    pub priority: u8,
    pub correlation_id: String,
    pub reply_to: String,
    pub expiration: String,
    pub message_id: String,
    pub timestamp: u64,
    pub message_type: String,
    pub user_id: String,
    pub app_id: String,
    pub cluster_id: String,
}

impl Default for BasicProperties {
    fn default() -> Self {
        Self {
            content_type: String::new(),
            content_encoding: String::new(),
            headers: Table::new(),
            delivery_mode: DELIVERY_MODE_TRANSIENT,
            priority: 0,
            correlation_id: String::new(),
            reply_to: String::new(),
            expiration: String::new(),
            message_id: String::new(),
            timestamp: 0,
            message_type: String::new(),
            user_id: String::new(),
            app_id: String::new(),
            cluster_id: String::new(),
        }
    }
}

/// A delivered message plus its delivery metadata
///
/// The delivery fields are `None` only on a bare envelope built by hand; the
/// transformer fills every one of them for real deliveries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub(crate) body: Option<String>,
    pub(crate) consumer_tag: Option<String>,
    pub(crate) delivery_tag: Option<u64>,
    pub(crate) exchange_name: Option<String>,
    pub(crate) routing_key: Option<String>,
    pub(crate) redelivered: Option<bool>,
    pub(crate) properties: BasicProperties,
}

impl Envelope {
    /// Bare envelope with no stored body
    pub fn new() -> Self {
        Self::default()
    }

    /// Bare envelope with a stored body
    pub fn with_body(body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
            ..Self::default()
        }
    }

    /// Message body
    ///
    /// No stored body reads as `Some("")`; a stored empty body reads as `None`;
    /// anything else is returned verbatim.
    pub fn body(&self) -> Option<&str> {
        match self.body.as_deref() {
            None => Some(""),
            Some("") => None,
            Some(body) => Some(body),
        }
    }

    pub fn consumer_tag(&self) -> Option<&str> {
        self.consumer_tag.as_deref()
    }

    pub fn delivery_tag(&self) -> Option<u64> {
        self.delivery_tag
    }

    pub fn exchange_name(&self) -> Option<&str> {
        self.exchange_name.as_deref()
    }

    pub fn routing_key(&self) -> Option<&str> {
        self.routing_key.as_deref()
    }

    pub fn is_redelivery(&self) -> Option<bool> {
        self.redelivered
    }

    pub fn properties(&self) -> &BasicProperties {
        &self.properties
    }

    pub fn content_type(&self) -> &str {
        &self.properties.content_type
    }

    pub fn content_encoding(&self) -> &str {
        &self.properties.content_encoding
    }

    pub fn headers(&self) -> &Table {
        &self.properties.headers
    }

    pub fn header(&self, key: &str) -> Option<&Value> {
        self.properties.headers.get(key)
    }

    pub fn has_header(&self, key: &str) -> bool {
        self.properties.headers.contains_key(key)
    }

    pub fn delivery_mode(&self) -> u8 {
        self.properties.delivery_mode
    }

    pub fn priority(&self) -> u8 {
        self.properties.priority
    }

    pub fn correlation_id(&self) -> &str {
        &self.properties.correlation_id
    }

    pub fn reply_to(&self) -> &str {
        &self.properties.reply_to
    }

    pub fn expiration(&self) -> &str {
        &self.properties.expiration
    }

    pub fn message_id(&self) -> &str {
        &self.properties.message_id
    }

    pub fn timestamp(&self) -> u64 {
        self.properties.timestamp
    }

    pub fn message_type(&self) -> &str {
        &self.properties.message_type
    }

    pub fn user_id(&self) -> &str {
        &self.properties.user_id
    }

    pub fn app_id(&self) -> &str {
        &self.properties.app_id
    }

    pub fn cluster_id(&self) -> &str {
        &self.properties.cluster_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_three_way_accessor() {
        assert_eq!(Envelope::new().body(), Some(""));
        assert_eq!(Envelope::with_body("").body(), None);
        assert_eq!(Envelope::with_body("hello").body(), Some("hello"));
    }

    #[test]
    fn test_bare_envelope_defaults() {
        let envelope = Envelope::new();

        assert_eq!(envelope.consumer_tag(), None);
        assert_eq!(envelope.delivery_tag(), None);
        assert_eq!(envelope.exchange_name(), None);
        assert_eq!(envelope.routing_key(), None);
        assert_eq!(envelope.is_redelivery(), None);

        assert_eq!(envelope.content_type(), "");
        assert_eq!(envelope.delivery_mode(), DELIVERY_MODE_TRANSIENT);
        assert_eq!(envelope.priority(), 0);
        assert_eq!(envelope.timestamp(), 0);
        assert!(envelope.headers().is_empty());
        assert!(!envelope.has_header("x-missing"));
    }
}
