//! Conversion between engine messages and application envelopes

use super::envelope::{BasicProperties, Envelope};
use super::flags::DELIVERY_MODE_TRANSIENT;
use super::value::{Table, Value, ValueCodec, WireValue};
use crate::transport::{PropertyMap, RawMessage, HEADERS_PROPERTY};
use tracing::warn;

/// Content type applied to outbound messages that do not set one
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// Publish attributes that the engine expects as strings
const STRING_ATTRIBUTES: [&str; 6] = [
    "app_id",
    "content_encoding",
    "correlation_id",
    "message_id",
    "reply_to",
    "type",
];

/// Publish attributes that the engine expects as integers
const INTEGER_ATTRIBUTES: [&str; 3] = ["delivery_mode", "priority", "timestamp"];

/// Stateless transformer shared by every channel
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageTransformer;

impl MessageTransformer {
    /// Build an envelope from a delivered engine message
    ///
    /// A zero-length body is stored as absent.
    pub fn to_envelope(&self, message: RawMessage) -> Envelope {
        let RawMessage {
            body,
            properties,
            delivery,
        } = message;

        let body = if body.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&body).into_owned())
        };

        Envelope {
            body,
            consumer_tag: delivery.consumer_tag,
            delivery_tag: Some(delivery.delivery_tag),
            exchange_name: Some(delivery.exchange),
            routing_key: Some(delivery.routing_key),
            redelivered: Some(delivery.redelivered),
            properties: Self::properties_from_wire(&properties),
        }
    }

    /// Build an engine message from a body and publish attributes
    pub fn to_raw_message(&self, body: &str, attributes: &Table) -> RawMessage {
        let mut properties = PropertyMap::new();

        for (key, value) in attributes.iter() {
            if value.is_empty_string() {
                continue;
            }

            if key == "headers" {
                match value {
                    Value::Table(headers) => {
                        properties.insert(
                            HEADERS_PROPERTY.to_string(),
                            WireValue::Table(ValueCodec::table_to_wire(headers)),
                        );
                    }
                    Value::Null => {}
                    other => warn!(
                        "Ignoring headers attribute of type {}, expected a table",
                        other.type_name()
                    ),
                }
                continue;
            }

            let wire = if STRING_ATTRIBUTES.contains(&key) {
                WireValue::LongString(Self::coerce_string(value))
            } else if INTEGER_ATTRIBUTES.contains(&key) {
                WireValue::Long(Self::coerce_int(key, value))
            } else {
                ValueCodec::to_wire(value)
            };
            properties.insert(key.to_string(), wire);
        }

        properties
            .entry("content_type".to_string())
            .or_insert_with(|| WireValue::LongString(DEFAULT_CONTENT_TYPE.to_string()));

        RawMessage {
            body: body.as_bytes().to_vec(),
            properties,
            ..RawMessage::default()
        }
    }

    fn properties_from_wire(properties: &PropertyMap) -> BasicProperties {
        let string = |key: &str| {
            properties
                .get(key)
                .and_then(Self::wire_string)
                .unwrap_or_default()
        };
        let int = |key: &str| properties.get(key).and_then(Self::wire_int);

        let headers = match properties.get(HEADERS_PROPERTY) {
            Some(WireValue::Table(table)) => ValueCodec::table_from_wire(table),
            _ => Table::new(),
        };

        BasicProperties {
            content_type: string("content_type"),
            content_encoding: string("content_encoding"),
            headers,
            delivery_mode: int("delivery_mode")
                .and_then(|mode| u8::try_from(mode).ok())
                .unwrap_or(DELIVERY_MODE_TRANSIENT),
            priority: int("priority")
                .and_then(|priority| u8::try_from(priority).ok())
                .unwrap_or(0),
            correlation_id: string("correlation_id"),
            reply_to: string("reply_to"),
            expiration: string("expiration"),
            message_id: string("message_id"),
            timestamp: int("timestamp")
                .and_then(|ts| u64::try_from(ts).ok())
                .unwrap_or(0),
            message_type: string("type"),
            user_id: string("user_id"),
            app_id: string("app_id"),
            cluster_id: string("cluster_id"),
        }
    }

    fn wire_string(value: &WireValue) -> Option<String> {
        match value {
            WireValue::LongString(s) => Some(s.clone()),
            WireValue::Long(i) => Some(i.to_string()),
            WireValue::Double(f) => Some(f.to_string()),
            _ => None,
        }
    }

    fn wire_int(value: &WireValue) -> Option<i64> {
        match value {
            WireValue::Long(i) => Some(*i),
            WireValue::Timestamp(dt) => Some(dt.timestamp()),
            WireValue::LongString(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn coerce_string(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Timestamp(ts) => ts.to_string(),
            _ => String::new(),
        }
    }

    fn coerce_int(key: &str, value: &Value) -> i64 {
        match value {
            Value::Int(i) => *i,
            Value::Float(f) => f.trunc() as i64,
            Value::Bool(b) => i64::from(*b),
            Value::Timestamp(ts) => i64::try_from(ts.as_secs()).unwrap_or(i64::MAX),
            Value::String(s) => s.trim().parse().unwrap_or_else(|_| {
                warn!("Attribute {} is not an integer: {:?}, using 0", key, s);
                0
            }),
            other => {
                warn!(
                    "Attribute {} cannot be coerced from {}, using 0",
                    key,
                    other.type_name()
                );
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::value::Timestamp;
    use crate::transport::DeliveryInfo;

    fn delivered(body: &[u8], properties: PropertyMap) -> RawMessage {
        RawMessage {
            body: body.to_vec(),
            properties,
            delivery: DeliveryInfo {
                consumer_tag: Some("ctag-1".to_string()),
                delivery_tag: 7,
                redelivered: true,
                exchange: "events".to_string(),
                routing_key: "user.created".to_string(),
            },
        }
    }

    #[test]
    fn test_inbound_defaults_when_properties_absent() {
        let envelope = MessageTransformer.to_envelope(delivered(b"hello", PropertyMap::new()));

        assert_eq!(envelope.body(), Some("hello"));
        assert_eq!(envelope.consumer_tag(), Some("ctag-1"));
        assert_eq!(envelope.delivery_tag(), Some(7));
        assert_eq!(envelope.exchange_name(), Some("events"));
        assert_eq!(envelope.routing_key(), Some("user.created"));
        assert_eq!(envelope.is_redelivery(), Some(true));

        assert_eq!(envelope.content_type(), "");
        assert_eq!(envelope.content_encoding(), "");
        assert_eq!(envelope.correlation_id(), "");
        assert_eq!(envelope.message_type(), "");
        assert_eq!(envelope.priority(), 0);
        assert_eq!(envelope.timestamp(), 0);
        assert_eq!(envelope.delivery_mode(), DELIVERY_MODE_TRANSIENT);
        assert!(envelope.headers().is_empty());
    }

    #[test]
    fn test_inbound_zero_length_body_is_absent() {
        let envelope = MessageTransformer.to_envelope(delivered(b"", PropertyMap::new()));
        // stored as absent, so the accessor reports an empty string
        assert_eq!(envelope.body(), Some(""));
    }

    #[test]
    fn test_inbound_headers_are_flattened() {
        let mut properties = PropertyMap::new();
        properties.insert(
            HEADERS_PROPERTY.to_string(),
            WireValue::Table(vec![
                ("x-retry".to_string(), WireValue::Long(3)),
                ("x-origin".to_string(), WireValue::LongString("api".to_string())),
            ]),
        );
        properties.insert("type".to_string(), WireValue::LongString("created".to_string()));
        properties.insert("delivery_mode".to_string(), WireValue::Long(2));

        let envelope = MessageTransformer.to_envelope(delivered(b"{}", properties));

        assert_eq!(envelope.header("x-retry"), Some(&Value::Int(3)));
        assert_eq!(envelope.header("x-origin"), Some(&Value::String("api".into())));
        assert_eq!(envelope.headers().keys().collect::<Vec<_>>(), vec!["x-retry", "x-origin"]);
        assert_eq!(envelope.message_type(), "created");
        assert_eq!(envelope.delivery_mode(), 2);
    }

    #[test]
    fn test_outbound_strips_empty_and_routes_headers() {
        let mut headers = Table::new();
        headers.insert("x-trace", "abc");

        let mut attributes = Table::new();
        attributes.insert("correlation_id", "");
        attributes.insert("headers", headers);
        attributes.insert("message_id", 42);
        attributes.insert("priority", "5");
        attributes.insert("expiration", "60000");

        let raw = MessageTransformer.to_raw_message("payload", &attributes);

        assert_eq!(raw.body, b"payload".to_vec());
        assert!(!raw.properties.contains_key("correlation_id"));
        assert!(!raw.properties.contains_key("headers"));
        assert_eq!(
            raw.properties.get(HEADERS_PROPERTY),
            Some(&WireValue::Table(vec![(
                "x-trace".to_string(),
                WireValue::LongString("abc".to_string())
            )]))
        );
        assert_eq!(
            raw.properties.get("message_id"),
            Some(&WireValue::LongString("42".to_string()))
        );
        assert_eq!(raw.properties.get("priority"), Some(&WireValue::Long(5)));
        assert_eq!(
            raw.properties.get("expiration"),
            Some(&WireValue::LongString("60000".to_string()))
        );
        assert_eq!(
            raw.properties.get("content_type"),
            Some(&WireValue::LongString(DEFAULT_CONTENT_TYPE.to_string()))
        );
    }

    #[test]
    fn test_outbound_keeps_explicit_content_type() {
        let mut attributes = Table::new();
        attributes.insert("content_type", "application/json");
        attributes.insert("timestamp", Timestamp::from_secs(1_700_000_000));
        attributes.insert("delivery_mode", "not-a-number");

        let raw = MessageTransformer.to_raw_message("{}", &attributes);

        assert_eq!(
            raw.properties.get("content_type"),
            Some(&WireValue::LongString("application/json".to_string()))
        );
        assert_eq!(
            raw.properties.get("timestamp"),
            Some(&WireValue::Long(1_700_000_000))
        );
        assert_eq!(raw.properties.get("delivery_mode"), Some(&WireValue::Long(0)));
    }

    #[test]
    fn test_published_message_reads_back() {
        let mut attributes = Table::new();
        attributes.insert("type", "order.placed");
        attributes.insert("app_id", "shop");
        attributes.insert("delivery_mode", 2);

        let mut raw = MessageTransformer.to_raw_message("order", &attributes);
        raw.delivery.delivery_tag = 1;

        let envelope = MessageTransformer.to_envelope(raw);
        assert_eq!(envelope.body(), Some("order"));
        assert_eq!(envelope.message_type(), "order.placed");
        assert_eq!(envelope.app_id(), "shop");
        assert_eq!(envelope.delivery_mode(), 2);
        assert_eq!(envelope.content_type(), DEFAULT_CONTENT_TYPE);
    }
}
