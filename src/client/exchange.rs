//! Exchange declaration, binding and publishing

use crate::client::channel::Channel;
use crate::client::queue::{store_argument, MAX_NAME_LENGTH};
use crate::error::{AmqpError, AmqpResult, ErrorKind, ExceptionHandler};
use crate::protocol::{Flags, Table, Value, ValueCodec};
use crate::transport::{BasicPublish, Binding, ExchangeDeclare};
use tracing::{debug, trace};

/// Built-in exchange types
pub const EXCHANGE_DIRECT: &str = "direct";
pub const EXCHANGE_FANOUT: &str = "fanout";
pub const EXCHANGE_TOPIC: &str = "topic";
pub const EXCHANGE_HEADERS: &str = "headers";

/// An exchange addressed through one channel
///
/// A new exchange has an empty name, which addresses the default exchange.
pub struct Exchange<'a> {
    channel: &'a Channel,
    name: String,
    kind: Option<String>,
    flags: Flags,
    arguments: Table,
}

impl<'a> Exchange<'a> {
    pub fn new(channel: &'a Channel) -> Self {
        Self {
            channel,
            name: String::new(),
            kind: None,
            flags: Flags::default(),
            arguments: Table::new(),
        }
    }

    pub fn channel(&self) -> &'a Channel {
        self.channel
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> AmqpResult<()> {
        let name = name.into();
        if name.len() > MAX_NAME_LENGTH {
            return Err(AmqpError::exchange(format!(
                "Exchange name exceeds {MAX_NAME_LENGTH} character limit."
            )));
        }
        self.name = name;
        Ok(())
    }

    pub fn exchange_type(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    pub fn set_type(&mut self, kind: impl Into<String>) {
        self.kind = Some(kind.into());
    }

    pub fn flags(&self) -> u32 {
        self.flags.bits()
    }

    /// Keep only the flags meaningful for an exchange
    pub fn set_flags(&mut self, flags: u32) {
        self.flags = Flags::from_bits(flags).for_exchange();
    }

    pub fn arguments(&self) -> &Table {
        &self.arguments
    }

    pub fn argument(&self, key: &str) -> Option<&Value> {
        self.arguments.get(key)
    }

    pub fn has_argument(&self, key: &str) -> bool {
        self.arguments.contains_key(key)
    }

    /// Set a declare argument; `Null` removes it
    pub fn set_argument(&mut self, key: &str, value: impl Into<Value>) -> AmqpResult<()> {
        store_argument(&mut self.arguments, key, value.into(), ErrorKind::Exchange)
    }

    pub fn set_arguments(&mut self, arguments: Table) -> AmqpResult<()> {
        let mut validated = Table::new();
        for (key, value) in arguments {
            store_argument(&mut validated, &key, value, ErrorKind::Exchange)?;
        }
        self.arguments = validated;
        Ok(())
    }

    /// Declare the exchange; a type must be set first
    pub async fn declare(&self) -> AmqpResult<()> {
        let kind = self
            .kind
            .as_deref()
            .filter(|kind| !kind.is_empty())
            .ok_or_else(|| {
                AmqpError::exchange("Could not declare exchange. Exchanges must have a type.")
            })?;

        let handle = self.channel.verify("declare exchange")?;
        handle
            .exchange_declare(ExchangeDeclare {
                exchange: self.name.clone(),
                kind: kind.to_string(),
                passive: self.flags.passive,
                durable: self.flags.durable,
                auto_delete: self.flags.auto_delete,
                internal: self.flags.internal,
                no_wait: false,
                arguments: ValueCodec::table_to_wire(&self.arguments),
            })
            .await
            .map_err(|e| ExceptionHandler::translate(e, "declare exchange", ErrorKind::Exchange))?;

        debug!(exchange = %self.name, kind, "Exchange declared");
        Ok(())
    }

    /// Delete the exchange; honors `IFUNUSED` and `NOWAIT`
    pub async fn delete(&self, flags: u32) -> AmqpResult<()> {
        let flags = Flags::from_bits(flags);
        let handle = self.channel.verify("delete exchange")?;
        handle
            .exchange_delete(&self.name, flags.if_unused, flags.no_wait)
            .await
            .map_err(|e| ExceptionHandler::translate(e, "delete exchange", ErrorKind::Exchange))
    }

    /// Route messages from `source` into this exchange
    pub async fn bind(&self, source: &str, routing_key: &str, arguments: &Table) -> AmqpResult<()> {
        let handle = self.channel.verify("bind exchange")?;
        handle
            .exchange_bind(self.binding(source, routing_key, arguments))
            .await
            .map_err(|e| ExceptionHandler::translate(e, "bind exchange", ErrorKind::Exchange))
    }

    pub async fn unbind(
        &self,
        source: &str,
        routing_key: &str,
        arguments: &Table,
    ) -> AmqpResult<()> {
        let handle = self.channel.verify("unbind exchange")?;
        handle
            .exchange_unbind(self.binding(source, routing_key, arguments))
            .await
            .map_err(|e| ExceptionHandler::translate(e, "unbind exchange", ErrorKind::Exchange))
    }

    fn binding(&self, source: &str, routing_key: &str, arguments: &Table) -> Binding {
        Binding {
            destination: self.name.clone(),
            source: source.to_string(),
            routing_key: routing_key.to_string(),
            no_wait: false,
            arguments: ValueCodec::table_to_wire(arguments),
        }
    }

    /// Publish a message through this exchange
    ///
    /// Honors `MANDATORY` and `IMMEDIATE`. `attributes` carries message
    /// properties by name plus an optional `headers` table; empty strings
    /// are left out.
    pub async fn publish(
        &self,
        message: &str,
        routing_key: Option<&str>,
        flags: u32,
        attributes: &Table,
    ) -> AmqpResult<()> {
        let flags = Flags::from_bits(flags);
        let handle = self.channel.verify("publish")?;
        let raw = self.channel.transformer().to_raw_message(message, attributes);
        let routing_key = routing_key.unwrap_or_default().to_string();

        trace!(exchange = %self.name, routing_key = %routing_key, "Publishing message");
        handle
            .basic_publish(
                raw,
                BasicPublish {
                    exchange: self.name.clone(),
                    routing_key,
                    mandatory: flags.mandatory,
                    immediate: flags.immediate,
                },
            )
            .await
            .map_err(|e| ExceptionHandler::translate(e, "publish", ErrorKind::Exchange))
    }
}
