//! Queue declaration, binding and consumption

use crate::client::channel::Channel;
use crate::client::consumer::{ConsumeOutcome, Consumer};
use crate::consume_span;
use crate::error::{AmqpError, AmqpResult, ErrorKind, ExceptionHandler};
use crate::protocol::{Envelope, Flags, Table, Value, ValueCodec};
use crate::transport::{BasicConsume, Binding, QueueDeclare};
use tracing::{debug, info, Instrument};

/// Longest queue or exchange name the broker accepts
pub const MAX_NAME_LENGTH: usize = 255;

/// A queue addressed through one channel
pub struct Queue<'a> {
    channel: &'a Channel,
    name: String,
    flags: Flags,
    arguments: Table,
    consumer_tag: Option<String>,
}

impl<'a> Queue<'a> {
    /// Create an unnamed queue; the broker assigns a name on declare
    pub fn new(channel: &'a Channel) -> Self {
        Self {
            channel,
            name: String::new(),
            flags: Flags::default(),
            arguments: Table::new(),
            consumer_tag: None,
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
            return Err(AmqpError::queue(format!(
                "Queue name exceeds {MAX_NAME_LENGTH} character limit."
            )));
        }
        self.name = name;
        Ok(())
    }

    pub fn flags(&self) -> u32 {
        self.flags.bits()
    }

    /// Keep only the flags meaningful for a queue
    pub fn set_flags(&mut self, flags: u32) {
        self.flags = Flags::from_bits(flags).for_queue();
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
        store_argument(&mut self.arguments, key, value.into(), ErrorKind::Queue)
    }

    /// Replace all declare arguments
    pub fn set_arguments(&mut self, arguments: Table) -> AmqpResult<()> {
        let mut validated = Table::new();
        for (key, value) in arguments {
            store_argument(&mut validated, &key, value, ErrorKind::Queue)?;
        }
        self.arguments = validated;
        Ok(())
    }

    /// Tag of the consumer most recently started through this queue
    pub fn consumer_tag(&self) -> Option<&str> {
        self.consumer_tag.as_deref()
    }

    /// Declare the queue and return its message count
    ///
    /// The name the broker reports replaces the local one, so an unnamed
    /// queue picks up its generated name.
    pub async fn declare(&mut self) -> AmqpResult<u32> {
        let handle = self.channel.verify("declare queue")?;
        let reply = handle
            .queue_declare(QueueDeclare {
                queue: self.name.clone(),
                passive: self.flags.passive,
                durable: self.flags.durable,
                exclusive: self.flags.exclusive,
                auto_delete: self.flags.auto_delete,
                no_wait: false,
                arguments: ValueCodec::table_to_wire(&self.arguments),
            })
            .await
            .map_err(|e| ExceptionHandler::translate(e, "declare queue", ErrorKind::Queue))?;

        let (Some(name), Some(message_count)) = (reply.queue, reply.message_count) else {
            return Err(AmqpError::queue(
                "Could not declare queue. Broker reply is missing the queue name or message count.",
            ));
        };
        debug!(queue = %name, message_count, "Queue declared");
        self.name = name;
        Ok(message_count)
    }

    /// Bind this queue to an exchange
    pub async fn bind(
        &self,
        exchange: &str,
        routing_key: Option<&str>,
        arguments: &Table,
    ) -> AmqpResult<()> {
        let handle = self.channel.verify("bind queue")?;
        handle
            .queue_bind(self.binding(exchange, routing_key, arguments))
            .await
            .map_err(|e| ExceptionHandler::translate(e, "bind queue", ErrorKind::Queue))
    }

    /// Remove a binding between this queue and an exchange
    pub async fn unbind(
        &self,
        exchange: &str,
        routing_key: Option<&str>,
        arguments: &Table,
    ) -> AmqpResult<()> {
        let handle = self.channel.verify("unbind queue")?;
        handle
            .queue_unbind(self.binding(exchange, routing_key, arguments))
            .await
            .map_err(|e| ExceptionHandler::translate(e, "unbind queue", ErrorKind::Queue))
    }

    fn binding(&self, exchange: &str, routing_key: Option<&str>, arguments: &Table) -> Binding {
        Binding {
            destination: self.name.clone(),
            source: exchange.to_string(),
            routing_key: routing_key.unwrap_or_default().to_string(),
            no_wait: false,
            arguments: ValueCodec::table_to_wire(arguments),
        }
    }

    /// Drop all ready messages; returns how many were removed
    pub async fn purge(&self) -> AmqpResult<u32> {
        let handle = self.channel.verify("purge queue")?;
        handle
            .queue_purge(&self.name)
            .await
            .map_err(|e| ExceptionHandler::translate(e, "purge queue", ErrorKind::Queue))
    }

    /// Delete the queue; honors `IFUNUSED`, `IFEMPTY` and `NOWAIT`
    ///
    /// Returns the number of messages deleted with it.
    pub async fn delete(&self, flags: u32) -> AmqpResult<u32> {
        let flags = Flags::from_bits(flags);
        let handle = self.channel.verify("delete queue")?;
        handle
            .queue_delete(&self.name, flags.if_unused, flags.if_empty, flags.no_wait)
            .await
            .map_err(|e| ExceptionHandler::translate(e, "delete queue", ErrorKind::Queue))
    }

    /// Fetch one message without subscribing; honors `AUTOACK`
    pub async fn get(&self, flags: u32) -> AmqpResult<Option<Envelope>> {
        let flags = Flags::from_bits(flags);
        let handle = self.channel.verify("get message from queue")?;
        let message = handle
            .basic_get(&self.name, flags.auto_ack)
            .await
            .map_err(|e| {
                ExceptionHandler::translate(e, "get message from queue", ErrorKind::Queue)
            })?;
        Ok(message.map(|message| self.channel.transformer().to_envelope(message)))
    }

    pub async fn ack(&self, delivery_tag: u64, flags: u32) -> AmqpResult<()> {
        self.channel
            .settle_ack(delivery_tag, flags, ErrorKind::Queue)
            .await
    }

    pub async fn nack(&self, delivery_tag: u64, flags: u32) -> AmqpResult<()> {
        self.channel
            .settle_nack(delivery_tag, flags, ErrorKind::Queue)
            .await
    }

    pub async fn reject(&self, delivery_tag: u64, flags: u32) -> AmqpResult<()> {
        self.channel
            .settle_reject(delivery_tag, flags, ErrorKind::Queue)
            .await
    }

    /// Subscribe to the queue and optionally run a consume loop
    ///
    /// Unless `JUST_CONSUME` is set a `basic.consume` is sent first, honoring
    /// `NOLOCAL`, `AUTOACK` and `EXCLUSIVE`. With a consumer the loop then
    /// hands each delivery to it until it returns [`ConsumeOutcome::Stop`] or
    /// fails. Each wait is bounded by the connection read timeout; running
    /// out of time fails with a queue error.
    pub async fn consume(
        &mut self,
        consumer: Option<&mut dyn Consumer>,
        flags: u32,
        consumer_tag: Option<&str>,
    ) -> AmqpResult<()> {
        let flags = Flags::from_bits(flags);
        if !flags.just_consume {
            self.subscribe(flags, consumer_tag).await?;
        }

        let Some(consumer) = consumer else {
            return Ok(());
        };
        let span = consume_span!(queue = %self.name, channel_id = self.channel.id());
        self.run(consumer).instrument(span).await
    }

    async fn subscribe(&mut self, flags: Flags, consumer_tag: Option<&str>) -> AmqpResult<()> {
        let handle = self.channel.verify("consume")?;
        let tag = handle
            .basic_consume(BasicConsume {
                queue: self.name.clone(),
                consumer_tag: consumer_tag.unwrap_or_default().to_string(),
                no_local: flags.no_local,
                no_ack: flags.auto_ack,
                exclusive: flags.exclusive,
                no_wait: false,
                arguments: Vec::new(),
            })
            .await
            .map_err(|e| ExceptionHandler::translate(e, "consume", ErrorKind::Queue))?;

        info!(queue = %self.name, consumer_tag = %tag, "Consumer started");
        self.channel.register_consumer(&tag, &self.name);
        self.consumer_tag = Some(tag);
        Ok(())
    }

    async fn run(&self, consumer: &mut dyn Consumer) -> AmqpResult<()> {
        let timeout = self.channel.read_timeout();
        loop {
            let envelope = self.channel.next_delivery(timeout).await?;
            match consumer.on_delivery(envelope, self).await? {
                ConsumeOutcome::Continue => {}
                ConsumeOutcome::Stop => {
                    debug!(queue = %self.name, "Consumer requested stop");
                    return Ok(());
                }
            }
        }
    }

    /// Cancel a consumer, defaulting to the one started through this queue
    ///
    /// Without a tag to cancel this does nothing.
    pub async fn cancel(&mut self, consumer_tag: Option<&str>) -> AmqpResult<()> {
        let Some(tag) = consumer_tag
            .map(str::to_string)
            .or_else(|| self.consumer_tag.clone())
        else {
            return Ok(());
        };

        let handle = self.channel.verify("cancel queue")?;
        handle
            .basic_cancel(&tag, false)
            .await
            .map_err(|e| ExceptionHandler::translate(e, "cancel queue", ErrorKind::Queue))?;

        self.channel.unregister_consumer(&tag);
        if self.consumer_tag.as_deref() == Some(tag.as_str()) {
            self.consumer_tag = None;
        }
        info!(queue = %self.name, consumer_tag = %tag, "Consumer cancelled");
        Ok(())
    }
}

/// Store one declare argument, accepting only scalar values
pub(crate) fn store_argument(
    arguments: &mut Table,
    key: &str,
    value: Value,
    kind: ErrorKind,
) -> AmqpResult<()> {
    match value {
        Value::Null => {
            arguments.remove(key);
            Ok(())
        }
        Value::Int(_) | Value::Float(_) | Value::String(_) => {
            arguments.insert(key, value);
            Ok(())
        }
        other => Err(kind.into_error(format!(
            "The value of argument '{key}' must be null, an integer, a float or a string, {} given.",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Connection;
    use crate::config::{ConnectionConfig, ConnectionDefaults, Credentials};
    use crate::heartbeat::NullScheduler;
    use crate::protocol::{AUTOACK, DURABLE, IFEMPTY, INTERNAL, PASSIVE};
    use crate::testing::{MockBroker, MockConnector};
    use std::sync::Arc;

    async fn connected(broker: &MockBroker) -> (Connection, Arc<MockConnector>) {
        let connector = Arc::new(MockConnector::with_broker(broker.clone()));
        let config =
            ConnectionConfig::new(&ConnectionDefaults::default(), Credentials::default()).unwrap();
        let mut connection = Connection::new(config, connector.clone(), Arc::new(NullScheduler));
        connection.connect().await.unwrap();
        (connection, connector)
    }

    #[tokio::test]
    async fn test_declare_unnamed_queue_takes_broker_name() {
        let broker = MockBroker::new();
        let (connection, _) = connected(&broker).await;
        let channel = Channel::open(&connection).await.unwrap();

        let mut queue = Queue::new(&channel);
        let count = queue.declare().await.unwrap();

        assert_eq!(count, 0);
        assert!(queue.name().starts_with("amq.gen-"));
        assert!(broker.has_queue(queue.name()));
    }

    #[tokio::test]
    async fn test_declare_missing_reply_fields() {
        let broker = MockBroker::new();
        let (connection, connector) = connected(&broker).await;
        let channel = Channel::open(&connection).await.unwrap();
        connector
            .last_connection()
            .unwrap()
            .last_channel()
            .unwrap()
            .omit_declare_reply();

        let mut queue = Queue::new(&channel);
        queue.set_name("jobs").unwrap();
        let err = queue.declare().await.unwrap_err();

        assert_eq!(err.kind(), Some(ErrorKind::Queue));
        assert_eq!(queue.name(), "jobs");
    }

    #[tokio::test]
    async fn test_passive_declare_of_missing_queue() {
        let broker = MockBroker::new();
        let (connection, _) = connected(&broker).await;
        let channel = Channel::open(&connection).await.unwrap();

        let mut queue = Queue::new(&channel);
        queue.set_name("missing").unwrap();
        queue.set_flags(PASSIVE);
        let err = queue.declare().await.unwrap_err();

        assert_eq!(
            err.to_string(),
            "Server channel error: 404, message: NOT_FOUND - no queue 'missing' in vhost '/'"
        );
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_set_flags_masks_exchange_only_bits() {
        let broker = MockBroker::new();
        let (connection, _) = connected(&broker).await;
        let channel = Channel::open(&connection).await.unwrap();
        let mut queue = Queue::new(&channel);

        queue.set_flags(DURABLE | INTERNAL | AUTOACK);

        assert_eq!(queue.flags(), DURABLE);
    }

    #[tokio::test]
    async fn test_arguments_accept_scalars_only() {
        let broker = MockBroker::new();
        let (connection, _) = connected(&broker).await;
        let channel = Channel::open(&connection).await.unwrap();
        let mut queue = Queue::new(&channel);

        queue.set_argument("x-max-length", 10).unwrap();
        queue.set_argument("x-queue-mode", "lazy").unwrap();
        queue.set_argument("x-ratio", 0.5).unwrap();
        assert_eq!(queue.arguments().len(), 3);

        queue.set_argument("x-queue-mode", Value::Null).unwrap();
        assert!(!queue.has_argument("x-queue-mode"));

        let err = queue.set_argument("x-flag", true).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Queue));
        assert!(err.to_string().contains("bool given"));
    }

    #[tokio::test]
    async fn test_name_length_limit() {
        let broker = MockBroker::new();
        let (connection, _) = connected(&broker).await;
        let channel = Channel::open(&connection).await.unwrap();
        let mut queue = Queue::new(&channel);

        assert!(queue.set_name("q".repeat(255)).is_ok());
        let err = queue.set_name("q".repeat(256)).unwrap_err();
        assert_eq!(err.to_string(), "Queue name exceeds 255 character limit.");
    }

    #[tokio::test]
    async fn test_delete_if_empty_refuses_non_empty_queue() {
        let broker = MockBroker::new();
        let (connection, _) = connected(&broker).await;
        let channel = Channel::open(&connection).await.unwrap();
        let mut queue = Queue::new(&channel);
        queue.set_name("jobs").unwrap();
        queue.declare().await.unwrap();

        let publisher = Channel::open(&connection).await.unwrap();
        let exchange = crate::client::Exchange::new(&publisher);
        exchange
            .publish("work", Some("jobs"), 0, &Table::new())
            .await
            .unwrap();

        let err = queue.delete(IFEMPTY).await.unwrap_err();
        assert!(err.to_string().contains("not empty"));
        assert!(broker.has_queue("jobs"));
    }

    #[tokio::test]
    async fn test_cancel_without_tag_is_noop() {
        let broker = MockBroker::new();
        let (connection, connector) = connected(&broker).await;
        let channel = Channel::open(&connection).await.unwrap();
        let mut queue = Queue::new(&channel);

        queue.cancel(None).await.unwrap();

        let mock = connector.last_connection().unwrap().last_channel().unwrap();
        assert!(mock.calls().is_empty());
    }
}
