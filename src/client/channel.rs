//! Channels multiplexed over a connection

use crate::channel_span;
use crate::client::connection::{Connection, ConnectionBridge};
use crate::client::consumer::ConsumerRegistry;
use crate::error::{AmqpError, AmqpResult, ErrorKind, ExceptionHandler};
use crate::protocol::{Envelope, Flags, MessageTransformer};
use crate::transport::EngineChannel;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, warn, Instrument};

/// Association between a channel and its engine handle
///
/// The connection side is held weakly so a channel never keeps a dropped
/// connection alive.
pub struct ChannelBridge {
    handle: RwLock<Option<Arc<dyn EngineChannel>>>,
    connection: Weak<ConnectionBridge>,
}

impl ChannelBridge {
    fn new(handle: Arc<dyn EngineChannel>, connection: Weak<ConnectionBridge>) -> Self {
        Self {
            handle: RwLock::new(Some(handle)),
            connection,
        }
    }

    fn take_handle(&self) -> Option<Arc<dyn EngineChannel>> {
        self.handle.write().take()
    }
}

/// Prefetch window applied with `basic.qos`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Prefetch {
    pub size: u32,
    pub count: u16,
}

/// One AMQP channel
pub struct Channel {
    id: u16,
    bridge: ChannelBridge,
    registry: Mutex<ConsumerRegistry>,
    prefetch: Mutex<Prefetch>,
    transformer: MessageTransformer,
}

impl Channel {
    /// Open a new channel on a connected connection
    pub async fn open(connection: &Connection) -> AmqpResult<Self> {
        let engine = connection
            .bridge()
            .handle()
            .filter(|_| connection.is_connected())
            .ok_or_else(|| {
                AmqpError::connection("Could not create channel. No connection available.")
            })?;

        let handle = engine
            .open_channel()
            .await
            .map_err(|e| ExceptionHandler::translate(e, "create channel", ErrorKind::Channel))?;
        let id = handle.channel_id();
        debug!(channel_id = id, connection_id = %connection.id(), "Channel opened");

        Ok(Self {
            id,
            bridge: ChannelBridge::new(handle, Arc::downgrade(connection.bridge())),
            registry: Mutex::new(ConsumerRegistry::new()),
            prefetch: Mutex::new(Prefetch::default()),
            transformer: MessageTransformer,
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Whether the channel and its connection are both usable
    pub fn is_open(&self) -> bool {
        self.verify("check channel").is_ok()
    }

    /// Whether the owning connection still exists and is connected
    pub fn is_connected(&self) -> bool {
        self.bridge
            .connection
            .upgrade()
            .is_some_and(|connection| connection.is_connected())
    }

    /// Read timeout of the owning connection; `None` waits without bound
    pub fn read_timeout(&self) -> Option<Duration> {
        self.bridge
            .connection
            .upgrade()
            .and_then(|connection| connection.config().read_timeout_duration())
    }

    /// Check the channel and connection before an operation
    ///
    /// Channel problems are reported before connection problems, and a
    /// missing handle before a closed one.
    pub(crate) fn verify(&self, operation: &str) -> AmqpResult<Arc<dyn EngineChannel>> {
        let handle = self.bridge.handle.read().clone().ok_or_else(|| {
            AmqpError::channel(format!(
                "Could not {operation}. Stale reference to the channel object."
            ))
        })?;
        if !handle.is_open() {
            return Err(AmqpError::channel(format!(
                "Could not {operation}. No channel available."
            )));
        }

        let connection = self.bridge.connection.upgrade().ok_or_else(|| {
            AmqpError::connection(format!(
                "Could not {operation}. Stale reference to the connection object."
            ))
        })?;
        if !connection.is_connected() {
            return Err(AmqpError::connection(format!(
                "Could not {operation}. No connection available."
            )));
        }

        Ok(handle)
    }

    pub(crate) fn transformer(&self) -> MessageTransformer {
        self.transformer
    }

    pub fn prefetch_count(&self) -> u16 {
        self.prefetch.lock().count
    }

    pub fn prefetch_size(&self) -> u32 {
        self.prefetch.lock().size
    }

    /// Apply a prefetch window to this channel
    pub async fn qos(&self, prefetch_size: u32, prefetch_count: u16) -> AmqpResult<()> {
        let handle = self.verify("set qos")?;
        handle
            .basic_qos(prefetch_size, prefetch_count, false)
            .await
            .map_err(|e| ExceptionHandler::translate(e, "set qos", ErrorKind::Channel))?;

        *self.prefetch.lock() = Prefetch {
            size: prefetch_size,
            count: prefetch_count,
        };
        Ok(())
    }

    /// Set the prefetch count, clearing any prefetch size
    pub async fn set_prefetch_count(&self, count: u16) -> AmqpResult<()> {
        self.qos(0, count).await
    }

    /// Set the prefetch size, clearing any prefetch count
    pub async fn set_prefetch_size(&self, size: u32) -> AmqpResult<()> {
        self.qos(size, 0).await
    }

    /// Acknowledge a delivery; honors `MULTIPLE`
    pub async fn ack(&self, delivery_tag: u64, flags: u32) -> AmqpResult<()> {
        self.settle_ack(delivery_tag, flags, ErrorKind::Channel).await
    }

    /// Negatively acknowledge a delivery; honors `MULTIPLE` and `REQUEUE`
    pub async fn nack(&self, delivery_tag: u64, flags: u32) -> AmqpResult<()> {
        self.settle_nack(delivery_tag, flags, ErrorKind::Channel).await
    }

    /// Reject a delivery; honors `REQUEUE`
    pub async fn reject(&self, delivery_tag: u64, flags: u32) -> AmqpResult<()> {
        self.settle_reject(delivery_tag, flags, ErrorKind::Channel)
            .await
    }

    pub(crate) async fn settle_ack(
        &self,
        delivery_tag: u64,
        flags: u32,
        kind: ErrorKind,
    ) -> AmqpResult<()> {
        let flags = Flags::from_bits(flags);
        self.verify("ack message")?
            .basic_ack(delivery_tag, flags.multiple)
            .await
            .map_err(|e| ExceptionHandler::translate(e, "ack message", kind))
    }

    pub(crate) async fn settle_nack(
        &self,
        delivery_tag: u64,
        flags: u32,
        kind: ErrorKind,
    ) -> AmqpResult<()> {
        let flags = Flags::from_bits(flags);
        self.verify("nack message")?
            .basic_nack(delivery_tag, flags.multiple, flags.requeue)
            .await
            .map_err(|e| ExceptionHandler::translate(e, "nack message", kind))
    }

    pub(crate) async fn settle_reject(
        &self,
        delivery_tag: u64,
        flags: u32,
        kind: ErrorKind,
    ) -> AmqpResult<()> {
        let flags = Flags::from_bits(flags);
        self.verify("reject message")?
            .basic_reject(delivery_tag, flags.requeue)
            .await
            .map_err(|e| ExceptionHandler::translate(e, "reject message", kind))
    }

    /// Redeliver all unacknowledged messages on this channel
    pub async fn recover(&self, requeue: bool) -> AmqpResult<()> {
        self.verify("recover")?
            .basic_recover(requeue)
            .await
            .map_err(|e| ExceptionHandler::translate(e, "recover", ErrorKind::Channel))
    }

    pub async fn start_transaction(&self) -> AmqpResult<()> {
        self.verify("start the transaction")?
            .tx_select()
            .await
            .map_err(|e| {
                ExceptionHandler::translate(e, "start the transaction", ErrorKind::Channel)
            })
    }

    pub async fn commit_transaction(&self) -> AmqpResult<()> {
        self.verify("commit the transaction")?
            .tx_commit()
            .await
            .map_err(|e| {
                ExceptionHandler::translate(e, "commit the transaction", ErrorKind::Channel)
            })
    }

    pub async fn rollback_transaction(&self) -> AmqpResult<()> {
        self.verify("rollback the transaction")?
            .tx_rollback()
            .await
            .map_err(|e| {
                ExceptionHandler::translate(e, "rollback the transaction", ErrorKind::Channel)
            })
    }

    /// Close the channel; later operations report a stale channel reference
    pub async fn close(&self) -> AmqpResult<()> {
        let Some(handle) = self.bridge.take_handle() else {
            return Ok(());
        };
        self.registry.lock().clear();

        // A channel already closed by the broker or a dead connection needs no close frame
        if !handle.is_open() || !self.is_connected() {
            debug!(channel_id = self.id, "Channel already closed");
            return Ok(());
        }

        handle
            .close()
            .instrument(channel_span!(channel_id = self.id, operation = "close"))
            .await
            .map_err(|e| ExceptionHandler::translate(e, "close channel", ErrorKind::Channel))
    }

    /// Tags of consumers started on this channel and not yet cancelled
    pub fn consumer_tags(&self) -> Vec<String> {
        self.registry.lock().tags()
    }

    pub(crate) fn register_consumer(&self, consumer_tag: &str, queue: &str) {
        self.registry.lock().add(consumer_tag, queue);
    }

    pub(crate) fn unregister_consumer(&self, consumer_tag: &str) -> Option<String> {
        self.registry.lock().remove(consumer_tag)
    }

    /// Wait for the next delivery addressed to a registered consumer
    ///
    /// A delivery for an unknown consumer tag fails with an envelope error
    /// carrying the delivery; the registry is left as it was.
    pub(crate) async fn next_delivery(&self, timeout: Option<Duration>) -> AmqpResult<Envelope> {
        let handle = self.verify("consume")?;
        let message = handle
            .wait(timeout)
            .await
            .map_err(|e| ExceptionHandler::translate_consuming(e, "consume", ErrorKind::Queue))?;

        let envelope = self.transformer.to_envelope(message);
        let known = envelope
            .consumer_tag()
            .is_some_and(|tag| self.registry.lock().contains(tag));
        if !known {
            warn!(
                channel_id = self.id,
                consumer_tag = envelope.consumer_tag().unwrap_or_default(),
                "Delivery for unknown consumer"
            );
            return Err(AmqpError::envelope("Orphaned envelope", envelope));
        }
        Ok(envelope)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let Some(handle) = self.bridge.take_handle() else {
            return;
        };
        if !handle.is_open() || !self.is_connected() {
            return;
        }
        if let Ok(runtime) = Handle::try_current() {
            let id = self.id;
            runtime.spawn(async move {
                if let Err(e) = handle.close().await {
                    warn!(channel_id = id, "Failed to close dropped channel: {}", e);
                }
            });
        }
    }
}
