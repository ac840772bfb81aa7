//! Mock implementations for testing
//!
//! [`MockBroker`] is a small in-memory broker with direct, fanout and topic
//! routing. [`MockConnector`], [`MockEngineConnection`] and
//! [`MockEngineChannel`] implement the engine traits on top of it, and
//! [`RecordingScheduler`] records heartbeat registrations instead of running
//! them. Together they let the whole runtime run without a broker.

use crate::config::ConnectionConfig;
use crate::heartbeat::{ConnectionId, HeartbeatScheduler, HeartbeatTarget};
use crate::transport::{
    BasicConsume, BasicPublish, Binding, Connector, DeliveryInfo, EngineChannel,
    EngineConnection, EngineError, ExchangeDeclare, QueueDeclare, QueueDeclareOk, RawMessage,
    SocketDirection, SocketTimeout,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// How often a waiting mock channel re-checks its queues
const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn not_found(what: &str, name: &str) -> EngineError {
    EngineError::ChannelClosed {
        reply_code: 404,
        reply_text: format!("NOT_FOUND - no {what} '{name}' in vhost '/'"),
    }
}

fn precondition_failed(detail: impl Into<String>) -> EngineError {
    EngineError::ChannelClosed {
        reply_code: 406,
        reply_text: format!("PRECONDITION_FAILED - {}", detail.into()),
    }
}

fn connection_forced() -> EngineError {
    EngineError::ConnectionClosed {
        reply_code: 320,
        reply_text: "CONNECTION_FORCED - connection closed (0, 0)".to_string(),
    }
}

/// Whether a topic routing key matches a binding pattern
///
/// `*` matches exactly one word and `#` matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    matches(&pattern, &key)
}

#[derive(Debug, Clone)]
struct ExchangeEntry {
    kind: String,
}

#[derive(Debug, Default)]
struct QueueEntry {
    messages: VecDeque<RawMessage>,
}

#[derive(Debug, Clone, PartialEq)]
struct BindingEntry {
    source: String,
    destination: String,
    routing_key: String,
    to_exchange: bool,
}

#[derive(Debug, Clone)]
struct ConsumerEntry {
    queue: String,
    channel_key: u64,
    no_ack: bool,
}

#[derive(Debug, Clone)]
struct Unacked {
    queue: String,
    message: RawMessage,
}

#[derive(Debug)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeEntry>,
    queues: HashMap<String, QueueEntry>,
    bindings: Vec<BindingEntry>,
    /// Insertion-ordered so deliveries are predictable
    consumers: Vec<(String, ConsumerEntry)>,
    unacked: HashMap<(u64, u64), Unacked>,
    published: Vec<RawMessage>,
    next_consumer: u64,
}

impl Default for BrokerState {
    fn default() -> Self {
        let exchanges = [
            ("", "direct"),
            ("amq.direct", "direct"),
            ("amq.fanout", "fanout"),
            ("amq.topic", "topic"),
            ("amq.headers", "headers"),
        ]
        .into_iter()
        .map(|(name, kind)| {
            (
                name.to_string(),
                ExchangeEntry {
                    kind: kind.to_string(),
                },
            )
        })
        .collect();

        Self {
            exchanges,
            queues: HashMap::new(),
            bindings: Vec::new(),
            consumers: Vec::new(),
            unacked: HashMap::new(),
            published: Vec::new(),
            next_consumer: 0,
        }
    }
}

impl BrokerState {
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, EngineError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect());
        }
        if !self.exchanges.contains_key(exchange) {
            return Err(not_found("exchange", exchange));
        }

        let mut queues = Vec::new();
        let mut visited = HashSet::new();
        self.route_through(exchange, routing_key, &mut visited, &mut queues);
        Ok(queues)
    }

    fn route_through(
        &self,
        exchange: &str,
        routing_key: &str,
        visited: &mut HashSet<String>,
        queues: &mut Vec<String>,
    ) {
        if !visited.insert(exchange.to_string()) {
            return;
        }
        let Some(entry) = self.exchanges.get(exchange) else {
            return;
        };

        for binding in self.bindings.iter().filter(|b| b.source == exchange) {
            let matched = match entry.kind.as_str() {
                "fanout" | "headers" => true,
                "topic" => topic_matches(&binding.routing_key, routing_key),
                _ => binding.routing_key == routing_key,
            };
            if !matched {
                continue;
            }
            if binding.to_exchange {
                self.route_through(&binding.destination, routing_key, visited, queues);
            } else if !queues.contains(&binding.destination) {
                queues.push(binding.destination.clone());
            }
        }
    }

    fn consumer_count(&self, queue: &str) -> usize {
        self.consumers.iter().filter(|(_, c)| c.queue == queue).count()
    }

    fn requeue(&mut self, unacked: Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            let mut message = unacked.message;
            message.delivery.redelivered = true;
            queue.messages.push_front(message);
        }
    }
}

/// In-memory broker shared by every mock connection opened from one connector
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
    next_channel_key: Arc<AtomicU64>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.lock().exchanges.contains_key(name)
    }

    /// Ready messages in a queue, `None` if it does not exist
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.state.lock().queues.get(name).map(|q| q.messages.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state.lock().consumer_count(queue)
    }

    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }

    /// Every message accepted by `basic.publish`, routed or not
    pub fn published(&self) -> Vec<RawMessage> {
        self.state.lock().published.clone()
    }

    /// `(source, destination, routing_key)` for every binding
    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.state
            .lock()
            .bindings
            .iter()
            .map(|b| (b.source.clone(), b.destination.clone(), b.routing_key.clone()))
            .collect()
    }

    fn next_channel_key(&self) -> u64 {
        self.next_channel_key.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Connector opening mock connections against one broker
#[derive(Debug, Default)]
pub struct MockConnector {
    pub broker: MockBroker,
    pub should_fail: AtomicBool,
    open_count: AtomicUsize,
    connections: Mutex<Vec<Arc<MockEngineConnection>>>,
    last_config: Mutex<Option<ConnectionConfig>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_broker(broker: MockBroker) -> Self {
        Self {
            broker,
            ..Default::default()
        }
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn set_failure(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> Vec<Arc<MockEngineConnection>> {
        self.connections.lock().clone()
    }

    pub fn last_connection(&self) -> Option<Arc<MockEngineConnection>> {
        self.connections.lock().last().cloned()
    }

    pub fn last_config(&self) -> Option<ConnectionConfig> {
        self.last_config.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn EngineConnection>, EngineError> {
        self.open_count.fetch_add(1, Ordering::SeqCst);
        *self.last_config.lock() = Some(config.clone());

        if self.should_fail.load(Ordering::SeqCst) {
            return Err(EngineError::ConnectionClosed {
                reply_code: 403,
                reply_text:
                    "ACCESS_REFUSED - Login was refused using authentication mechanism PLAIN (10, 30)"
                        .to_string(),
            });
        }

        let connection = Arc::new(MockEngineConnection::with_broker(
            self.broker.clone(),
            config.heartbeat(),
        ));
        self.connections.lock().push(connection.clone());
        Ok(connection)
    }
}

/// Engine connection backed by a [`MockBroker`]
///
/// `check_heartbeat` only counts calls; it does not refresh `last_activity`,
/// so a stale connection is checked on every tick.
#[derive(Debug)]
pub struct MockEngineConnection {
    broker: MockBroker,
    heartbeat: u16,
    connected: Arc<AtomicBool>,
    writing: AtomicBool,
    fail_heartbeat: AtomicBool,
    drop_on_missed_heartbeat: AtomicBool,
    last_activity: Mutex<DateTime<Utc>>,
    heartbeat_checks: AtomicUsize,
    close_count: AtomicUsize,
    next_channel_id: AtomicU16,
    socket_timeouts: Mutex<Vec<(SocketDirection, SocketTimeout)>>,
    channels: Mutex<Vec<Arc<MockEngineChannel>>>,
}

impl MockEngineConnection {
    /// Connection with its own private broker
    pub fn new(heartbeat: u16) -> Self {
        Self::with_broker(MockBroker::new(), heartbeat)
    }

    pub fn with_broker(broker: MockBroker, heartbeat: u16) -> Self {
        Self {
            broker,
            heartbeat,
            connected: Arc::new(AtomicBool::new(true)),
            writing: AtomicBool::new(false),
            fail_heartbeat: AtomicBool::new(false),
            drop_on_missed_heartbeat: AtomicBool::new(true),
            last_activity: Mutex::new(Utc::now()),
            heartbeat_checks: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
            next_channel_id: AtomicU16::new(0),
            socket_timeouts: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_writing(&self, writing: bool) {
        self.writing.store(writing, Ordering::SeqCst);
    }

    pub fn set_last_activity(&self, at: DateTime<Utc>) {
        *self.last_activity.lock() = at;
    }

    /// Make every later heartbeat check report a missed server heartbeat
    pub fn fail_heartbeats(&self) {
        self.fail_heartbeat.store(true, Ordering::SeqCst);
    }

    /// Fail heartbeat checks while still reporting the socket as connected
    pub fn miss_heartbeats_silently(&self) {
        self.drop_on_missed_heartbeat.store(false, Ordering::SeqCst);
        self.fail_heartbeat.store(true, Ordering::SeqCst);
    }

    pub fn heartbeat_checks(&self) -> usize {
        self.heartbeat_checks.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn socket_timeouts(&self) -> Vec<(SocketDirection, SocketTimeout)> {
        self.socket_timeouts.lock().clone()
    }

    pub fn channels(&self) -> Vec<Arc<MockEngineChannel>> {
        self.channels.lock().clone()
    }

    pub fn last_channel(&self) -> Option<Arc<MockEngineChannel>> {
        self.channels.lock().last().cloned()
    }
}

#[async_trait]
impl EngineConnection for MockEngineConnection {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_writing(&self) -> bool {
        self.writing.load(Ordering::SeqCst)
    }

    fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }

    fn heartbeat(&self) -> u16 {
        self.heartbeat
    }

    async fn check_heartbeat(&self) -> Result<(), EngineError> {
        self.heartbeat_checks.fetch_add(1, Ordering::SeqCst);
        if self.fail_heartbeat.load(Ordering::SeqCst) {
            if self.drop_on_missed_heartbeat.load(Ordering::SeqCst) {
                self.connected.store(false, Ordering::SeqCst);
            }
            return Err(EngineError::HeartbeatMissed);
        }
        Ok(())
    }

    async fn open_channel(&self) -> Result<Arc<dyn EngineChannel>, EngineError> {
        if !self.is_connected() {
            return Err(connection_forced());
        }
        let id = self.next_channel_id.fetch_add(1, Ordering::SeqCst) + 1;
        let channel = Arc::new(MockEngineChannel::new(
            id,
            self.broker.clone(),
            self.connected.clone(),
        ));
        self.channels.lock().push(channel.clone());
        Ok(channel)
    }

    fn set_socket_timeout(
        &self,
        direction: SocketDirection,
        timeout: SocketTimeout,
    ) -> Result<(), EngineError> {
        if !self.is_connected() {
            return Err(connection_forced());
        }
        self.socket_timeouts.lock().push((direction, timeout));
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        for channel in self.channels.lock().iter() {
            channel.shut();
        }
        Ok(())
    }
}

/// Engine channel backed by a [`MockBroker`]
#[derive(Debug)]
pub struct MockEngineChannel {
    id: u16,
    key: u64,
    broker: MockBroker,
    connected: Arc<AtomicBool>,
    open: AtomicBool,
    next_delivery_tag: AtomicU64,
    in_transaction: AtomicBool,
    omit_declare_reply: AtomicBool,
    injected: Mutex<VecDeque<RawMessage>>,
    next_failure: Mutex<Option<EngineError>>,
    qos: Mutex<Option<(u32, u16, bool)>>,
    calls: Mutex<Vec<String>>,
}

impl MockEngineChannel {
    fn new(id: u16, broker: MockBroker, connected: Arc<AtomicBool>) -> Self {
        let key = broker.next_channel_key();
        Self {
            id,
            key,
            broker,
            connected,
            open: AtomicBool::new(true),
            next_delivery_tag: AtomicU64::new(0),
            in_transaction: AtomicBool::new(false),
            omit_declare_reply: AtomicBool::new(false),
            injected: Mutex::new(VecDeque::new()),
            next_failure: Mutex::new(None),
            qos: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue a delivery that bypasses routing, e.g. for an unknown consumer tag
    pub fn inject_delivery(&self, message: RawMessage) {
        self.injected.lock().push_back(message);
    }

    /// Make the next engine call fail with `error`
    pub fn fail_next(&self, error: EngineError) {
        *self.next_failure.lock() = Some(error);
    }

    /// Reply to `queue.declare` without any fields
    pub fn omit_declare_reply(&self) {
        self.omit_declare_reply.store(true, Ordering::SeqCst);
    }

    /// Close the channel from the broker side
    pub fn shut(&self) {
        self.open.store(false, Ordering::SeqCst);
        let mut state = self.broker.state.lock();
        state.consumers.retain(|(_, c)| c.channel_key != self.key);
    }

    pub fn qos(&self) -> Option<(u32, u16, bool)> {
        *self.qos.lock()
    }

    /// Names of the engine methods called on this channel, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn enter(&self, method: &str) -> Result<(), EngineError> {
        self.calls.lock().push(method.to_string());
        if let Some(error) = self.next_failure.lock().take() {
            if matches!(error, EngineError::ChannelClosed { .. }) {
                self.shut();
            }
            return Err(error);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(connection_forced());
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(EngineError::ChannelClosed {
                reply_code: 504,
                reply_text: "CHANNEL_ERROR - expected 'channel.open'".to_string(),
            });
        }
        Ok(())
    }

    /// Channel errors close the channel, as a broker would
    fn closing<T>(&self, result: Result<T, EngineError>) -> Result<T, EngineError> {
        if matches!(result, Err(EngineError::ChannelClosed { .. })) {
            self.shut();
        }
        result
    }

    fn take_delivery(&self) -> Option<RawMessage> {
        if let Some(message) = self.injected.lock().pop_front() {
            return Some(message);
        }

        let mut state = self.broker.state.lock();
        let consumers: Vec<(String, ConsumerEntry)> = state
            .consumers
            .iter()
            .filter(|(_, c)| c.channel_key == self.key)
            .cloned()
            .collect();

        for (tag, consumer) in consumers {
            let Some(mut message) = state
                .queues
                .get_mut(&consumer.queue)
                .and_then(|q| q.messages.pop_front())
            else {
                continue;
            };

            let delivery_tag = self.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1;
            message.delivery.consumer_tag = Some(tag);
            message.delivery.delivery_tag = delivery_tag;
            if !consumer.no_ack {
                state.unacked.insert(
                    (self.key, delivery_tag),
                    Unacked {
                        queue: consumer.queue.clone(),
                        message: message.clone(),
                    },
                );
            }
            return Some(message);
        }
        None
    }

    fn settle(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), EngineError> {
        let mut state = self.broker.state.lock();
        let tags: Vec<u64> = if multiple {
            let mut tags: Vec<u64> = state
                .unacked
                .keys()
                .filter(|(key, tag)| {
                    *key == self.key && (delivery_tag == 0 || *tag <= delivery_tag)
                })
                .map(|(_, tag)| *tag)
                .collect();
            tags.sort_unstable_by(|a, b| b.cmp(a));
            tags
        } else if state.unacked.contains_key(&(self.key, delivery_tag)) {
            vec![delivery_tag]
        } else {
            return Err(precondition_failed(format!(
                "unknown delivery tag {delivery_tag}"
            )));
        };

        for tag in tags {
            if let Some(unacked) = state.unacked.remove(&(self.key, tag)) {
                if requeue {
                    state.requeue(unacked);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EngineChannel for MockEngineChannel {
    fn channel_id(&self) -> u16 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn basic_qos(
        &self,
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    ) -> Result<(), EngineError> {
        self.enter("basic.qos")?;
        *self.qos.lock() = Some((prefetch_size, prefetch_count, global));
        Ok(())
    }

    async fn basic_publish(
        &self,
        message: RawMessage,
        publish: BasicPublish,
    ) -> Result<(), EngineError> {
        self.enter("basic.publish")?;
        let result = {
            let mut state = self.broker.state.lock();
            state.route(&publish.exchange, &publish.routing_key).map(|queues| {
                let mut message = message;
                message.delivery = DeliveryInfo {
                    consumer_tag: None,
                    delivery_tag: 0,
                    redelivered: false,
                    exchange: publish.exchange.clone(),
                    routing_key: publish.routing_key.clone(),
                };
                state.published.push(message.clone());
                for queue in queues {
                    if let Some(entry) = state.queues.get_mut(&queue) {
                        entry.messages.push_back(message.clone());
                    }
                }
            })
        };
        self.closing(result)
    }

    async fn basic_consume(&self, consume: BasicConsume) -> Result<String, EngineError> {
        self.enter("basic.consume")?;
        let result = {
            let mut state = self.broker.state.lock();
            if !state.queues.contains_key(&consume.queue) {
                Err(not_found("queue", &consume.queue))
            } else if !consume.consumer_tag.is_empty()
                && state.consumers.iter().any(|(t, _)| *t == consume.consumer_tag)
            {
                Err(EngineError::ConnectionClosed {
                    reply_code: 530,
                    reply_text: format!(
                        "NOT_ALLOWED - attempt to reuse consumer tag '{}'",
                        consume.consumer_tag
                    ),
                })
            } else {
                let tag = if consume.consumer_tag.is_empty() {
                    state.next_consumer += 1;
                    format!("amq.ctag-{}", state.next_consumer)
                } else {
                    consume.consumer_tag.clone()
                };
                state.consumers.push((
                    tag.clone(),
                    ConsumerEntry {
                        queue: consume.queue.clone(),
                        channel_key: self.key,
                        no_ack: consume.no_ack,
                    },
                ));
                Ok(tag)
            }
        };
        self.closing(result)
    }

    async fn basic_cancel(&self, consumer_tag: &str, _no_wait: bool) -> Result<(), EngineError> {
        self.enter("basic.cancel")?;
        self.broker
            .state
            .lock()
            .consumers
            .retain(|(tag, _)| tag != consumer_tag);
        Ok(())
    }

    async fn basic_get(
        &self,
        queue: &str,
        no_ack: bool,
    ) -> Result<Option<RawMessage>, EngineError> {
        self.enter("basic.get")?;
        let result = {
            let mut state = self.broker.state.lock();
            match state.queues.get_mut(queue) {
                None => Err(not_found("queue", queue)),
                Some(entry) => match entry.messages.pop_front() {
                    None => Ok(None),
                    Some(mut message) => {
                        let delivery_tag =
                            self.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1;
                        message.delivery.consumer_tag = None;
                        message.delivery.delivery_tag = delivery_tag;
                        if !no_ack {
                            state.unacked.insert(
                                (self.key, delivery_tag),
                                Unacked {
                                    queue: queue.to_string(),
                                    message: message.clone(),
                                },
                            );
                        }
                        Ok(Some(message))
                    }
                },
            }
        };
        self.closing(result)
    }

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), EngineError> {
        self.enter("basic.ack")?;
        self.closing(self.settle(delivery_tag, multiple, false))
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), EngineError> {
        self.enter("basic.nack")?;
        self.closing(self.settle(delivery_tag, multiple, requeue))
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), EngineError> {
        self.enter("basic.reject")?;
        self.closing(self.settle(delivery_tag, false, requeue))
    }

    /// The redelivery target is not modeled; both modes put messages back
    async fn basic_recover(&self, _requeue: bool) -> Result<(), EngineError> {
        self.enter("basic.recover")?;
        let mut state = self.broker.state.lock();
        let mut tags: Vec<(u64, u64)> = state
            .unacked
            .keys()
            .filter(|(key, _)| *key == self.key)
            .copied()
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(unacked) = state.unacked.remove(&tag) {
                state.requeue(unacked);
            }
        }
        Ok(())
    }

    async fn exchange_declare(&self, declare: ExchangeDeclare) -> Result<(), EngineError> {
        self.enter("exchange.declare")?;
        let result = {
            let mut state = self.broker.state.lock();
            match state.exchanges.get(&declare.exchange) {
                Some(existing) if !declare.passive && existing.kind != declare.kind => {
                    Err(precondition_failed(format!(
                        "inequivalent arg 'type' for exchange '{}' in vhost '/': received '{}' but current is '{}'",
                        declare.exchange, declare.kind, existing.kind
                    )))
                }
                Some(_) => Ok(()),
                None if declare.passive => Err(not_found("exchange", &declare.exchange)),
                None => {
                    state.exchanges.insert(
                        declare.exchange.clone(),
                        ExchangeEntry { kind: declare.kind },
                    );
                    Ok(())
                }
            }
        };
        self.closing(result)
    }

    async fn exchange_delete(
        &self,
        exchange: &str,
        if_unused: bool,
        _no_wait: bool,
    ) -> Result<(), EngineError> {
        self.enter("exchange.delete")?;
        let result = {
            let mut state = self.broker.state.lock();
            if !state.exchanges.contains_key(exchange) {
                Err(not_found("exchange", exchange))
            } else if if_unused && state.bindings.iter().any(|b| b.source == exchange) {
                Err(precondition_failed(format!("exchange '{exchange}' in use")))
            } else {
                state.exchanges.remove(exchange);
                state.bindings.retain(|b| {
                    b.source != exchange && !(b.to_exchange && b.destination == exchange)
                });
                Ok(())
            }
        };
        self.closing(result)
    }

    async fn exchange_bind(&self, binding: Binding) -> Result<(), EngineError> {
        self.enter("exchange.bind")?;
        let result = {
            let mut state = self.broker.state.lock();
            if !state.exchanges.contains_key(&binding.source) {
                Err(not_found("exchange", &binding.source))
            } else if !state.exchanges.contains_key(&binding.destination) {
                Err(not_found("exchange", &binding.destination))
            } else {
                let entry = BindingEntry {
                    source: binding.source,
                    destination: binding.destination,
                    routing_key: binding.routing_key,
                    to_exchange: true,
                };
                if !state.bindings.contains(&entry) {
                    state.bindings.push(entry);
                }
                Ok(())
            }
        };
        self.closing(result)
    }

    async fn exchange_unbind(&self, binding: Binding) -> Result<(), EngineError> {
        self.enter("exchange.unbind")?;
        self.broker.state.lock().bindings.retain(|b| {
            !(b.to_exchange
                && b.source == binding.source
                && b.destination == binding.destination
                && b.routing_key == binding.routing_key)
        });
        Ok(())
    }

    async fn queue_declare(&self, declare: QueueDeclare) -> Result<QueueDeclareOk, EngineError> {
        self.enter("queue.declare")?;
        if self.omit_declare_reply.load(Ordering::SeqCst) {
            return Ok(QueueDeclareOk::default());
        }
        let result = {
            let mut state = self.broker.state.lock();
            let name = if declare.queue.is_empty() {
                format!("amq.gen-{}", Uuid::new_v4().simple())
            } else {
                declare.queue.clone()
            };

            if declare.passive && !state.queues.contains_key(&name) {
                Err(not_found("queue", &name))
            } else {
                let message_count = state
                    .queues
                    .entry(name.clone())
                    .or_default()
                    .messages
                    .len();
                let consumer_count = state.consumer_count(&name);
                Ok(QueueDeclareOk {
                    queue: Some(name),
                    message_count: Some(message_count as u32),
                    consumer_count: Some(consumer_count as u32),
                })
            }
        };
        self.closing(result)
    }

    async fn queue_bind(&self, binding: Binding) -> Result<(), EngineError> {
        self.enter("queue.bind")?;
        let result = {
            let mut state = self.broker.state.lock();
            if !state.queues.contains_key(&binding.destination) {
                Err(not_found("queue", &binding.destination))
            } else if !state.exchanges.contains_key(&binding.source) {
                Err(not_found("exchange", &binding.source))
            } else {
                let entry = BindingEntry {
                    source: binding.source,
                    destination: binding.destination,
                    routing_key: binding.routing_key,
                    to_exchange: false,
                };
                if !state.bindings.contains(&entry) {
                    state.bindings.push(entry);
                }
                Ok(())
            }
        };
        self.closing(result)
    }

    async fn queue_unbind(&self, binding: Binding) -> Result<(), EngineError> {
        self.enter("queue.unbind")?;
        self.broker.state.lock().bindings.retain(|b| {
            !(!b.to_exchange
                && b.source == binding.source
                && b.destination == binding.destination
                && b.routing_key == binding.routing_key)
        });
        Ok(())
    }

    async fn queue_purge(&self, queue: &str) -> Result<u32, EngineError> {
        self.enter("queue.purge")?;
        let result = {
            let mut state = self.broker.state.lock();
            match state.queues.get_mut(queue) {
                None => Err(not_found("queue", queue)),
                Some(entry) => {
                    let purged = entry.messages.len() as u32;
                    entry.messages.clear();
                    Ok(purged)
                }
            }
        };
        self.closing(result)
    }

    async fn queue_delete(
        &self,
        queue: &str,
        if_unused: bool,
        if_empty: bool,
        _no_wait: bool,
    ) -> Result<u32, EngineError> {
        self.enter("queue.delete")?;
        let result = {
            let mut state = self.broker.state.lock();
            let depth = state.queues.get(queue).map(|q| q.messages.len());
            match depth {
                None => Ok(0),
                Some(_) if if_unused && state.consumer_count(queue) > 0 => {
                    Err(precondition_failed(format!("queue '{queue}' in use")))
                }
                Some(depth) if if_empty && depth > 0 => {
                    Err(precondition_failed(format!("queue '{queue}' not empty")))
                }
                Some(depth) => {
                    state.queues.remove(queue);
                    state
                        .bindings
                        .retain(|b| b.to_exchange || b.destination != queue);
                    state.consumers.retain(|(_, c)| c.queue != queue);
                    Ok(depth as u32)
                }
            }
        };
        self.closing(result)
    }

    async fn tx_select(&self) -> Result<(), EngineError> {
        self.enter("tx.select")?;
        self.in_transaction.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn tx_commit(&self) -> Result<(), EngineError> {
        self.enter("tx.commit")?;
        if !self.in_transaction.load(Ordering::SeqCst) {
            return self.closing(Err(precondition_failed(
                "channel is not transactional",
            )));
        }
        Ok(())
    }

    async fn tx_rollback(&self) -> Result<(), EngineError> {
        self.enter("tx.rollback")?;
        if !self.in_transaction.load(Ordering::SeqCst) {
            return self.closing(Err(precondition_failed(
                "channel is not transactional",
            )));
        }
        Ok(())
    }

    async fn wait(&self, timeout: Option<Duration>) -> Result<RawMessage, EngineError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(connection_forced());
            }
            if let Some(message) = self.take_delivery() {
                return Ok(message);
            }
            if !self.open.load(Ordering::SeqCst) {
                return Err(EngineError::ChannelClosed {
                    reply_code: 504,
                    reply_text: "CHANNEL_ERROR - channel closed while waiting".to_string(),
                });
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(EngineError::Timeout);
                    }
                    POLL_INTERVAL.min(deadline - now)
                }
                None => POLL_INTERVAL,
            };
            tokio::time::sleep(pause).await;
        }
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.calls.lock().push("channel.close".to_string());
        self.shut();
        Ok(())
    }
}

/// One call recorded by [`RecordingScheduler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    Registered { id: ConnectionId, interval: Duration },
    Unregistered { id: ConnectionId },
}

/// Scheduler that records calls and never ticks
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    events: Mutex<Vec<SchedulerEvent>>,
    registered: Mutex<HashMap<ConnectionId, HeartbeatTarget>>,
}

impl RecordingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SchedulerEvent> {
        self.events.lock().clone()
    }

    pub fn registered_count(&self) -> usize {
        self.registered.lock().len()
    }

    /// Registration for a connection, to drive ticks by hand
    pub fn target(&self, id: ConnectionId) -> Option<HeartbeatTarget> {
        self.registered.lock().get(&id).cloned()
    }
}

impl HeartbeatScheduler for RecordingScheduler {
    fn register(&self, id: ConnectionId, target: HeartbeatTarget, interval: Duration) {
        self.events
            .lock()
            .push(SchedulerEvent::Registered { id, interval });
        self.registered.lock().insert(id, target);
    }

    fn unregister(&self, id: ConnectionId) {
        self.events.lock().push(SchedulerEvent::Unregistered { id });
        self.registered.lock().remove(&id);
    }

    fn is_registered(&self, id: ConnectionId) -> bool {
        self.registered.lock().contains_key(&id)
    }
}
