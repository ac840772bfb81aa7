//! Consumer callbacks and the per-channel consumer registry

use crate::client::queue::Queue;
use crate::error::AmqpResult;
use crate::protocol::Envelope;
use async_trait::async_trait;
use std::collections::HashMap;

/// Whether a consume loop keeps going after a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Continue,
    Stop,
}

/// Receives deliveries from [`Queue::consume`]
///
/// Returning an error ends the consume loop and propagates the error to the
/// caller of `consume`.
#[async_trait]
pub trait Consumer: Send {
    async fn on_delivery(
        &mut self,
        envelope: Envelope,
        queue: &Queue<'_>,
    ) -> AmqpResult<ConsumeOutcome>;
}

/// [`Consumer`] backed by a synchronous closure
pub struct FnConsumer<F>(F);

/// Wrap a closure as a [`Consumer`]
pub fn consumer_fn<F>(f: F) -> FnConsumer<F>
where
    F: FnMut(Envelope, &Queue<'_>) -> AmqpResult<ConsumeOutcome> + Send,
{
    FnConsumer(f)
}

#[async_trait]
impl<F> Consumer for FnConsumer<F>
where
    F: FnMut(Envelope, &Queue<'_>) -> AmqpResult<ConsumeOutcome> + Send,
{
    async fn on_delivery(
        &mut self,
        envelope: Envelope,
        queue: &Queue<'_>,
    ) -> AmqpResult<ConsumeOutcome> {
        (self.0)(envelope, queue)
    }
}

/// Consumer tags active on one channel, mapped to the queue they consume
#[derive(Debug, Default, Clone)]
pub struct ConsumerRegistry {
    consumers: HashMap<String, String>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, consumer_tag: impl Into<String>, queue: impl Into<String>) {
        self.consumers.insert(consumer_tag.into(), queue.into());
    }

    pub fn remove(&mut self, consumer_tag: &str) -> Option<String> {
        self.consumers.remove(consumer_tag)
    }

    pub fn contains(&self, consumer_tag: &str) -> bool {
        self.consumers.contains_key(consumer_tag)
    }

    pub fn queue_for(&self, consumer_tag: &str) -> Option<&str> {
        self.consumers.get(consumer_tag).map(String::as_str)
    }

    /// Registered tags in lexical order
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.consumers.keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    pub fn clear(&mut self) {
        self.consumers.clear();
    }
}
