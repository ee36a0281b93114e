//! Per-user command/status channel over a durable message bus.
//!
//! Each user gets a topic `sha256(user_id ":" secret)` and two queues bound to it:
//! `<topic>.cmd` (front end -> worker) and `<topic>.status` (worker -> front end).
//! Delivery is at-least-once with FIFO order per queue. Durability belongs to the bus;
//! the channel only retries and reconnects.

use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, Stream};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use trader_engine::config::RetryConfig;
use trader_engine::error::ErrorKind;

use crate::message::ControlMessage;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// Bus unreachable or the command failed; retried transparently by the channel
    #[error("message bus delivery failed: {0}")]
    Delivery(String),
    #[error("malformed control message: {0}")]
    Codec(#[from] serde_json::Error),
}

impl ChannelError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ChannelDelivery
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Delivery(_))
    }
}

/// Durable FIFO queues keyed by name
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Append to the tail of `queue`
    async fn push(&self, queue: &str, payload: String) -> Result<(), ChannelError>;

    /// Block until the head of `queue` is available or `timeout` elapses
    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>, ChannelError>;

    /// Drop everything queued on `queue`. Returns how many messages were discarded.
    async fn clear(&self, queue: &str) -> Result<usize, ChannelError>;
}

/// One-way topic for a user. The secret never leaves the process that holds it.
pub fn topic_hash(user_id: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b":");
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn command_queue(topic: &str) -> String {
    format!("{}.cmd", topic)
}

pub fn status_queue(topic: &str) -> String {
    format!("{}.status", topic)
}

/// Retry policy for publishing and for reconnecting consumers. Backoff follows the
/// same [`RetryConfig`] the engine applies to exchange calls.
#[derive(Debug, Clone)]
pub struct ChannelRetry {
    pub backoff: RetryConfig,
    /// Longest single blocking pop before the consumer loops
    pub poll_timeout: Duration,
}

impl Default for ChannelRetry {
    fn default() -> Self {
        Self {
            backoff: RetryConfig::default(),
            poll_timeout: Duration::from_secs(5),
        }
    }
}

pub type MessageStream = Pin<Box<dyn Stream<Item = Result<ControlMessage, ChannelError>> + Send>>;

/// Publish with bounded retry. Used for any queue, including the shared lifecycle queue.
pub async fn publish_to(
    bus: &dyn MessageBus,
    retry: &ChannelRetry,
    queue: &str,
    message: &ControlMessage,
) -> Result<(), ChannelError> {
    let raw = message.to_json()?;
    let mut attempt = 1;
    loop {
        match bus.push(queue, raw.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt < retry.backoff.max_attempts => {
                let delay = retry.backoff.delay_for(attempt);
                warn!(queue, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Publish failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Lazy, never-ending stream of the messages arriving on `queue`.
///
/// Bus failures are not yielded: the stream backs off and reconnects. Malformed payloads
/// are yielded as `Codec` errors so the consumer can report them and move on.
pub fn consume_from(bus: Arc<dyn MessageBus>, queue: String, retry: ChannelRetry) -> MessageStream {
    Box::pin(stream::unfold(
        (bus, queue, retry, 0u32),
        |(bus, queue, retry, mut failures)| async move {
            loop {
                match bus.pop(&queue, retry.poll_timeout).await {
                    Ok(Some(raw)) => {
                        if failures > 0 {
                            debug!(queue = %queue, "Consumer reconnected");
                        }
                        let item = ControlMessage::from_json(&raw).map_err(ChannelError::from);
                        return Some((item, (bus, queue, retry, 0)));
                    }
                    Ok(None) => failures = 0,
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        let delay = retry.backoff.delay_for(failures);
                        warn!(queue = %queue, failures, delay_ms = delay.as_millis() as u64, error = %e, "Consume failed, reconnecting");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        },
    ))
}

/// A user's command and status queues
#[derive(Clone)]
pub struct MessageChannel {
    bus: Arc<dyn MessageBus>,
    topic: String,
    retry: ChannelRetry,
}

impl MessageChannel {
    pub fn new(bus: Arc<dyn MessageBus>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
            retry: ChannelRetry::default(),
        }
    }

    /// Derive the topic from the user id and the channel secret
    pub fn for_user(bus: Arc<dyn MessageBus>, user_id: &str, secret: &str) -> Self {
        Self::new(bus, topic_hash(user_id, secret))
    }

    pub fn with_retry(mut self, retry: ChannelRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn command_queue(&self) -> String {
        command_queue(&self.topic)
    }

    pub fn status_queue(&self) -> String {
        status_queue(&self.topic)
    }

    /// Discard commands nobody consumed, e.g. a stop aimed at a worker that already exited
    pub async fn clear_commands(&self) -> Result<usize, ChannelError> {
        self.bus.clear(&self.command_queue()).await
    }

    pub async fn publish_command(&self, message: &ControlMessage) -> Result<(), ChannelError> {
        publish_to(self.bus.as_ref(), &self.retry, &self.command_queue(), message).await
    }

    pub async fn publish_status(&self, message: &ControlMessage) -> Result<(), ChannelError> {
        publish_to(self.bus.as_ref(), &self.retry, &self.status_queue(), message).await
    }

    pub fn consume_commands(&self) -> MessageStream {
        consume_from(self.bus.clone(), self.command_queue(), self.retry.clone())
    }

    pub fn consume_status(&self) -> MessageStream {
        consume_from(self.bus.clone(), self.status_queue(), self.retry.clone())
    }
}

/// Remembers the most recent dedup ids, oldest evicted first
#[derive(Debug)]
pub struct Deduplicator {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl Deduplicator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// `true` when the message was already processed. Messages without an id always pass.
    pub fn is_duplicate(&mut self, message: &ControlMessage) -> bool {
        let Some(id) = &message.dedup_id else {
            return false;
        };
        if self.seen.contains(id) {
            return true;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.order.push_back(id.clone());
        self.seen.insert(id.clone());
        false
    }
}

/// Front-end view of a status queue: latest payload per event, last value wins
#[derive(Debug, Default)]
pub struct StatusView {
    latest: HashMap<String, Value>,
}

impl StatusView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a status or error message. Returns `false` when nothing changed.
    pub fn apply(&mut self, message: &ControlMessage) -> bool {
        let Some(event) = message.event() else {
            return false;
        };
        if self.latest.get(event) == Some(&message.payload) {
            return false;
        }
        self.latest.insert(event.to_string(), message.payload.clone());
        true
    }

    pub fn get(&self, event: &str) -> Option<&Value> {
        self.latest.get(event)
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBus;
    use futures::StreamExt;
    use serde_json::json;

    #[test]
    fn topic_is_stable_and_hides_the_secret() {
        let topic = topic_hash("42", "s3cret");
        assert_eq!(topic, topic_hash("42", "s3cret"));
        assert_ne!(topic, topic_hash("43", "s3cret"));
        assert_eq!(topic.len(), 64);
        assert!(!topic.contains("s3cret"));
        assert_eq!(command_queue(&topic), format!("{}.cmd", topic));
    }

    #[tokio::test]
    async fn queue_order_is_fifo() {
        let bus = Arc::new(MemoryBus::new());
        let channel = MessageChannel::for_user(bus, "42", "secret");
        for n in 1..=3 {
            channel
                .publish_status(&ControlMessage::status("42", "tick", json!(n)))
                .await
                .unwrap();
        }

        let received: Vec<Value> = channel
            .consume_status()
            .take(3)
            .map(|m| m.unwrap().payload["data"].clone())
            .collect()
            .await;
        assert_eq!(received, vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_retries_transient_failures() {
        let bus = Arc::new(MemoryBus::new());
        bus.fail_next(2);
        let channel = MessageChannel::new(bus.clone(), "t");

        channel.publish_command(&ControlMessage::stop("1")).await.unwrap();
        assert_eq!(bus.len("t.cmd"), 1);

        bus.fail_next(10);
        let err = channel.publish_command(&ControlMessage::stop("1")).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::ChannelDelivery);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_backs_off_like_exchange_calls() {
        let bus = Arc::new(MemoryBus::new());
        let channel = MessageChannel::new(bus.clone(), "t");
        let backoff = RetryConfig::default();

        bus.fail_next(2);
        let started = tokio::time::Instant::now();
        channel.publish_command(&ControlMessage::stop("1")).await.unwrap();
        assert_eq!(started.elapsed(), backoff.delay_for(1) + backoff.delay_for(2));
    }

    #[tokio::test]
    async fn clearing_commands_leaves_status_untouched() {
        let bus = Arc::new(MemoryBus::new());
        let channel = MessageChannel::new(bus.clone(), "t");
        channel.publish_command(&ControlMessage::stop("1")).await.unwrap();
        channel.publish_command(&ControlMessage::stop("1")).await.unwrap();
        channel
            .publish_status(&ControlMessage::status("1", "tick", json!(1)))
            .await
            .unwrap();

        assert_eq!(channel.clear_commands().await.unwrap(), 2);
        assert_eq!(channel.clear_commands().await.unwrap(), 0);
        assert_eq!(bus.len("t.cmd"), 0);
        assert_eq!(bus.len("t.status"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn consumer_recovers_after_bus_outage() {
        let bus = Arc::new(MemoryBus::new());
        let channel = MessageChannel::new(bus.clone(), "t");
        channel.publish_command(&ControlMessage::stop("1")).await.unwrap();
        bus.fail_next(3);

        let mut commands = channel.consume_commands();
        let msg = commands.next().await.unwrap().unwrap();
        assert_eq!(msg.kind, crate::message::MessageType::Stop);
    }

    #[tokio::test]
    async fn malformed_messages_surface_as_codec_errors() {
        let bus = Arc::new(MemoryBus::new());
        bus.push("t.cmd", "not json".to_string()).await.unwrap();
        let channel = MessageChannel::new(bus, "t");

        let first = channel.consume_commands().next().await.unwrap();
        assert!(matches!(first, Err(ChannelError::Codec(_))));
    }

    #[test]
    fn duplicate_status_does_not_change_the_view() {
        let mut view = StatusView::new();
        let snapshot = ControlMessage::status("1", "snapshot", json!({"equity": 100.0}));

        assert!(view.apply(&snapshot));
        assert!(!view.apply(&snapshot.clone()));
        assert!(view.apply(&ControlMessage::status("1", "snapshot", json!({"equity": 101.0}))));
        assert_eq!(view.len(), 1);
        assert_eq!(view.get("snapshot").unwrap()["data"]["equity"], 101.0);
    }

    #[test]
    fn dedup_ids_are_remembered_up_to_capacity() {
        let mut dedup = Deduplicator::new(2);
        let a = ControlMessage::stop("1").with_dedup_id("a");
        let b = ControlMessage::stop("1").with_dedup_id("b");
        let c = ControlMessage::stop("1").with_dedup_id("c");

        assert!(!dedup.is_duplicate(&a));
        assert!(dedup.is_duplicate(&a));
        assert!(!dedup.is_duplicate(&b));
        assert!(!dedup.is_duplicate(&c));
        // evicted
        assert!(!dedup.is_duplicate(&a));
        assert!(!dedup.is_duplicate(&ControlMessage::stop("1")));
        assert!(!dedup.is_duplicate(&ControlMessage::stop("1")));
    }
}
