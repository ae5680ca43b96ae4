//! Inbound messages and delivery acknowledgement.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::driver::DriverChannel;
use crate::error::BrokerError;

/// Message properties carried alongside a payload, on both the publish and
/// the delivery path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: Option<HashMap<String, Value>>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    /// Milliseconds since the epoch.
    pub timestamp: Option<u64>,
    /// The AMQP `type` property.
    pub kind: Option<String>,
    pub app_id: Option<String>,
    pub expiration: Option<String>,
    pub delivery_mode: Option<u8>,
}

impl MessageProperties {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_encoding(mut self, content_encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(content_encoding.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, Value>) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    pub fn with_expiration(mut self, expiration: impl Into<String>) -> Self {
        self.expiration = Some(expiration.into());
        self
    }

    pub fn with_delivery_mode(mut self, delivery_mode: u8) -> Self {
        self.delivery_mode = Some(delivery_mode);
        self
    }
}

/// Decoded message content: parsed JSON when the content type says so, raw
/// bytes otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Json(Value),
    Raw(Bytes),
}

impl Content {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Content::Json(value) => Some(value),
            Content::Raw(_) => None,
        }
    }

    pub fn as_raw(&self) -> Option<&Bytes> {
        match self {
            Content::Json(_) => None,
            Content::Raw(bytes) => Some(bytes),
        }
    }
}

/// One delivered message, as handed to subscriber handlers.
#[derive(Clone)]
pub struct Message {
    pub content: Content,
    pub properties: MessageProperties,
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    acker: Acker,
}

impl Message {
    pub(crate) fn new(
        content: Content,
        properties: MessageProperties,
        exchange: String,
        routing_key: String,
        delivery_tag: u64,
        redelivered: bool,
        acker: Acker,
    ) -> Self {
        Self { content, properties, exchange, routing_key, delivery_tag, redelivered, acker }
    }

    /// Deserialize the content into a concrete type.
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.content {
            Content::Json(value) => serde_json::from_value(value.clone()),
            Content::Raw(bytes) => serde_json::from_slice(bytes),
        }
    }

    /// Acknowledge this delivery. Settling is one-shot; later calls are
    /// no-ops.
    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Reject this delivery under the queue's requeue policy.
    pub async fn nack(&self) -> Result<(), BrokerError> {
        self.acker.nack().await
    }

    pub fn acker(&self) -> Acker {
        self.acker.clone()
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("content", &self.content)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// One-shot acknowledgement handle for a delivery: the first ack or nack
/// wins, everything after is a no-op.
///
/// The nack requeue flag is fixed at subscribe time: deliveries from queues
/// without a dead-letter exchange are requeued, deliveries from queues with
/// one are dead-lettered.
#[derive(Clone)]
pub struct Acker {
    inner: Arc<AckerInner>,
}

struct AckerInner {
    channel: Arc<dyn DriverChannel>,
    delivery_tag: u64,
    requeue_on_failure: bool,
    settled: AtomicBool,
}

impl Acker {
    pub(crate) fn new(channel: Arc<dyn DriverChannel>, delivery_tag: u64, requeue_on_failure: bool) -> Self {
        Self {
            inner: Arc::new(AckerInner {
                channel,
                delivery_tag,
                requeue_on_failure,
                settled: AtomicBool::new(false),
            }),
        }
    }

    pub async fn ack(&self) -> Result<(), BrokerError> {
        if self.inner.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.channel.ack(self.inner.delivery_tag).await?;
        Ok(())
    }

    pub async fn nack(&self) -> Result<(), BrokerError> {
        if self.inner.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.channel.nack(self.inner.delivery_tag, self.inner.requeue_on_failure).await?;
        Ok(())
    }

    /// Signal form: `true` acknowledges, `false` rejects.
    pub async fn settle(&self, success: bool) -> Result<(), BrokerError> {
        if success { self.ack().await } else { self.nack().await }
    }

    pub fn is_settled(&self) -> bool {
        self.inner.settled.load(Ordering::SeqCst)
    }
}
