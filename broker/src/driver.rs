//! Narrow seam over the underlying AMQP driver.
//!
//! The connection manager, channel registry and facades speak to these
//! traits only, so the delivery pipeline can be exercised against a scripted
//! in-memory driver while production code runs on lapin.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::config::ExchangeKind;
use crate::endpoint::Endpoint;
use crate::error::DriverError;
use crate::message::MessageProperties;

/// Close event shared between a driver entity and its supervisor task.
///
/// Waiters registered after the signal fires still observe it.
#[derive(Clone)]
pub struct CloseSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(false);
        Self { sender: Arc::new(sender) }
    }

    pub fn notify(&self) {
        let _ = self.sender.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn wait(&self) -> BoxFuture<'static, ()> {
        let mut receiver = self.sender.subscribe();
        Box::pin(async move {
            while !*receiver.borrow_and_update() {
                if receiver.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Exchange declaration handed to the driver.
#[derive(Debug, Clone)]
pub struct ExchangeDeclare {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub internal: bool,
    pub auto_delete: bool,
    pub arguments: HashMap<String, Value>,
}

/// Queue declaration handed to the driver. An empty name requests a
/// server-generated one.
#[derive(Debug, Clone)]
pub struct QueueDeclare {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: HashMap<String, Value>,
}

/// One inbound delivery as handed over by the driver.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Bytes,
    pub properties: MessageProperties,
}

/// A registered consumer: its server-assigned tag plus the delivery stream.
pub struct Subscription {
    pub consumer_tag: String,
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

/// Dials endpoints.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    async fn dial(&self, endpoint: &Endpoint) -> Result<Arc<dyn DriverConnection>, DriverError>;
}

/// An established connection.
#[async_trait]
pub trait DriverConnection: Send + Sync + 'static {
    async fn open_channel(&self) -> Result<Arc<dyn DriverChannel>, DriverError>;

    async fn close(&self) -> Result<(), DriverError>;

    /// Resolves when the connection closes, voluntarily or not.
    fn closed(&self) -> BoxFuture<'static, ()>;

    fn is_connected(&self) -> bool;
}

/// A channel multiplexed on a connection.
#[async_trait]
pub trait DriverChannel: Send + Sync + 'static {
    async fn declare_exchange(&self, declare: ExchangeDeclare) -> Result<(), DriverError>;

    async fn delete_exchange(&self, name: &str) -> Result<(), DriverError>;

    /// Declares a queue and returns its actual (possibly server-generated)
    /// name.
    async fn declare_queue(&self, declare: QueueDeclare) -> Result<String, DriverError>;

    async fn delete_queue(&self, name: &str) -> Result<(), DriverError>;

    async fn purge_queue(&self, name: &str) -> Result<(), DriverError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), DriverError>;

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), DriverError>;

    /// Publishes to an exchange; an empty exchange name addresses the queue
    /// named by the routing key directly.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), DriverError>;

    async fn consume(&self, queue: &str) -> Result<Subscription, DriverError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), DriverError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), DriverError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), DriverError>;

    async fn prefetch(&self, count: u16) -> Result<(), DriverError>;

    async fn close(&self) -> Result<(), DriverError>;

    /// Resolves when the channel closes, voluntarily or not.
    fn closed(&self) -> BoxFuture<'static, ()>;

    fn is_open(&self) -> bool;
}
