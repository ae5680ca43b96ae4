//! Scripted in-memory driver for exercising connection management and the
//! delivery pipeline without a RabbitMQ server.
//!
//! Only compiled with the `test-support` feature.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::ExchangeKind;
use crate::driver::{
    CloseSignal, Delivery, Driver, DriverChannel, DriverConnection, ExchangeDeclare, QueueDeclare, Subscription,
};
use crate::endpoint::Endpoint;
use crate::error::DriverError;
use crate::message::{Acker, Content, Message, MessageProperties};

/// Build a standalone message for handler tests; its acker settles against a
/// throwaway channel.
pub fn test_message(content: Value) -> Arc<Message> {
    let server = Arc::new(MockServer::default());
    let channel: Arc<dyn DriverChannel> = Arc::new(MockChannel::new(server, Arc::new(AtomicBool::new(true))));
    let acker = Acker::new(channel, 1, true);
    Arc::new(Message::new(
        Content::Json(content),
        MessageProperties::default(),
        String::new(),
        String::new(),
        1,
        false,
        acker,
    ))
}

/// Driver double with scripted dial outcomes, a dial log and kill switches.
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<MockDriverState>,
}

#[derive(Default)]
struct MockDriverState {
    server: Arc<MockServer>,
    dialed: Mutex<Vec<Endpoint>>,
    refuse_budget: Mutex<u64>,
    refuse_all: AtomicBool,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` dials.
    pub fn refuse_next(&self, count: u64) {
        *self.state.refuse_budget.lock() = count;
    }

    /// Refuse every dial until switched off.
    pub fn refuse_all(&self, refuse: bool) {
        self.state.refuse_all.store(refuse, Ordering::SeqCst);
    }

    pub fn dial_count(&self) -> usize {
        self.state.dialed.lock().len()
    }

    pub fn dialed_hosts(&self) -> Vec<String> {
        self.state.dialed.lock().iter().map(|endpoint| endpoint.hostname.clone()).collect()
    }

    pub fn dialed_ports(&self) -> Vec<u16> {
        self.state.dialed.lock().iter().map(|endpoint| endpoint.port).collect()
    }

    /// The most recently established connection, if any.
    pub fn current_connection(&self) -> Option<Arc<MockConnection>> {
        self.state.connections.lock().last().cloned()
    }

    /// Involuntarily drop the current connection, as if the socket died.
    pub fn kill_connection(&self) {
        if let Some(connection) = self.current_connection() {
            connection.kill();
        }
    }

    /// The shared in-memory broker state behind all connections.
    pub fn server(&self) -> Arc<MockServer> {
        self.state.server.clone()
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn dial(&self, endpoint: &Endpoint) -> Result<Arc<dyn DriverConnection>, DriverError> {
        self.state.dialed.lock().push(endpoint.clone());

        let refused = self.state.refuse_all.load(Ordering::SeqCst) || {
            let mut budget = self.state.refuse_budget.lock();
            if *budget > 0 {
                *budget -= 1;
                true
            } else {
                false
            }
        };
        if refused {
            return Err(DriverError::new(format!("connection refused: {}:{}", endpoint.hostname, endpoint.port)));
        }

        let connection = Arc::new(MockConnection::new(self.state.server.clone()));
        self.state.connections.lock().push(connection.clone());
        Ok(connection)
    }
}

/// One established mock connection.
pub struct MockConnection {
    server: Arc<MockServer>,
    open: Arc<AtomicBool>,
    signal: CloseSignal,
    channels: Mutex<Vec<Arc<MockChannel>>>,
}

impl MockConnection {
    fn new(server: Arc<MockServer>) -> Self {
        Self {
            server,
            open: Arc::new(AtomicBool::new(true)),
            signal: CloseSignal::new(),
            channels: Mutex::new(Vec::new()),
        }
    }

    /// Channels opened on this connection, in creation order.
    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.channels.lock().clone()
    }

    /// Drop the connection and everything multiplexed on it.
    pub fn kill(&self) {
        self.open.store(false, Ordering::SeqCst);
        for channel in self.channels.lock().iter() {
            channel.kill();
        }
        self.signal.notify();
    }
}

#[async_trait]
impl DriverConnection for MockConnection {
    async fn open_channel(&self) -> Result<Arc<dyn DriverChannel>, DriverError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(DriverError::new("connection is closed"));
        }
        let channel = Arc::new(MockChannel::new(self.server.clone(), self.open.clone()));
        self.channels.lock().push(channel.clone());
        Ok(channel)
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.kill();
        Ok(())
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        self.signal.wait()
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// One mock channel; operations fail once the channel or its connection is
/// gone.
pub struct MockChannel {
    server: Arc<MockServer>,
    connection_open: Arc<AtomicBool>,
    open: AtomicBool,
    signal: CloseSignal,
    acks: Mutex<Vec<u64>>,
    nacks: Mutex<Vec<(u64, bool)>>,
    prefetch: Mutex<Option<u16>>,
}

impl MockChannel {
    fn new(server: Arc<MockServer>, connection_open: Arc<AtomicBool>) -> Self {
        Self {
            server,
            connection_open,
            open: AtomicBool::new(true),
            signal: CloseSignal::new(),
            acks: Mutex::new(Vec::new()),
            nacks: Mutex::new(Vec::new()),
            prefetch: Mutex::new(None),
        }
    }

    /// Drop the channel as if the server closed it.
    pub fn kill(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.signal.notify();
    }

    pub fn acked(&self) -> Vec<u64> {
        self.acks.lock().clone()
    }

    pub fn nacked(&self) -> Vec<(u64, bool)> {
        self.nacks.lock().clone()
    }

    pub fn prefetch_count(&self) -> Option<u16> {
        *self.prefetch.lock()
    }

    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.open.load(Ordering::SeqCst) && self.connection_open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DriverError::new("channel is closed"))
        }
    }
}

#[async_trait]
impl DriverChannel for MockChannel {
    async fn declare_exchange(&self, declare: ExchangeDeclare) -> Result<(), DriverError> {
        self.ensure_open()?;
        self.server.declare_exchange(declare);
        Ok(())
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), DriverError> {
        self.ensure_open()?;
        self.server.exchanges.lock().remove(name);
        Ok(())
    }

    async fn declare_queue(&self, declare: QueueDeclare) -> Result<String, DriverError> {
        self.ensure_open()?;
        Ok(self.server.declare_queue(declare))
    }

    async fn delete_queue(&self, name: &str) -> Result<(), DriverError> {
        self.ensure_open()?;
        self.server.queues.lock().remove(name);
        Ok(())
    }

    async fn purge_queue(&self, name: &str) -> Result<(), DriverError> {
        self.ensure_open()?;
        if let Some(queue) = self.server.queue(name) {
            queue.messages.lock().clear();
        }
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), DriverError> {
        self.ensure_open()?;
        self.server.bind_queue(queue, exchange, routing_key)
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), DriverError> {
        self.ensure_open()?;
        if let Some(entry) = self.server.exchanges.lock().get_mut(exchange) {
            entry.bindings.retain(|binding| !(binding.queue == queue && binding.routing_key == routing_key));
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), DriverError> {
        self.ensure_open()?;
        let message = StoredMessage {
            payload: Bytes::copy_from_slice(payload),
            properties: properties.clone(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            redelivered: false,
        };
        self.server.publish(exchange, routing_key, message)
    }

    async fn consume(&self, queue: &str) -> Result<Subscription, DriverError> {
        self.ensure_open()?;
        self.server.consume(queue)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), DriverError> {
        self.ensure_open()?;
        self.server.cancel(consumer_tag);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), DriverError> {
        self.ensure_open()?;
        self.acks.lock().push(delivery_tag);
        self.server.ack(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), DriverError> {
        self.ensure_open()?;
        self.nacks.lock().push((delivery_tag, requeue));
        self.server.nack(delivery_tag, requeue)
    }

    async fn prefetch(&self, count: u16) -> Result<(), DriverError> {
        self.ensure_open()?;
        *self.prefetch.lock() = Some(count);
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.kill();
        Ok(())
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        self.signal.wait()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection_open.load(Ordering::SeqCst)
    }
}

/// A message parked in a mock queue or in flight to a consumer.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub payload: Bytes,
    pub properties: MessageProperties,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
}

struct Binding {
    queue: String,
    routing_key: String,
}

struct MockExchange {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

#[derive(Default)]
struct MockQueue {
    messages: Mutex<VecDeque<StoredMessage>>,
    consumer: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    dead_letter_exchange: Option<String>,
    dead_letter_routing_key: Option<String>,
}

/// In-memory broker state shared by every mock connection, so declared
/// topology and parked messages survive reconnects.
#[derive(Default)]
pub struct MockServer {
    exchanges: Mutex<HashMap<String, MockExchange>>,
    queues: Mutex<HashMap<String, Arc<MockQueue>>>,
    consumers: Mutex<HashMap<String, String>>,
    unacked: Mutex<HashMap<u64, (String, StoredMessage)>>,
    next_delivery_tag: AtomicU64,
    next_consumer_id: AtomicU64,
    next_generated_queue: AtomicU64,
    exchange_declares: Mutex<Vec<String>>,
    queue_declares: Mutex<Vec<String>>,
}

impl MockServer {
    fn queue(&self, name: &str) -> Option<Arc<MockQueue>> {
        self.queues.lock().get(name).cloned()
    }

    fn declare_exchange(&self, declare: ExchangeDeclare) {
        self.exchange_declares.lock().push(declare.name.clone());
        self.exchanges
            .lock()
            .entry(declare.name)
            .or_insert_with(|| MockExchange { kind: declare.kind, bindings: Vec::new() });
    }

    fn declare_queue(&self, declare: QueueDeclare) -> String {
        let name = if declare.name.is_empty() {
            format!("amq.gen-{}", self.next_generated_queue.fetch_add(1, Ordering::SeqCst))
        } else {
            declare.name.clone()
        };
        self.queue_declares.lock().push(name.clone());
        self.queues.lock().entry(name.clone()).or_insert_with(|| {
            Arc::new(MockQueue {
                dead_letter_exchange: declare
                    .arguments
                    .get("x-dead-letter-exchange")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                dead_letter_routing_key: declare
                    .arguments
                    .get("x-dead-letter-routing-key")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                ..Default::default()
            })
        });
        name
    }

    fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), DriverError> {
        let mut exchanges = self.exchanges.lock();
        let Some(entry) = exchanges.get_mut(exchange) else {
            return Err(DriverError::new(format!("no exchange '{exchange}'")));
        };
        entry.bindings.push(Binding { queue: queue.to_string(), routing_key: routing_key.to_string() });
        Ok(())
    }

    fn publish(&self, exchange: &str, routing_key: &str, message: StoredMessage) -> Result<(), DriverError> {
        if exchange.is_empty() {
            self.deliver(routing_key, message);
            return Ok(());
        }

        let targets: Vec<String> = {
            let exchanges = self.exchanges.lock();
            let Some(entry) = exchanges.get(exchange) else {
                return Err(DriverError::new(format!("no exchange '{exchange}'")));
            };
            entry
                .bindings
                .iter()
                .filter(|binding| match entry.kind {
                    ExchangeKind::Direct => binding.routing_key == routing_key,
                    ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                    ExchangeKind::Fanout | ExchangeKind::Headers => true,
                })
                .map(|binding| binding.queue.clone())
                .collect()
        };

        for queue in targets {
            self.deliver(&queue, message.clone());
        }
        Ok(())
    }

    fn deliver(&self, queue_name: &str, message: StoredMessage) {
        let Some(queue) = self.queue(queue_name) else {
            return;
        };
        let mut consumer = queue.consumer.lock();
        if let Some(sender) = consumer.clone() {
            let tag = self.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1;
            self.unacked.lock().insert(tag, (queue_name.to_string(), message.clone()));
            let delivery = Delivery {
                delivery_tag: tag,
                redelivered: message.redelivered,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                payload: message.payload.clone(),
                properties: message.properties.clone(),
            };
            if sender.send(delivery).is_ok() {
                return;
            }
            self.unacked.lock().remove(&tag);
            *consumer = None;
        }
        queue.messages.lock().push_back(message);
    }

    fn consume(&self, queue_name: &str) -> Result<Subscription, DriverError> {
        let Some(queue) = self.queue(queue_name) else {
            return Err(DriverError::new(format!("no queue '{queue_name}'")));
        };
        let (sender, receiver) = mpsc::unbounded_channel();
        *queue.consumer.lock() = Some(sender);

        let consumer_tag = format!("mock-ctag-{}", self.next_consumer_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.consumers.lock().insert(consumer_tag.clone(), queue_name.to_string());

        let backlog: Vec<StoredMessage> = queue.messages.lock().drain(..).collect();
        for message in backlog {
            self.deliver(queue_name, message);
        }

        Ok(Subscription { consumer_tag, deliveries: receiver })
    }

    fn cancel(&self, consumer_tag: &str) {
        if let Some(queue_name) = self.consumers.lock().remove(consumer_tag)
            && let Some(queue) = self.queue(&queue_name)
        {
            *queue.consumer.lock() = None;
        }
    }

    fn ack(&self, delivery_tag: u64) {
        self.unacked.lock().remove(&delivery_tag);
    }

    fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), DriverError> {
        let Some((queue_name, mut message)) = self.unacked.lock().remove(&delivery_tag) else {
            return Ok(());
        };
        if requeue {
            message.redelivered = true;
            self.deliver(&queue_name, message);
            return Ok(());
        }

        let dead_letter = self.queue(&queue_name).map(|queue| {
            (queue.dead_letter_exchange.clone(), queue.dead_letter_routing_key.clone())
        });
        if let Some((Some(exchange), routing_key)) = dead_letter {
            let routing_key = routing_key.unwrap_or_else(|| message.routing_key.clone());
            message.redelivered = false;
            message.routing_key = routing_key.clone();
            message.exchange = exchange.clone();
            self.publish(&exchange, &routing_key, message)?;
        }
        Ok(())
    }

    /// Messages currently parked in a queue (not in flight to a consumer).
    pub fn queue_messages(&self, name: &str) -> Vec<StoredMessage> {
        self.queue(name).map(|queue| queue.messages.lock().iter().cloned().collect()).unwrap_or_default()
    }

    /// How many times an exchange was declared, for idempotence assertions.
    pub fn exchange_declare_count(&self, name: &str) -> usize {
        self.exchange_declares.lock().iter().filter(|declared| declared.as_str() == name).count()
    }

    /// How many times a queue was declared.
    pub fn queue_declare_count(&self, name: &str) -> usize {
        self.queue_declares.lock().iter().filter(|declared| declared.as_str() == name).count()
    }

    /// Count of deliveries awaiting acknowledgement.
    pub fn unacked_count(&self) -> usize {
        self.unacked.lock().len()
    }
}

/// AMQP topic matching: `*` matches one word, `#` matches zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(&word), Some(&actual)) if word == actual => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}
