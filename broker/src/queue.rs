//! Queue facade: lazy assertion, direct sends and the subscriber pipeline.

use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::channel::READ_CHANNEL;
use crate::codec::{self, Payload};
use crate::config::QueueSpec;
use crate::connection::Core;
use crate::driver::{Delivery, DriverChannel, QueueDeclare};
use crate::error::BrokerError;
use crate::handler::{self, ChainOutcome, Handler};
use crate::message::{Acker, Message, MessageProperties};

/// Handle to a named queue.
///
/// At most one consumer per queue handle is allowed at a time; the
/// subscriber delivers messages one by one (prefetch 1) and settles each
/// delivery exactly once based on the handler-chain outcome.
#[derive(Clone)]
pub struct Queue {
    entity: Arc<QueueEntity>,
}

impl Queue {
    pub(crate) fn from_entity(entity: Arc<QueueEntity>) -> Self {
        Self { entity }
    }

    /// The queue name; reflects the server-generated name once an empty-name
    /// queue has been declared.
    pub fn name(&self) -> String {
        self.entity.current_name()
    }

    /// Declare the queue with its spec and set prefetch 1 on the read
    /// channel. Safe to call repeatedly.
    pub async fn assert(&self) -> Result<(), BrokerError> {
        self.entity.assert().await
    }

    /// Encode and send a payload directly to this queue.
    pub async fn send(&self, payload: impl Into<Payload>) -> Result<(), BrokerError> {
        self.send_with(payload, MessageProperties::default()).await
    }

    /// Send with explicit message properties.
    pub async fn send_with(
        &self,
        payload: impl Into<Payload>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        self.entity.assert().await?;
        let (bytes, properties) = codec::encode(payload.into(), properties)?;
        let channel = self.entity.read_channel().await?;
        channel.publish("", &self.entity.current_name(), &bytes, &properties).await?;
        Ok(())
    }

    /// Start consuming with a chain of handlers. Fails if this queue handle
    /// already has a consumer.
    pub async fn subscribe(&self, handlers: Vec<Arc<dyn Handler>>) -> Result<(), BrokerError> {
        self.entity.subscribe(handlers).await
    }

    /// Cancel the active consumer, if any. A handler already running settles
    /// its in-flight delivery normally.
    pub async fn cancel(&self) -> Result<(), BrokerError> {
        self.entity.cancel().await
    }

    /// Drop all ready messages from the queue.
    pub async fn purge(&self) -> Result<(), BrokerError> {
        let channel = self.entity.read_channel().await?;
        channel.purge_queue(&self.entity.current_name()).await?;
        Ok(())
    }

    /// Delete the queue on the server. A later assert re-declares it.
    pub async fn delete(&self) -> Result<(), BrokerError> {
        let channel = self.entity.read_channel().await?;
        channel.delete_queue(&self.entity.current_name()).await?;
        *self.entity.asserted.lock().await = 0;
        Ok(())
    }

    /// Remove a binding of this queue from an exchange.
    pub async fn unbind(&self, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        let channel = self.entity.read_channel().await?;
        channel.unbind_queue(&self.entity.current_name(), exchange, routing_key).await?;
        Ok(())
    }
}

pub(crate) struct QueueEntity {
    name: RwLock<String>,
    spec: QueueSpec,
    core: Weak<Core>,
    /// Connection epoch of the last successful declare; zero means never.
    asserted: Mutex<u64>,
    consumer_tag: Mutex<Option<String>>,
}

impl QueueEntity {
    pub(crate) fn new(name: String, spec: QueueSpec, core: Weak<Core>) -> Arc<Self> {
        Arc::new(Self {
            name: RwLock::new(name),
            spec,
            core,
            asserted: Mutex::new(0),
            consumer_tag: Mutex::new(None),
        })
    }

    pub(crate) fn current_name(&self) -> String {
        self.name.read().clone()
    }

    async fn read_channel(&self) -> Result<Arc<dyn DriverChannel>, BrokerError> {
        let core = self.core.upgrade().ok_or(BrokerError::NotConnected)?;
        let channel = core.channel_entity(READ_CHANNEL);
        channel.connect().await?;
        channel.driver_channel()
    }

    pub(crate) async fn assert(&self) -> Result<(), BrokerError> {
        let core = self.core.upgrade().ok_or(BrokerError::NotConnected)?;
        let channel_entity = core.channel_entity(READ_CHANNEL);
        channel_entity.connect().await?;

        let mut asserted = self.asserted.lock().await;
        let epoch = core.epoch();
        if *asserted == epoch {
            return Ok(());
        }

        let channel = channel_entity.driver_channel()?;
        let declared = channel
            .declare_queue(QueueDeclare {
                name: self.current_name(),
                durable: self.spec.durable,
                exclusive: self.spec.exclusive,
                auto_delete: self.spec.auto_delete,
                arguments: self.spec.declare_arguments(),
            })
            .await?;
        if declared != self.current_name() {
            *self.name.write() = declared;
        }
        channel.prefetch(1).await?;
        debug!("declared queue '{}'", self.current_name());
        *asserted = epoch;
        Ok(())
    }

    async fn subscribe(&self, handlers: Vec<Arc<dyn Handler>>) -> Result<(), BrokerError> {
        let mut consumer_tag = self.consumer_tag.lock().await;
        if consumer_tag.is_some() {
            return Err(BrokerError::SubscriptionConflict);
        }

        self.assert().await?;
        let channel = self.read_channel().await?;
        let queue_name = self.current_name();
        let subscription = channel.consume(&queue_name).await?;
        *consumer_tag = Some(subscription.consumer_tag.clone());
        debug!("consuming '{}' with tag '{}'", queue_name, subscription.consumer_tag);

        // Deliveries from queues without a dead-letter exchange are requeued
        // on failure; queues with one dead-letter instead.
        let requeue_on_failure = self.spec.dead_letter_exchange.is_none()
            && !self.spec.arguments.contains_key("x-dead-letter-exchange");
        let chain: Arc<[Arc<dyn Handler>]> = handlers.into();

        let mut deliveries = subscription.deliveries;
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                run_delivery(&channel, &queue_name, &chain, delivery, requeue_on_failure).await;
            }
            debug!("consumer loop for '{}' ended", queue_name);
        });

        Ok(())
    }

    async fn cancel(&self) -> Result<(), BrokerError> {
        let mut consumer_tag = self.consumer_tag.lock().await;
        if let Some(tag) = consumer_tag.take() {
            let channel = self.read_channel().await?;
            channel.cancel(&tag).await?;
            debug!("cancelled consumer '{}'", tag);
        }
        Ok(())
    }
}

/// Process one delivery: decode, run the chain, settle exactly once.
async fn run_delivery(
    channel: &Arc<dyn DriverChannel>,
    queue_name: &str,
    chain: &Arc<[Arc<dyn Handler>]>,
    delivery: Delivery,
    requeue_on_failure: bool,
) {
    let acker = Acker::new(channel.clone(), delivery.delivery_tag, requeue_on_failure);

    let content = match codec::decode(&delivery.payload, &delivery.properties) {
        Ok(content) => content,
        Err(error) => {
            warn!("⚠️ Undecodable delivery on '{}': {}", queue_name, error);
            if let Err(error) = acker.nack().await {
                warn!("⚠️ Failed to reject delivery on '{}': {}", queue_name, error);
            }
            return;
        }
    };

    let message = Arc::new(Message::new(
        content,
        delivery.properties,
        delivery.exchange,
        delivery.routing_key,
        delivery.delivery_tag,
        delivery.redelivered,
        acker.clone(),
    ));

    let outcome = handler::run(chain.clone(), message).await;
    let settled = match &outcome {
        ChainOutcome::Proceed => acker.ack().await,
        ChainOutcome::Abort => acker.nack().await,
        ChainOutcome::Fail(error) | ChainOutcome::Threw(error) => {
            debug!("handler chain failed on '{}': {}", queue_name, error);
            acker.nack().await
        }
    };
    if let Err(error) = settled {
        warn!("⚠️ Failed to settle delivery on '{}': {}", queue_name, error);
    }
}
