//! Exchange facade: lazy idempotent assertion, binding and publishing.

use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tracing::debug;

use crate::channel::WRITE_CHANNEL;
use crate::codec::{self, Payload};
use crate::config::ExchangeSpec;
use crate::connection::Core;
use crate::driver::{DriverChannel, ExchangeDeclare};
use crate::error::BrokerError;
use crate::message::MessageProperties;

/// Handle to a named exchange.
///
/// Assertion is lazy and idempotent per connection: the first operation on a
/// given connection declares the exchange, later ones are no-ops, and a
/// reconnect re-declares.
#[derive(Clone)]
pub struct Exchange {
    entity: Arc<ExchangeEntity>,
}

impl Exchange {
    pub(crate) fn from_entity(entity: Arc<ExchangeEntity>) -> Self {
        Self { entity }
    }

    pub fn name(&self) -> &str {
        &self.entity.name
    }

    /// Declare the exchange with its spec. Safe to call repeatedly.
    pub async fn assert(&self) -> Result<(), BrokerError> {
        self.entity.assert().await
    }

    /// Bind the named queue to this exchange.
    pub async fn bind(&self, queue: &str, routing_key: &str) -> Result<(), BrokerError> {
        let channel = self.entity.write_channel().await?;
        channel.bind_queue(queue, &self.entity.name, routing_key).await?;
        debug!("bound queue '{}' to exchange '{}' with key '{}'", queue, self.entity.name, routing_key);
        Ok(())
    }

    /// Remove a binding previously made with [`Exchange::bind`].
    pub async fn unbind(&self, queue: &str, routing_key: &str) -> Result<(), BrokerError> {
        let channel = self.entity.write_channel().await?;
        channel.unbind_queue(queue, &self.entity.name, routing_key).await?;
        Ok(())
    }

    /// Encode and publish a payload to this exchange.
    pub async fn publish(&self, routing_key: &str, payload: impl Into<Payload>) -> Result<(), BrokerError> {
        self.publish_with(routing_key, payload, MessageProperties::default()).await
    }

    /// Publish with explicit message properties; missing defaults are still
    /// injected by the codec.
    pub async fn publish_with(
        &self,
        routing_key: &str,
        payload: impl Into<Payload>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        self.entity.assert().await?;
        let (bytes, properties) = codec::encode(payload.into(), properties)?;
        let channel = self.entity.write_channel().await?;
        channel.publish(&self.entity.name, routing_key, &bytes, &properties).await?;
        Ok(())
    }

    /// Delete the exchange on the server. A later assert re-declares it.
    pub async fn delete(&self) -> Result<(), BrokerError> {
        let channel = self.entity.write_channel().await?;
        channel.delete_exchange(&self.entity.name).await?;
        *self.entity.asserted.lock().await = 0;
        Ok(())
    }
}

pub(crate) struct ExchangeEntity {
    name: String,
    spec: ExchangeSpec,
    core: Weak<Core>,
    /// Connection epoch of the last successful declare; zero means never.
    asserted: Mutex<u64>,
}

impl ExchangeEntity {
    pub(crate) fn new(name: String, spec: ExchangeSpec, core: Weak<Core>) -> Arc<Self> {
        Arc::new(Self { name, spec, core, asserted: Mutex::new(0) })
    }

    pub(crate) fn spec(&self) -> &ExchangeSpec {
        &self.spec
    }

    async fn write_channel(&self) -> Result<Arc<dyn DriverChannel>, BrokerError> {
        let core = self.core.upgrade().ok_or(BrokerError::NotConnected)?;
        let channel = core.channel_entity(WRITE_CHANNEL);
        channel.connect().await?;
        channel.driver_channel()
    }

    pub(crate) async fn assert(&self) -> Result<(), BrokerError> {
        let core = self.core.upgrade().ok_or(BrokerError::NotConnected)?;
        let channel_entity = core.channel_entity(WRITE_CHANNEL);
        channel_entity.connect().await?;

        let mut asserted = self.asserted.lock().await;
        let epoch = core.epoch();
        if *asserted == epoch {
            return Ok(());
        }

        let channel = channel_entity.driver_channel()?;
        channel
            .declare_exchange(ExchangeDeclare {
                name: self.name.clone(),
                kind: self.spec.effective_kind(),
                durable: self.spec.durable,
                internal: self.spec.internal,
                auto_delete: self.spec.auto_delete,
                arguments: self.spec.declare_arguments(),
            })
            .await?;
        debug!("declared exchange '{}' ({})", self.name, self.spec.effective_kind().as_str());
        *asserted = epoch;
        Ok(())
    }

    pub(crate) async fn bind(&self, queue: &str, routing_key: &str) -> Result<(), BrokerError> {
        let channel = self.write_channel().await?;
        channel.bind_queue(queue, &self.name, routing_key).await?;
        Ok(())
    }
}
