//! Cluster-aware connection management: round-robin dialing with a bounded
//! retry budget, automatic reconnection and channel resurrection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::channel::ChannelEntity;
use crate::config::{BrokerConfig, ConnectionPolicy};
use crate::driver::{Driver, DriverConnection};
use crate::error::{BrokerError, DriverError};
use crate::exchange::ExchangeEntity;
use crate::queue::QueueEntity;
use crate::topology;

/// Shared state behind a broker instance. Entities hold weak references back
/// to it; dropping the broker tears everything down.
pub(crate) struct Core {
    pub(crate) policy: ConnectionPolicy,
    pub(crate) config: BrokerConfig,
    driver: Arc<dyn Driver>,
    weak: Weak<Core>,

    /// Serializes connect attempts so reconnection cannot race a user call.
    connect_lock: tokio::sync::Mutex<()>,
    connection: RwLock<Option<Arc<dyn DriverConnection>>>,
    /// Index of the next endpoint to dial. Advances on failure only and is
    /// never reset, which drives failover across the cluster.
    cursor: AtomicUsize,
    /// Set by user-initiated close; suppresses reconnection.
    closing: AtomicBool,
    /// Bumped per established connection; stale close listeners and
    /// per-connection assertion markers compare against it.
    epoch: AtomicU64,

    channels: Mutex<HashMap<String, Arc<ChannelEntity>>>,
    exchanges: Mutex<HashMap<String, Arc<ExchangeEntity>>>,
    queues: Mutex<HashMap<String, Arc<QueueEntity>>>,
}

impl Core {
    pub(crate) fn new(policy: ConnectionPolicy, config: BrokerConfig, driver: Arc<dyn Driver>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            policy,
            config,
            driver,
            weak: weak.clone(),
            connect_lock: tokio::sync::Mutex::new(()),
            connection: RwLock::new(None),
            cursor: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            channels: Mutex::new(HashMap::new()),
            exchanges: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn connected(&self) -> bool {
        self.connection.read().as_ref().is_some_and(|connection| connection.is_connected())
    }

    pub(crate) fn connection(&self) -> Result<Arc<dyn DriverConnection>, BrokerError> {
        self.connection
            .read()
            .clone()
            .filter(|connection| connection.is_connected())
            .ok_or(BrokerError::NotConnected)
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Connect following the round-robin retry policy. `retry` and
    /// `frequency` override the configured policy when given.
    pub(crate) async fn connect(
        self: Arc<Self>,
        retry: Option<u64>,
        frequency: Option<Duration>,
    ) -> Result<(), BrokerError> {
        let _guard = self.connect_lock.lock().await;
        if self.connected() {
            return Ok(());
        }
        self.closing.store(false, Ordering::SeqCst);

        let unlimited = retry.is_none() && self.policy.retry.is_none();
        let mut remaining = retry.or(self.policy.retry);
        let frequency = frequency.unwrap_or(self.policy.frequency);
        let nodes = &self.policy.nodes;
        let mut attempts: u64 = 0;

        loop {
            // One cluster attempt: a full pass over the node list.
            let mut last_error: Option<DriverError> = None;
            for _ in 0..nodes.len() {
                if self.closing.load(Ordering::SeqCst) {
                    return Err(BrokerError::NotConnected);
                }
                let index = self.cursor.load(Ordering::SeqCst);
                let endpoint = &nodes[index];
                attempts += 1;
                debug!("dialing {}", endpoint);
                match self.driver.dial(endpoint).await {
                    Ok(connection) => {
                        info!("✅ Connected to {}", endpoint);
                        Self::install(&self, connection).await?;
                        return Ok(());
                    }
                    Err(err) => {
                        warn!("⚠️ Failed to connect to {}: {}", endpoint, err);
                        self.cursor.store((index + 1) % nodes.len(), Ordering::SeqCst);
                        last_error = Some(err);
                    }
                }
            }

            let Some(last_error) = last_error else {
                return Err(BrokerError::NotConnected);
            };
            if !unlimited && remaining.unwrap_or(0) == 0 {
                return Err(BrokerError::ConnectExhausted { attempts, source: last_error });
            }
            if !frequency.is_zero() {
                sleep(frequency).await;
            }
            if let Some(remaining) = &mut remaining {
                *remaining -= 1;
            }
        }
    }

    /// Wire up an established connection: close listener, channel
    /// resurrection, then the declarative topology.
    async fn install(core: &Arc<Self>, connection: Arc<dyn DriverConnection>) -> Result<(), BrokerError> {
        let epoch = core.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *core.connection.write() = Some(connection.clone());

        let weak = core.weak.clone();
        let closed = connection.closed();
        tokio::spawn(async move {
            closed.await;
            if let Some(core) = weak.upgrade() {
                core.handle_connection_close(epoch).await;
            }
        });

        let channels: Vec<Arc<ChannelEntity>> = core.channels.lock().values().cloned().collect();
        futures::future::try_join_all(
            channels.iter().map(|channel| Box::pin(channel.connect()) as BoxFuture<'_, Result<(), BrokerError>>),
        )
        .await?;

        topology::apply(core).await?;
        Ok(())
    }

    /// Close listener: a user close stays down, anything else reconnects
    /// with the configured policy.
    async fn handle_connection_close(self: Arc<Self>, epoch: u64) {
        {
            // Taken so the check cannot race a concurrent connect.
            let _guard = self.connect_lock.lock().await;
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            if self.closing.load(Ordering::SeqCst) {
                return;
            }
            *self.connection.write() = None;
        }

        warn!("⚠️ Connection lost, reconnecting");
        if let Err(err) = self.clone().connect(None, None).await {
            error!("❌ Reconnection failed: {}", err);
        }
    }

    pub(crate) async fn close(&self) -> Result<(), BrokerError> {
        self.closing.store(true, Ordering::SeqCst);
        let connection = self.connection.write().take();
        if let Some(connection) = connection {
            connection.close().await?;
        }
        info!("🔌 Broker connection closed");
        Ok(())
    }

    pub(crate) fn channel_entity(&self, name: &str) -> Arc<ChannelEntity> {
        self.channels
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| ChannelEntity::new(name.to_string(), self.weak.clone()))
            .clone()
    }

    pub(crate) fn exchange_entity(&self, name: &str) -> Arc<ExchangeEntity> {
        self.exchanges
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| {
                let spec = self.config.exchanges.get(name).cloned().unwrap_or_default();
                let resolved = spec.name.clone().unwrap_or_else(|| name.to_string());
                ExchangeEntity::new(resolved, spec, self.weak.clone())
            })
            .clone()
    }

    pub(crate) fn queue_entity(&self, name: &str) -> Arc<QueueEntity> {
        self.queues
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| {
                let spec = self.config.queues.get(name).cloned().unwrap_or_default();
                let resolved = spec.name.clone().unwrap_or_else(|| name.to_string());
                QueueEntity::new(resolved, spec, self.weak.clone())
            })
            .clone()
    }
}
