//! Named long-lived channels that survive underlying breakage.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::connection::Core;
use crate::driver::DriverChannel;
use crate::error::BrokerError;

/// Channel used for subscriptions and acknowledgements.
pub(crate) const READ_CHANNEL: &str = "__read__";
/// Channel used for publishes and topology declarations.
pub(crate) const WRITE_CHANNEL: &str = "__write__";

/// Handle to a named channel slot. The slot outlives the underlying driver
/// channel: a spontaneous close while the connection is alive reopens it,
/// and a reconnect resurrects it.
#[derive(Clone)]
pub struct Channel {
    pub(crate) entity: Arc<ChannelEntity>,
}

impl Channel {
    /// Open the underlying channel if it is not already open. Triggers a
    /// broker connect first when disconnected.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        self.entity.connect().await
    }

    /// Close the underlying channel. The slot stays registered and can be
    /// reopened later.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.entity.close().await
    }

    pub fn connected(&self) -> bool {
        self.entity.connected()
    }

    pub fn name(&self) -> &str {
        &self.entity.name
    }

    /// The live driver channel, for operations this crate does not wrap.
    pub fn underlying(&self) -> Result<Arc<dyn DriverChannel>, BrokerError> {
        self.entity.driver_channel()
    }
}

pub(crate) struct ChannelEntity {
    pub(crate) name: String,
    weak: Weak<ChannelEntity>,
    core: Weak<Core>,
    transition: Mutex<()>,
    current: RwLock<Option<Arc<dyn DriverChannel>>>,
    closing: AtomicBool,
    epoch: AtomicU64,
}

impl ChannelEntity {
    pub(crate) fn new(name: String, core: Weak<Core>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            name,
            weak: weak.clone(),
            core,
            transition: Mutex::new(()),
            current: RwLock::new(None),
            closing: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
        })
    }

    pub(crate) fn connected(&self) -> bool {
        self.current.read().as_ref().is_some_and(|channel| channel.is_open())
    }

    pub(crate) fn driver_channel(&self) -> Result<Arc<dyn DriverChannel>, BrokerError> {
        self.current.read().clone().filter(|channel| channel.is_open()).ok_or(BrokerError::ChannelNotOpen)
    }

    pub(crate) async fn connect(&self) -> Result<(), BrokerError> {
        let core = self.core.upgrade().ok_or(BrokerError::NotConnected)?;
        if !core.connected() {
            core.clone().connect(None, None).await?;
        }

        let _transition = self.transition.lock().await;
        if self.connected() {
            return Ok(());
        }
        self.closing.store(false, Ordering::SeqCst);

        let connection = core.connection()?;
        let channel = connection.open_channel().await?;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *self.current.write() = Some(channel.clone());
        debug!("channel '{}' opened", self.name);

        let entity = self.weak.clone();
        let closed = channel.closed();
        tokio::spawn(async move {
            closed.await;
            if let Some(entity) = entity.upgrade() {
                entity.handle_close(epoch).await;
            }
        });

        Ok(())
    }

    pub(crate) async fn close(&self) -> Result<(), BrokerError> {
        self.closing.store(true, Ordering::SeqCst);
        let channel = self.current.read().clone();
        if let Some(channel) = channel {
            channel.close().await?;
        }
        Ok(())
    }

    /// Close-listener policy: user close and connection loss leave the slot
    /// closed; a spontaneous close on a live connection reopens it.
    async fn handle_close(self: Arc<Self>, epoch: u64) {
        {
            // Taken so the check cannot race a concurrent reopen.
            let _transition = self.transition.lock().await;
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            *self.current.write() = None;
        }

        if self.closing.load(Ordering::SeqCst) {
            debug!("channel '{}' closed", self.name);
            return;
        }
        let Some(core) = self.core.upgrade() else {
            return;
        };
        if !core.connected() {
            debug!("channel '{}' lost with its connection; reopening on reconnect", self.name);
            return;
        }

        warn!("⚠️ Channel '{}' closed unexpectedly, reopening", self.name);
        if let Err(error) = self.connect().await {
            warn!("⚠️ Failed to reopen channel '{}': {}", self.name, error);
        }
    }
}
