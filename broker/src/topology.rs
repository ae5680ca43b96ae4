//! Declarative topology assertion, run on every successful connect.
//!
//! Order per exchange: declare the exchange, then each implied binding's
//! queue, then the binding itself. Queue-only entries come last. The fan of
//! bindings within an exchange, and distinct exchanges, run in parallel.

use std::sync::Arc;

use futures::future::try_join_all;
use tracing::debug;

use crate::connection::Core;
use crate::error::BrokerError;

pub(crate) async fn apply(core: &Arc<Core>) -> Result<(), BrokerError> {
    let exchange_keys: Vec<String> = core.config.exchanges.keys().cloned().collect();
    let queue_keys: Vec<String> = core.config.queues.keys().cloned().collect();
    if exchange_keys.is_empty() && queue_keys.is_empty() {
        return Ok(());
    }

    try_join_all(exchange_keys.into_iter().map(|key| {
        let core = core.clone();
        async move {
            let exchange = core.exchange_entity(&key);
            exchange.assert().await?;

            let bindings = exchange.spec().bindings();
            try_join_all(bindings.into_iter().map(|(routing_key, queue_key)| {
                let core = core.clone();
                let exchange = exchange.clone();
                async move {
                    let queue = core.queue_entity(&queue_key);
                    queue.assert().await?;
                    exchange.bind(&queue.current_name(), &routing_key).await
                }
            }))
            .await?;
            Ok::<(), BrokerError>(())
        }
    }))
    .await?;

    try_join_all(queue_keys.into_iter().map(|key| {
        let core = core.clone();
        async move { core.queue_entity(&key).assert().await }
    }))
    .await?;

    debug!("topology asserted");
    Ok(())
}
