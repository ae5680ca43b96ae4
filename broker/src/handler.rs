//! Composable subscriber handler chain.
//!
//! Handlers receive the message plus a one-shot [`Next`] control handle.
//! Proceeding runs the downstream handlers; aborting or failing ends the
//! chain as a failure; dropping the handle without calling it ends the chain
//! early as a success.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::message::Message;

/// Result of running a handler chain against one delivery. Only `Proceed`
/// acknowledges; every other outcome rejects the delivery.
#[derive(Debug)]
pub enum ChainOutcome {
    /// The chain ran to an end (explicitly or implicitly) without a failure
    /// signal.
    Proceed,
    /// A handler aborted the chain.
    Abort,
    /// A handler aborted the chain with an error.
    Fail(anyhow::Error),
    /// A handler returned an error.
    Threw(anyhow::Error),
}

impl ChainOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ChainOutcome::Proceed)
    }
}

/// One link of a subscriber chain.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, message: Arc<Message>, next: Next) -> anyhow::Result<()>;
}

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(func: F) -> Arc<dyn Handler>
where
    F: Fn(Arc<Message>, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(func))
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Arc<Message>, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Arc<Message>, next: Next) -> anyhow::Result<()> {
        (self.0)(message, next).await
    }
}

enum Decision {
    Proceed(ChainOutcome),
    Abort,
    Fail(anyhow::Error),
}

/// Control handle passed to each handler. Consumed on use, so a handler can
/// signal at most once; the terminal handle is a no-op proceed.
pub struct Next {
    handlers: Arc<[Arc<dyn Handler>]>,
    index: usize,
    message: Arc<Message>,
    decision: Arc<Mutex<Option<Decision>>>,
}

impl Next {
    /// Run the downstream handlers and wait for them to settle. Code after
    /// the await is post-processing that runs once the rest of the chain
    /// has finished.
    pub async fn proceed(self) {
        let outcome = run_from(self.handlers, self.index, self.message).await;
        *self.decision.lock() = Some(Decision::Proceed(outcome));
    }

    /// End the chain as a failure; downstream handlers never run.
    pub fn abort(self) {
        *self.decision.lock() = Some(Decision::Abort);
    }

    /// End the chain as a failure carrying an error.
    pub fn fail(self, error: anyhow::Error) {
        *self.decision.lock() = Some(Decision::Fail(error));
    }

    /// Signal form: `proceed` for `true`, `abort` for `false`.
    pub async fn signal(self, proceed: bool) {
        if proceed { self.proceed().await } else { self.abort() }
    }
}

/// Compose-and-run: execute the chain against one message.
pub(crate) async fn run(handlers: Arc<[Arc<dyn Handler>]>, message: Arc<Message>) -> ChainOutcome {
    run_from(handlers, 0, message).await
}

fn run_from(
    handlers: Arc<[Arc<dyn Handler>]>,
    index: usize,
    message: Arc<Message>,
) -> BoxFuture<'static, ChainOutcome> {
    Box::pin(async move {
        let Some(current) = handlers.get(index).cloned() else {
            // Terminal next: a no-op proceed.
            return ChainOutcome::Proceed;
        };

        let decision = Arc::new(Mutex::new(None));
        let next = Next {
            handlers: handlers.clone(),
            index: index + 1,
            message: message.clone(),
            decision: decision.clone(),
        };

        match current.handle(message, next).await {
            Err(error) => ChainOutcome::Threw(error),
            Ok(()) => match decision.lock().take() {
                // Returned without signalling: implicit end of the chain.
                None => ChainOutcome::Proceed,
                Some(Decision::Abort) => ChainOutcome::Abort,
                Some(Decision::Fail(error)) => ChainOutcome::Fail(error),
                Some(Decision::Proceed(outcome)) => outcome,
            },
        }
    })
}
