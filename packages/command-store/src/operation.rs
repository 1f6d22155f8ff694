//! Async operations: the only way a rule can ask for IO.
//!
//! Rules are pure. When a transition needs the outside world (fetch a
//! catalog, probe the environment, write a file) the rule returns an
//! [`AsyncOperation`]. The coordinator runs it on its own task set and
//! dispatches the command it yields.
//!
//! # Contract
//!
//! - `execute` eventually yields exactly one command, or fails.
//! - A failure is logged and nothing is dispatched. If recovery matters,
//!   encode the failure in the returned command instead
//!   (`catalog/LOAD_FAILED { reason }`).
//! - Cancellation is cooperative: long-running operations should watch
//!   [`OperationContext::cancelled`]. Operations that never look are
//!   dropped at their next await point when the coordinator is disposed.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::command::{Command, CorrelationId};

/// Context handed to every operation.
///
/// Cheap to clone; clones observe the same cancellation signal.
#[derive(Clone)]
pub struct OperationContext {
    cid: CorrelationId,
    cancel: watch::Receiver<bool>,
    // Only set for detached contexts, which own their (never fired) signal.
    _signal: Option<Arc<watch::Sender<bool>>>,
}

impl OperationContext {
    pub(crate) fn new(cid: CorrelationId, cancel: watch::Receiver<bool>) -> Self {
        Self {
            cid,
            cancel,
            _signal: None,
        }
    }

    /// A context that is never cancelled, for running operations by hand.
    pub fn detached() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            cid: CorrelationId::NONE,
            cancel: rx,
            _signal: Some(Arc::new(tx)),
        }
    }

    /// Correlation ID of the dispatch that scheduled this operation.
    pub fn correlation_id(&self) -> CorrelationId {
        self.cid
    }

    /// Whether the coordinator has been disposed.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the coordinator is disposed (or dropped).
    ///
    /// ```ignore
    /// tokio::select! {
    ///     _ = ctx.cancelled() => anyhow::bail!("cancelled"),
    ///     models = client.list_models() => Ok(CatalogCommand::Loaded(models?)),
    /// }
    /// ```
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        // A dropped sender means the coordinator is gone: treat as cancelled.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("cid", &self.cid)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Deferred work that eventually yields one command.
///
/// # Example
///
/// ```ignore
/// struct FetchModels {
///     endpoint: String,
/// }
///
/// #[async_trait]
/// impl AsyncOperation<SessionCommand> for FetchModels {
///     async fn execute(
///         self: Box<Self>,
///         _ctx: OperationContext,
///     ) -> anyhow::Result<SessionCommand> {
///         let models = fetch(&self.endpoint).await?;
///         Ok(SessionCommand::CatalogLoaded { models })
///     }
/// }
/// ```
#[async_trait]
pub trait AsyncOperation<C: Command>: Send + 'static {
    /// Run the operation and return the command to dispatch.
    async fn execute(self: Box<Self>, ctx: OperationContext) -> anyhow::Result<C>;

    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Operation built from a closure, see [`operation`].
pub struct FnOperation<F> {
    name: &'static str,
    run: F,
}

#[async_trait]
impl<C, F, Fut> AsyncOperation<C> for FnOperation<F>
where
    C: Command,
    F: FnOnce(OperationContext) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<C>> + Send + 'static,
{
    async fn execute(self: Box<Self>, ctx: OperationContext) -> anyhow::Result<C> {
        let run = self.run;
        run(ctx).await
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Build an operation from an async closure.
///
/// ```ignore
/// RuleResult::none().spawn(operation("catalog.fetch", |_ctx| async move {
///     let models = client.list_models().await?;
///     Ok(SessionCommand::CatalogLoaded { models })
/// }))
/// ```
pub fn operation<C, F, Fut>(name: &'static str, run: F) -> FnOperation<F>
where
    C: Command,
    F: FnOnce(OperationContext) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<C>> + Send + 'static,
{
    FnOperation { name, run }
}
