//! The coordinator: turns commands into transitions and decides when the
//! world may look.
//!
//! # Dispatch
//!
//! Each command goes through five steps:
//!
//! 1. **Match**: snapshot the state once, select the rules whose trigger
//!    matches and whose condition holds, in registration order.
//! 2. **Apply**: run each matched rule against that snapshot and apply its
//!    mutations to the store immediately.
//! 3. **Schedule**: start every async operation the rules asked for. Each
//!    one bumps the pending counter until it is done.
//! 4. **Recurse**: dispatch follow-up commands depth-first, in order.
//! 5. **Settle**: once the whole cascade is done, emit a snapshot if
//!    something matched and nothing is pending.
//!
//! # Serialization
//!
//! One async dispatch lock covers every top-level dispatch and every async
//! completion (redispatch, decrement, settle check). Each handled command is
//! therefore atomic end-to-end. Operations themselves run concurrently
//! outside the lock.
//!
//! # Emission rules
//!
//! - Never while an operation is pending.
//! - Once after a top-level cascade that matched at least one rule, if
//!   nothing is pending.
//! - Once when the last pending operation finishes, whatever its outcome.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::command::{Command, CorrelationId};
use crate::config::CoordinatorConfig;
use crate::error::{panic_message, CoordinatorError, RuleFailure};
use crate::operation::{AsyncOperation, OperationContext};
use crate::pending::PendingTracker;
use crate::registry::{MatchedRules, RuleRegistry};
use crate::state::{Snapshot, StateModel};
use crate::store::Store;
use crate::subscription::Subscription;

/// What one dispatch did, including its synchronous cascade.
///
/// Async operations scheduled by the dispatch complete later and are not
/// reflected here beyond their count.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub cid: CorrelationId,
    /// Rules matched across the cascade.
    pub matched: usize,
    /// Rules whose mutations changed at least one partition.
    pub applied: usize,
    /// Rules that panicked or rejected the command.
    pub failed: Vec<RuleFailure>,
    /// Async operations scheduled.
    pub operations: usize,
    /// Follow-up commands dispatched.
    pub follow_ups: usize,
    /// Follow-up commands dropped for exceeding the depth limit.
    pub dropped: usize,
    /// Whether this dispatch ended with an emission.
    pub emitted: bool,
}

impl DispatchReport {
    fn new(cid: CorrelationId) -> Self {
        Self {
            cid,
            ..Self::default()
        }
    }

    /// True when no rule matched anywhere in the cascade.
    pub fn is_noop(&self) -> bool {
        self.matched == 0
    }
}

struct Inner<M: StateModel> {
    registry: Arc<RuleRegistry<M>>,
    store: Store<M>,
    config: CoordinatorConfig,
    pending: Arc<PendingTracker>,
    dispatch_lock: tokio::sync::Mutex<()>,
    tasks: Mutex<JoinSet<()>>,
    cancel: watch::Sender<bool>,
    disposed: AtomicBool,
}

impl<M: StateModel> Inner<M> {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("task set mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Match, apply, schedule and recurse for one command. Caller holds the
    /// dispatch lock.
    fn handle<'a>(
        self: &'a Arc<Self>,
        command: M::Command,
        cid: CorrelationId,
        depth: usize,
        report: &'a mut DispatchReport,
    ) -> BoxFuture<'a, ()> {
        async move {
            let command_type = command.command_type();
            let state = self.store.get_state();

            let mut matched = MatchedRules::<M>::new();
            for rule in self.registry.matching(&command_type) {
                match rule.check(&state, &command) {
                    Ok(true) => matched.push(rule),
                    Ok(false) => trace!(rule = rule.name(), "condition not met"),
                    Err(failure) => report.failed.push(failure),
                }
            }

            if matched.is_empty() {
                trace!(command = %command_type, depth, "no rule matched");
                return;
            }
            debug!(command = %command_type, depth, rules = matched.len(), "rules matched");
            report.matched += matched.len();

            let mut operations: Vec<Box<dyn AsyncOperation<M::Command>>> = Vec::new();
            let mut follow_ups: Vec<M::Command> = Vec::new();

            for rule in &matched {
                let result = match rule.run(&state, &command) {
                    Ok(result) => result,
                    Err(failure) => {
                        report.failed.push(failure);
                        continue;
                    }
                };

                let (mut mutations, ops, follow) = result.into_parts();
                if self.config.enforce_catalog_loads
                    && !command.loads_catalog()
                    && mutations.strip_catalog()
                {
                    warn!(
                        rule = rule.name(),
                        command = %command_type,
                        "catalog mutation dropped, command does not load the catalog"
                    );
                }

                if !mutations.is_empty() && self.store.apply_mutations(mutations).await.any() {
                    report.applied += 1;
                }
                operations.extend(ops);
                follow_ups.extend(follow);
            }

            for operation in operations {
                self.schedule(operation, cid);
                report.operations += 1;
            }

            for next in follow_ups {
                if depth >= self.config.max_follow_up_depth {
                    error!(
                        command = %next.command_type(),
                        depth,
                        max = self.config.max_follow_up_depth,
                        "follow-up depth limit exceeded, command dropped"
                    );
                    report.dropped += 1;
                    continue;
                }
                report.follow_ups += 1;
                self.handle(next, cid, depth + 1, &mut *report).await;
            }
        }
        .boxed()
    }

    /// Count the operation as pending and run it on the task set.
    fn schedule(
        self: &Arc<Self>,
        operation: Box<dyn AsyncOperation<M::Command>>,
        cid: CorrelationId,
    ) {
        let name = operation.name();
        let guard = self.pending.begin(name);
        let ctx = OperationContext::new(cid, self.cancel.subscribe());
        let weak: Weak<Self> = Arc::downgrade(self);

        let task = async move {
            let outcome = AssertUnwindSafe(operation.execute(ctx)).catch_unwind().await;

            let Some(inner) = weak.upgrade() else {
                debug!("coordinator dropped before operation completed");
                return;
            };
            let _turn = inner.dispatch_lock.lock().await;

            match outcome {
                Ok(Ok(command)) if !inner.is_disposed() => {
                    debug!(command = %command.command_type(), "operation completed, redispatching");
                    let mut report = DispatchReport::new(cid);
                    inner.handle(command, cid, 0, &mut report).await;
                }
                Ok(Ok(_)) => debug!("operation completed after dispose, result discarded"),
                Ok(Err(e)) => warn!(error = %e, "operation failed"),
                Err(panic_info) => error!(
                    panic = %panic_message(panic_info.as_ref()),
                    "operation panicked"
                ),
            }

            let remaining = guard.release();
            if remaining == 0 && !inner.is_disposed() {
                inner.store.emit();
            }
        }
        .instrument(info_span!("operation", %cid, operation = name));

        let mut tasks = self.tasks();
        reap(&mut tasks);
        tasks.spawn(task);
    }
}

/// Entry point for every state change.
///
/// Cheap to clone; clones share the same registry, store and task set.
///
/// ```ignore
/// let registry = Arc::new(RuleRegistry::new());
/// registry.install(ProfileRules);
/// registry.install(CatalogRules);
///
/// let store = Store::new(Settings::default(), ModelCatalog::default(), Environment::default());
/// let coordinator = Coordinator::new(registry, store, CoordinatorConfig::from_env()?);
///
/// let _sub = coordinator.subscribe(|snapshot| render(snapshot));
/// coordinator.dispatch(SessionCommand::RefreshCatalog).await?;
/// ```
pub struct Coordinator<M: StateModel> {
    inner: Arc<Inner<M>>,
}

impl<M: StateModel> Clone for Coordinator<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: StateModel> Coordinator<M> {
    /// Create a coordinator that owns `store` and consults `registry`.
    pub fn new(registry: Arc<RuleRegistry<M>>, store: Store<M>, config: CoordinatorConfig) -> Self {
        let store = if config.snapshot_capacity == crate::store::DEFAULT_SNAPSHOT_CAPACITY {
            store
        } else {
            store.with_snapshot_capacity(config.snapshot_capacity)
        };
        let (cancel, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                registry,
                store,
                config,
                pending: Arc::new(PendingTracker::new()),
                dispatch_lock: tokio::sync::Mutex::new(()),
                tasks: Mutex::new(JoinSet::new()),
                cancel,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Handle one command and its synchronous cascade.
    ///
    /// Returns once every follow-up has been handled. Async operations keep
    /// running afterwards.
    ///
    /// The settle check runs once, after the whole cascade (every Apply,
    /// Schedule and Recurse step) has finished, rather than after each
    /// step. Observers therefore get at most one snapshot per top-level
    /// dispatch, showing the end state of the cascade.
    pub async fn dispatch(&self, command: M::Command) -> Result<DispatchReport, CoordinatorError> {
        if self.inner.is_disposed() {
            return Err(CoordinatorError::Disposed);
        }

        let cid = CorrelationId::new();
        let span = info_span!("dispatch", %cid, command = %command.command_type());

        async {
            let _turn = self.inner.dispatch_lock.lock().await;
            // Disposed while waiting for our turn.
            if self.inner.is_disposed() {
                return Err(CoordinatorError::Disposed);
            }

            let mut report = DispatchReport::new(cid);
            self.inner.handle(command, cid, 0, &mut report).await;

            if !report.is_noop() && self.inner.pending.is_settled() {
                self.inner.store.emit();
                report.emitted = true;
            }

            debug!(
                matched = report.matched,
                failed = report.failed.len(),
                operations = report.operations,
                follow_ups = report.follow_ups,
                emitted = report.emitted,
                "dispatch finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Listen for emitted snapshots.
    pub fn subscribe(
        &self,
        listener: impl Fn(&Snapshot<M>) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.store.subscribe(listener)
    }

    /// Listen for "work in flight" transitions.
    ///
    /// Called with `true` on every increment and `count > 0` on every
    /// decrement of the pending counter.
    pub fn subscribe_to_meta(
        &self,
        listener: impl Fn(&bool) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.pending.subscribe(listener)
    }

    /// Current snapshot, settled or not.
    pub fn state(&self) -> Snapshot<M> {
        self.inner.store.get_state()
    }

    pub fn pending_operations(&self) -> usize {
        self.inner.pending.count()
    }

    pub fn is_loading(&self) -> bool {
        !self.inner.pending.is_settled()
    }

    /// Shared counter handle that does not keep the coordinator alive.
    #[cfg(any(test, feature = "testing"))]
    pub(crate) fn pending_tracker(&self) -> Arc<PendingTracker> {
        self.inner.pending.clone()
    }

    pub fn store(&self) -> &Store<M> {
        &self.inner.store
    }

    pub fn registry(&self) -> &Arc<RuleRegistry<M>> {
        &self.inner.registry
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Wait until no operation is pending and its completion has been handled.
    ///
    /// Operations scheduled while waiting (by redispatched commands) are
    /// waited for too. Returns early if the coordinator is disposed
    /// meanwhile. Dropping the returned future (for instance on timeout)
    /// leaves every operation running.
    pub async fn wait_until_settled(&self) {
        let mut cancel = self.inner.cancel.subscribe();

        loop {
            if self.inner.is_disposed() {
                return;
            }

            tokio::select! {
                _ = self.inner.pending.wait_zero() => {}
                _ = cancel.wait_for(|cancelled| *cancelled) => return,
            }

            // The last completion releases its slot and emits under the
            // dispatch lock; taking our turn waits for it to finish.
            drop(self.inner.dispatch_lock.lock().await);

            if self.inner.pending.is_settled() {
                reap(&mut self.inner.tasks());
                return;
            }
        }
    }

    /// [`Coordinator::wait_until_settled`] with a bound.
    pub async fn wait_until_settled_timeout(
        &self,
        duration: Duration,
    ) -> Result<(), CoordinatorError> {
        tokio::time::timeout(duration, self.wait_until_settled())
            .await
            .map_err(|_| CoordinatorError::Timeout { duration })
    }

    /// Cancel outstanding operations, drop every listener, refuse new commands.
    ///
    /// Operations observe [`OperationContext::cancelled`]; any still running
    /// are aborted at their next await point. The pending counter is
    /// decremented once per aborted operation. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.cancel.send_replace(true);
        let in_flight = {
            let mut tasks = self.inner.tasks();
            let len = tasks.len();
            tasks.abort_all();
            len
        };

        self.inner.store.clear_subscribers();
        self.inner.pending.clear_listeners();
        info!(in_flight, "coordinator disposed");
    }
}

impl<M: StateModel> std::fmt::Debug for Coordinator<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("rules", &self.inner.registry.len())
            .field("pending", &self.inner.pending.count())
            .field("disposed", &self.inner.is_disposed())
            .finish()
    }
}

/// Collect tasks that already finished without waiting for the rest.
fn reap(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.try_join_next() {
        if let Err(e) = joined {
            if e.is_panic() {
                error!(error = %e, "operation task panicked");
            }
        }
    }
}
