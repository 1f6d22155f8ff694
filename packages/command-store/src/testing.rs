//! Testing utilities for rules and coordinators.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! command-store = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ## Testing one rule without a coordinator
//!
//! ```ignore
//! use command_store::testing::RuleTest;
//!
//! RuleTest::new(SelectProfile)
//!     .with_state(Settings::default(), ModelCatalog::default(), Environment::default())
//!     .given(SessionCommand::SelectProfile { name: "work".into() })
//!     .expect_matched()
//!     .assert_state(|s| s.durable().profile == "work");
//! ```
//!
//! ## Recording what subscribers see
//!
//! ```ignore
//! use command_store::testing::{MetaRecorder, SnapshotRecorder};
//!
//! let snapshots = SnapshotRecorder::attach(&coordinator);
//! let meta = MetaRecorder::attach(&coordinator);
//!
//! coordinator.dispatch(SessionCommand::RefreshCatalog).await?;
//! coordinator.wait_until_settled().await;
//!
//! assert_eq!(meta.values(), vec![true, false]);
//! assert_eq!(snapshots.len(), 1);
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::command::Command;
use crate::coordinator::Coordinator;
use crate::error::{CoordinatorError, RuleFailure};
use crate::result::Mutations;
use crate::rule::{BusinessRule, RuleRunner};
use crate::state::{Snapshot, StateModel};
use crate::subscription::Subscription;

/// Build a snapshot directly, for feeding rules in tests.
pub fn snapshot<M: StateModel>(
    durable: M::Durable,
    catalog: M::Catalog,
    runtime: M::Runtime,
) -> Snapshot<M> {
    Snapshot::compose(Arc::new(durable), Arc::new(catalog), Arc::new(runtime))
}

/// Apply mutations to a snapshot without a store.
///
/// Mirrors [`crate::Store::apply_mutations`]: durable, catalog, runtime, in
/// that order.
pub fn apply<M: StateModel>(state: &Snapshot<M>, mutations: Mutations<M>) -> Snapshot<M> {
    let Mutations {
        durable,
        catalog,
        runtime,
    } = mutations;

    let mut next = state.clone();
    if let Some(f) = durable {
        next = Snapshot::compose(
            Arc::new(f(next.durable())),
            next.catalog_arc().clone(),
            next.runtime_arc().clone(),
        );
    }
    if let Some(f) = catalog {
        next = Snapshot::compose(
            next.durable_arc().clone(),
            Arc::new(f(next.catalog())),
            next.runtime_arc().clone(),
        );
    }
    if let Some(f) = runtime {
        next = Snapshot::compose(
            next.durable_arc().clone(),
            next.catalog_arc().clone(),
            Arc::new(f(next.runtime())),
        );
    }
    next
}

// =============================================================================
// Rule Test
// =============================================================================

/// Outcome of the last command given to a [`RuleTest`].
#[derive(Debug)]
pub enum RuleOutcome<C> {
    /// Trigger or condition did not match.
    Skipped,
    /// The rule applied.
    Applied { operations: usize, follow_ups: Vec<C> },
    /// The rule panicked or rejected the command.
    Failed(RuleFailure),
}

/// Fluent harness for a single rule.
///
/// Each `given`/`then` runs the rule against the current state and, if it
/// applied, folds its mutations into the state. Async operations are
/// counted, not run.
pub struct RuleTest<M: StateModel> {
    runner: RuleRunner<M>,
    state: Option<Snapshot<M>>,
    last: Option<RuleOutcome<M::Command>>,
}

impl<M: StateModel> RuleTest<M> {
    pub fn new(rule: impl BusinessRule<M>) -> Self {
        Self {
            runner: RuleRunner::new(rule),
            state: None,
            last: None,
        }
    }

    /// Set the starting state.
    pub fn with_state(
        mut self,
        durable: M::Durable,
        catalog: M::Catalog,
        runtime: M::Runtime,
    ) -> Self {
        self.state = Some(snapshot(durable, catalog, runtime));
        self
    }

    /// Run the rule for a command.
    ///
    /// # Panics
    ///
    /// Panics if no state was set with [`RuleTest::with_state`].
    pub fn given(mut self, command: M::Command) -> Self {
        let state = self
            .state
            .take()
            .expect("RuleTest needs with_state() before given()");

        let outcome = if !self.runner.handles(&command.command_type()) {
            self.state = Some(state);
            RuleOutcome::Skipped
        } else {
            match self.runner.check(&state, &command) {
                Ok(false) => {
                    self.state = Some(state);
                    RuleOutcome::Skipped
                }
                Err(failure) => {
                    self.state = Some(state);
                    RuleOutcome::Failed(failure)
                }
                Ok(true) => match self.runner.run(&state, &command) {
                    Ok(result) => {
                        let (mutations, operations, follow_ups) = result.into_parts();
                        self.state = Some(apply(&state, mutations));
                        RuleOutcome::Applied {
                            operations: operations.len(),
                            follow_ups,
                        }
                    }
                    Err(failure) => {
                        self.state = Some(state);
                        RuleOutcome::Failed(failure)
                    }
                },
            }
        };

        self.last = Some(outcome);
        self
    }

    /// Alias for [`RuleTest::given`], reads better in chains.
    pub fn then(self, command: M::Command) -> Self {
        self.given(command)
    }

    /// Assert the rule applied.
    ///
    /// # Panics
    ///
    /// Panics if the last command was skipped or failed.
    pub fn expect_matched(self) -> Self {
        if !matches!(self.last, Some(RuleOutcome::Applied { .. })) {
            panic!("expected rule to apply, got {:?}", self.last);
        }
        self
    }

    /// Assert the trigger or condition did not match.
    pub fn expect_skipped(self) -> Self {
        if !matches!(self.last, Some(RuleOutcome::Skipped)) {
            panic!("expected rule to be skipped, got {:?}", self.last);
        }
        self
    }

    /// Assert the rule failed.
    pub fn expect_failed(self) -> Self {
        if !matches!(self.last, Some(RuleOutcome::Failed(_))) {
            panic!("expected rule to fail, got {:?}", self.last);
        }
        self
    }

    /// Assert the number of operations scheduled by the last command.
    pub fn expect_operations(self, expected: usize) -> Self {
        match &self.last {
            Some(RuleOutcome::Applied { operations, .. }) => {
                assert_eq!(*operations, expected, "unexpected operation count");
            }
            other => panic!("expected {} operations, got {:?}", expected, other),
        }
        self
    }

    /// Assert the follow-ups requested by the last command.
    pub fn expect_follow_ups(self, predicate: impl FnOnce(&[M::Command]) -> bool) -> Self {
        match &self.last {
            Some(RuleOutcome::Applied { follow_ups, .. }) => {
                assert!(predicate(follow_ups), "follow-up predicate failed: {:?}", follow_ups);
            }
            other => panic!("expected follow-ups, got {:?}", other),
        }
        self
    }

    /// Assert a predicate on the current state.
    pub fn assert_state(self, predicate: impl FnOnce(&Snapshot<M>) -> bool) -> Self {
        assert!(predicate(self.state()), "state predicate failed");
        self
    }

    /// The current state.
    ///
    /// # Panics
    ///
    /// Panics if no state was set.
    pub fn state(&self) -> &Snapshot<M> {
        self.state.as_ref().expect("RuleTest has no state")
    }

    pub fn last_outcome(&self) -> Option<&RuleOutcome<M::Command>> {
        self.last.as_ref()
    }
}

// =============================================================================
// Recorders
// =============================================================================

/// Records every snapshot a coordinator emits.
pub struct SnapshotRecorder<M: StateModel> {
    seen: Arc<Mutex<Vec<Snapshot<M>>>>,
    subscription: Subscription,
}

impl<M: StateModel> SnapshotRecorder<M> {
    pub fn attach(coordinator: &Coordinator<M>) -> Self {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription =
            coordinator.subscribe(move |snapshot| lock(&sink).push(snapshot.clone()));
        Self { seen, subscription }
    }

    /// Number of emissions so far.
    pub fn len(&self) -> usize {
        lock(&self.seen).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshots(&self) -> Vec<Snapshot<M>> {
        lock(&self.seen).clone()
    }

    pub fn last(&self) -> Option<Snapshot<M>> {
        lock(&self.seen).last().cloned()
    }

    pub fn clear(&self) {
        lock(&self.seen).clear();
    }

    /// Stop recording. Returns whether the listener was still registered.
    pub fn detach(self) -> bool {
        self.subscription.unsubscribe()
    }
}

/// Records every meta ("work in flight") transition.
pub struct MetaRecorder {
    seen: Arc<Mutex<Vec<bool>>>,
    subscription: Subscription,
}

impl MetaRecorder {
    pub fn attach<M: StateModel>(coordinator: &Coordinator<M>) -> Self {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription = coordinator.subscribe_to_meta(move |loading| lock(&sink).push(*loading));
        Self { seen, subscription }
    }

    pub fn values(&self) -> Vec<bool> {
        lock(&self.seen).clone()
    }

    pub fn last(&self) -> Option<bool> {
        lock(&self.seen).last().copied()
    }

    pub fn clear(&self) {
        lock(&self.seen).clear();
    }

    pub fn detach(self) -> bool {
        self.subscription.unsubscribe()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// =============================================================================
// Polling
// =============================================================================

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_for(
    timeout: Duration,
    mut condition: impl FnMut() -> bool,
) -> Result<(), CoordinatorError> {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| CoordinatorError::Timeout { duration: timeout })
}

/// Run `future` with a timeout, panicking with `what` if it expires.
pub async fn within<T>(timeout: Duration, what: &str, future: impl Future<Output = T>) -> T {
    match tokio::time::timeout(timeout, future).await {
        Ok(value) => value,
        Err(_) => panic!("timed out after {:?} waiting for {}", timeout, what),
    }
}
