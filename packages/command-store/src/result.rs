//! What a rule hands back: partition mutators, async work, follow-ups.

use std::fmt;

use crate::operation::AsyncOperation;
use crate::state::{Partition, StateModel};

/// A pure partition transition.
pub type Mutator<P> = Box<dyn FnOnce(&P) -> P + Send + 'static>;

fn compose<P: 'static>(
    first: Option<Mutator<P>>,
    next: impl FnOnce(&P) -> P + Send + 'static,
) -> Mutator<P> {
    match first {
        None => Box::new(next),
        Some(first) => Box::new(move |partition: &P| {
            let intermediate = first(partition);
            next(&intermediate)
        }),
    }
}

/// Per-partition mutators carried by a [`RuleResult`].
///
/// At most one mutator per partition. Adding a second one to the same
/// partition composes them in call order.
pub struct Mutations<M: StateModel> {
    pub(crate) durable: Option<Mutator<M::Durable>>,
    pub(crate) catalog: Option<Mutator<M::Catalog>>,
    pub(crate) runtime: Option<Mutator<M::Runtime>>,
}

impl<M: StateModel> Mutations<M> {
    /// No mutation at all.
    pub fn none() -> Self {
        Self {
            durable: None,
            catalog: None,
            runtime: None,
        }
    }

    /// Add a durable partition transition.
    pub fn durable(mut self, f: impl FnOnce(&M::Durable) -> M::Durable + Send + 'static) -> Self {
        self.durable = Some(compose(self.durable.take(), f));
        self
    }

    /// Add a catalog partition transition.
    pub fn catalog(mut self, f: impl FnOnce(&M::Catalog) -> M::Catalog + Send + 'static) -> Self {
        self.catalog = Some(compose(self.catalog.take(), f));
        self
    }

    /// Add a runtime partition transition.
    pub fn runtime(mut self, f: impl FnOnce(&M::Runtime) -> M::Runtime + Send + 'static) -> Self {
        self.runtime = Some(compose(self.runtime.take(), f));
        self
    }

    /// True when no partition would be touched.
    pub fn is_empty(&self) -> bool {
        self.durable.is_none() && self.catalog.is_none() && self.runtime.is_none()
    }

    /// Whether a mutator is present for the given partition.
    pub fn touches(&self, partition: Partition) -> bool {
        match partition {
            Partition::Durable => self.durable.is_some(),
            Partition::Catalog => self.catalog.is_some(),
            Partition::Runtime => self.runtime.is_some(),
        }
    }

    /// Remove the catalog mutator. Returns whether one was present.
    pub(crate) fn strip_catalog(&mut self) -> bool {
        self.catalog.take().is_some()
    }
}

impl<M: StateModel> Default for Mutations<M> {
    fn default() -> Self {
        Self::none()
    }
}

impl<M: StateModel> fmt::Debug for Mutations<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutations")
            .field("durable", &self.durable.is_some())
            .field("catalog", &self.catalog.is_some())
            .field("runtime", &self.runtime.is_some())
            .finish()
    }
}

/// Output of a rule's `apply`.
///
/// ```ignore
/// RuleResult::none()
///     .runtime(|env| Environment { refreshing: true, ..env.clone() })
///     .spawn(FetchCatalog { url })
///     .follow_up(SessionCommand::Touch)
/// ```
///
/// A result with nothing in it is valid and a no-op.
pub struct RuleResult<M: StateModel> {
    mutations: Mutations<M>,
    operations: Vec<Box<dyn AsyncOperation<M::Command>>>,
    follow_up: Vec<M::Command>,
}

impl<M: StateModel> RuleResult<M> {
    /// An empty result.
    pub fn none() -> Self {
        Self {
            mutations: Mutations::none(),
            operations: Vec::new(),
            follow_up: Vec::new(),
        }
    }

    /// Add a durable partition transition.
    pub fn durable(mut self, f: impl FnOnce(&M::Durable) -> M::Durable + Send + 'static) -> Self {
        self.mutations = self.mutations.durable(f);
        self
    }

    /// Add a catalog partition transition.
    ///
    /// Only honored for commands that load the catalog, see
    /// [`crate::Command::loads_catalog`].
    pub fn catalog(mut self, f: impl FnOnce(&M::Catalog) -> M::Catalog + Send + 'static) -> Self {
        self.mutations = self.mutations.catalog(f);
        self
    }

    /// Add a runtime partition transition.
    pub fn runtime(mut self, f: impl FnOnce(&M::Runtime) -> M::Runtime + Send + 'static) -> Self {
        self.mutations = self.mutations.runtime(f);
        self
    }

    /// Schedule deferred work that eventually yields one command.
    pub fn spawn(mut self, operation: impl AsyncOperation<M::Command>) -> Self {
        self.operations.push(Box::new(operation));
        self
    }

    /// Schedule an already boxed operation.
    pub fn spawn_boxed(mut self, operation: Box<dyn AsyncOperation<M::Command>>) -> Self {
        self.operations.push(operation);
        self
    }

    /// Dispatch a command synchronously once this result's mutations are applied.
    ///
    /// Follow-ups run in the order they were added.
    pub fn follow_up(mut self, command: M::Command) -> Self {
        self.follow_up.push(command);
        self
    }

    /// True when the result changes nothing and schedules nothing.
    pub fn is_noop(&self) -> bool {
        self.mutations.is_empty() && self.operations.is_empty() && self.follow_up.is_empty()
    }

    /// Number of operations scheduled.
    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    /// Follow-up commands, in dispatch order.
    pub fn follow_ups(&self) -> &[M::Command] {
        &self.follow_up
    }

    /// Split into mutations, operations and follow-ups.
    #[allow(clippy::type_complexity)]
    pub fn into_parts(
        self,
    ) -> (
        Mutations<M>,
        Vec<Box<dyn AsyncOperation<M::Command>>>,
        Vec<M::Command>,
    ) {
        (self.mutations, self.operations, self.follow_up)
    }
}

impl<M: StateModel> Default for RuleResult<M> {
    fn default() -> Self {
        Self::none()
    }
}

impl<M: StateModel> From<Mutations<M>> for RuleResult<M> {
    fn from(mutations: Mutations<M>) -> Self {
        Self {
            mutations,
            operations: Vec::new(),
            follow_up: Vec::new(),
        }
    }
}

impl<M: StateModel> fmt::Debug for RuleResult<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleResult")
            .field("mutations", &self.mutations)
            .field("operations", &self.operations.len())
            .field("follow_up", &self.follow_up)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, CommandType};
    use crate::operation::operation;

    #[derive(Debug, Clone, PartialEq)]
    enum Cmd {
        Ping,
        Pong,
    }

    impl Command for Cmd {
        fn command_type(&self) -> CommandType {
            match self {
                Cmd::Ping => CommandType::new("test/PING"),
                Cmd::Pong => CommandType::new("test/PONG"),
            }
        }
    }

    struct Model;

    impl StateModel for Model {
        type Durable = i64;
        type Catalog = Vec<&'static str>;
        type Runtime = String;
        type Command = Cmd;
    }

    #[test]
    fn test_none_is_noop() {
        let result = RuleResult::<Model>::none();
        assert!(result.is_noop());
        assert_eq!(result.operation_count(), 0);
    }

    #[test]
    fn test_same_partition_mutators_compose_in_order() {
        let (mutations, _, _) = RuleResult::<Model>::none()
            .durable(|n| n + 1)
            .durable(|n| n * 10)
            .into_parts();

        let mutator = mutations.durable.expect("durable mutator");
        assert_eq!(mutator(&2), 30);
    }

    #[test]
    fn test_touches_reports_each_partition() {
        let mutations = Mutations::<Model>::none().runtime(|s| format!("{s}!"));
        assert!(mutations.touches(Partition::Runtime));
        assert!(!mutations.touches(Partition::Durable));
        assert!(!mutations.touches(Partition::Catalog));
        assert!(!mutations.is_empty());
    }

    #[test]
    fn test_strip_catalog() {
        let mut mutations = Mutations::<Model>::none().catalog(|c| c.clone());
        assert!(mutations.strip_catalog());
        assert!(!mutations.strip_catalog());
        assert!(mutations.is_empty());
    }

    #[test]
    fn test_follow_ups_keep_order() {
        let result = RuleResult::<Model>::none()
            .follow_up(Cmd::Ping)
            .follow_up(Cmd::Pong);
        assert_eq!(result.follow_ups(), &[Cmd::Ping, Cmd::Pong]);
        assert!(!result.is_noop());
    }

    #[test]
    fn test_spawn_counts_operations() {
        let result = RuleResult::<Model>::none()
            .spawn(operation("pong", |_ctx| async { Ok(Cmd::Pong) }));
        assert_eq!(result.operation_count(), 1);
        assert!(!result.is_noop());
    }

    #[test]
    fn test_from_mutations() {
        let result: RuleResult<Model> =
            Mutations::<Model>::none().runtime(|_| "up".to_string()).into();
        let debug = format!("{:?}", result);
        assert!(debug.contains("runtime: true"));
    }
}
