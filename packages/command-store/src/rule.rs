//! Business rules and the type-erased runner the coordinator drives.
//!
//! A rule is a pure decision: given the current snapshot and a command it
//! says which partitions change, which async work to start and which
//! commands to dispatch next. It performs no IO and holds no state.
//!
//! Rules are written either as a type implementing [`BusinessRule`] or with
//! the closure builder:
//!
//! ```ignore
//! registry.register(
//!     Rule::<Session>::on("profile/SELECT")
//!         .named("select-profile")
//!         .when(|state, _| !state.runtime().locked)
//!         .apply(|_, cmd| {
//!             let SessionCommand::SelectProfile { name } = cmd else {
//!                 return Ok(RuleResult::none());
//!             };
//!             let name = name.clone();
//!             Ok(RuleResult::<Session>::none()
//!                 .durable(move |s| Settings { profile: name, ..s.clone() }))
//!         }),
//! );
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{error, warn};

use crate::command::{Command, CommandType, Trigger};
use crate::error::{panic_message, RuleFailure, RulePhase};
use crate::result::RuleResult;
use crate::state::{Snapshot, StateModel};

/// A pure transition rule for one command type (or all of them).
///
/// # Guarantees
///
/// - `condition` and `apply` are only called for commands whose type matches
///   [`BusinessRule::trigger`]
/// - `apply` is only called when `condition` returned true for the same
///   snapshot
/// - Called synchronously, one command at a time
pub trait BusinessRule<M: StateModel>: Send + Sync + 'static {
    /// The command type this rule reacts to, or [`Trigger::Any`].
    fn trigger(&self) -> Trigger;

    /// Guard evaluated against the current snapshot. Defaults to true.
    fn condition(&self, _state: &Snapshot<M>, _command: &M::Command) -> bool {
        true
    }

    /// Compute the transition.
    ///
    /// An `Err` rejects the command for this rule only; other matched rules
    /// still apply.
    fn apply(&self, state: &Snapshot<M>, command: &M::Command) -> anyhow::Result<RuleResult<M>>;

    /// Name used in logs and failure reports.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

type ConditionFn<M> = Box<dyn Fn(&Snapshot<M>, &<M as StateModel>::Command) -> bool + Send + Sync>;
type ApplyFn<M> = Box<
    dyn Fn(&Snapshot<M>, &<M as StateModel>::Command) -> anyhow::Result<RuleResult<M>>
        + Send
        + Sync,
>;

/// A rule assembled from closures. Start with [`Rule::on`].
pub struct Rule<M: StateModel> {
    trigger: Trigger,
    name: &'static str,
    condition: Option<ConditionFn<M>>,
    apply: ApplyFn<M>,
}

impl<M: StateModel> Rule<M> {
    /// Begin a rule reacting to `trigger` (`"domain/ACTION"` or `"*"`).
    pub fn on(trigger: impl Into<Trigger>) -> RuleBuilder<M> {
        RuleBuilder {
            trigger: trigger.into(),
            name: "anonymous-rule",
            condition: None,
        }
    }
}

impl<M: StateModel> BusinessRule<M> for Rule<M> {
    fn trigger(&self) -> Trigger {
        self.trigger
    }

    fn condition(&self, state: &Snapshot<M>, command: &M::Command) -> bool {
        self.condition.as_ref().map_or(true, |f| f(state, command))
    }

    fn apply(&self, state: &Snapshot<M>, command: &M::Command) -> anyhow::Result<RuleResult<M>> {
        (self.apply)(state, command)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Builder returned by [`Rule::on`].
pub struct RuleBuilder<M: StateModel> {
    trigger: Trigger,
    name: &'static str,
    condition: Option<ConditionFn<M>>,
}

impl<M: StateModel> RuleBuilder<M> {
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Only apply when `condition` holds for the current snapshot.
    pub fn when(
        mut self,
        condition: impl Fn(&Snapshot<M>, &M::Command) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.condition = Some(Box::new(condition));
        self
    }

    /// Finish the rule with its transition.
    pub fn apply(
        self,
        apply: impl Fn(&Snapshot<M>, &M::Command) -> anyhow::Result<RuleResult<M>>
            + Send
            + Sync
            + 'static,
    ) -> Rule<M> {
        Rule {
            trigger: self.trigger,
            name: self.name,
            condition: self.condition,
            apply: Box::new(apply),
        }
    }
}

/// Type-erased wrapper the registry stores.
///
/// Isolates each rule: a panic in `condition` or `apply`, or an `Err` from
/// `apply`, becomes a [`RuleFailure`] and never reaches the caller.
pub struct RuleRunner<M: StateModel> {
    inner: Box<dyn BusinessRule<M>>,
    trigger: Trigger,
    name: &'static str,
}

impl<M: StateModel> RuleRunner<M> {
    /// Wrap a rule, taking its name from [`BusinessRule::name`].
    pub fn new(rule: impl BusinessRule<M>) -> Self {
        Self {
            trigger: rule.trigger(),
            name: rule.name(),
            inner: Box::new(rule),
        }
    }

    /// Wrap a rule under a custom name.
    ///
    /// Useful when the same rule type is registered more than once.
    pub fn with_name(rule: impl BusinessRule<M>, name: &'static str) -> Self {
        Self {
            trigger: rule.trigger(),
            name,
            inner: Box::new(rule),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    /// Whether this rule reacts to the given command type.
    pub fn handles(&self, command_type: &CommandType) -> bool {
        self.trigger.matches(command_type)
    }

    /// Evaluate the condition.
    pub fn check(&self, state: &Snapshot<M>, command: &M::Command) -> Result<bool, RuleFailure> {
        let checked = catch_unwind(AssertUnwindSafe(|| self.inner.condition(state, command)));
        checked.map_err(|panic_info| {
            let message = panic_message(panic_info.as_ref());
            error!(
                rule = self.name,
                command = %command.command_type(),
                panic = %message,
                "rule panicked in condition()"
            );
            RuleFailure::Panicked {
                rule: self.name,
                phase: RulePhase::Condition,
                message,
            }
        })
    }

    /// Compute the rule's result.
    pub fn run(
        &self,
        state: &Snapshot<M>,
        command: &M::Command,
    ) -> Result<RuleResult<M>, RuleFailure> {
        match catch_unwind(AssertUnwindSafe(|| self.inner.apply(state, command))) {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(source)) => {
                warn!(
                    rule = self.name,
                    command = %command.command_type(),
                    error = %source,
                    "rule rejected command"
                );
                Err(RuleFailure::Rejected {
                    rule: self.name,
                    source,
                })
            }
            Err(panic_info) => {
                let message = panic_message(panic_info.as_ref());
                error!(
                    rule = self.name,
                    command = %command.command_type(),
                    panic = %message,
                    "rule panicked in apply()"
                );
                Err(RuleFailure::Panicked {
                    rule: self.name,
                    phase: RulePhase::Apply,
                    message,
                })
            }
        }
    }
}

impl<M: StateModel> std::fmt::Debug for RuleRunner<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleRunner")
            .field("name", &self.name)
            .field("trigger", &self.trigger)
            .finish()
    }
}
