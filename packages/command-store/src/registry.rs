//! Ordered, append-only collection of business rules.
//!
//! Registration order is evaluation order. The registry does not
//! de-duplicate: registering the same rule twice makes it run twice.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::command::CommandType;
use crate::rule::{BusinessRule, RuleRunner};
use crate::state::StateModel;

/// Rules matched for one command. Most commands match a handful.
pub type MatchedRules<M> = SmallVec<[Arc<RuleRunner<M>>; 4]>;

/// A group of rules contributed by one feature module.
///
/// ```ignore
/// struct ProfileRules;
///
/// impl RuleSet<Session> for ProfileRules {
///     fn register(self, registry: &RuleRegistry<Session>) {
///         registry.register(SelectProfile);
///         registry.register(ForgetProfile);
///     }
/// }
///
/// registry.install(ProfileRules);
/// ```
pub trait RuleSet<M: StateModel> {
    fn register(self, registry: &RuleRegistry<M>);
}

/// The rule collection a coordinator consults.
///
/// An explicit object, shared by `Arc` with the coordinator.
pub struct RuleRegistry<M: StateModel> {
    rules: RwLock<Vec<Arc<RuleRunner<M>>>>,
}

impl<M: StateModel> RuleRegistry<M> {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
        }
    }

    /// Append a rule.
    pub fn register(&self, rule: impl BusinessRule<M>) {
        self.register_runner(RuleRunner::new(rule));
    }

    /// Append an already wrapped rule.
    pub fn register_runner(&self, runner: RuleRunner<M>) {
        debug!(rule = runner.name(), trigger = %runner.trigger(), "rule registered");
        self.write().push(Arc::new(runner));
    }

    /// Let a rule set register its rules.
    pub fn install(&self, set: impl RuleSet<M>) {
        set.register(self);
    }

    /// Copy of every registered rule, in registration order.
    pub fn get_all(&self) -> Vec<Arc<RuleRunner<M>>> {
        self.read().clone()
    }

    /// Rules whose trigger matches `command_type`, in registration order.
    pub fn matching(&self, command_type: &CommandType) -> MatchedRules<M> {
        self.read()
            .iter()
            .filter(|rule| rule.handles(command_type))
            .cloned()
            .collect()
    }

    /// Remove every rule.
    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<RuleRunner<M>>>> {
        match self.rules.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("rule registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<RuleRunner<M>>>> {
        match self.rules.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("rule registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl<M: StateModel> Default for RuleRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: StateModel> std::fmt::Debug for RuleRegistry<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&'static str> = self.read().iter().map(|r| r.name()).collect();
        f.debug_struct("RuleRegistry").field("rules", &names).finish()
    }
}
