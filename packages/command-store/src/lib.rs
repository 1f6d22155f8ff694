//! # Command Store
//!
//! A command-driven state coordination core: commands go in, validated
//! state transitions come out, async side effects are tracked, and
//! observers are told about the state only when nothing is in flight.
//!
//! ## Core Concepts
//!
//! - [`Command`] = Intent (what should change), tagged `domain/ACTION`
//! - [`BusinessRule`] = Decision (trigger + condition + pure transition)
//! - [`RuleResult`] = Outcome (partition mutators, async work, follow-ups)
//! - [`Snapshot`] = Truth (immutable view of all partitions at one instant)
//!
//! ## Architecture
//!
//! ```text
//! UI / file watcher / timer
//!     │
//!     ▼ dispatch(command)
//! Coordinator ─── dispatch lock ──────────────────────────┐
//!     │                                                   │
//!     ├─► Match:   RuleRegistry.matching() + condition()  │
//!     │                                                   │
//!     ├─► Apply:   rule.apply() ─► Store.apply_mutations  │
//!     │                                                   │
//!     ├─► Schedule: AsyncOperation ──► JoinSet ──┐        │
//!     │                 (pending += 1)           │        │
//!     ├─► Recurse: follow-ups, depth-first       │        │
//!     │                                          ▼        │
//!     └─► Settle:  pending == 0 ─► Store.emit()  execute()│
//!                                                 │       │
//!                      redispatch, pending -= 1 ◄─┘───────┘
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One source of truth** - the [`Store`] holds the only mutable state
//! 2. **Rules are pure** - no IO, no state; IO is an [`AsyncOperation`]
//! 3. **Settled emission** - subscribers never see a snapshot while work is pending
//! 4. **Isolation** - a failing rule, operation or subscriber affects nothing else
//! 5. **Exactly-once decrement** - the pending counter can never get stuck
//!
//! ## Example
//!
//! ```ignore
//! use command_store::{Command, CommandType, Coordinator, CoordinatorConfig, Rule, RuleRegistry,
//!                     RuleResult, StateModel, Store};
//!
//! #[derive(Debug, Clone)]
//! enum CounterCommand {
//!     Inc,
//! }
//!
//! impl Command for CounterCommand {
//!     fn command_type(&self) -> CommandType {
//!         CommandType::new("counter/INC")
//!     }
//! }
//!
//! struct Counter;
//!
//! impl StateModel for Counter {
//!     type Durable = u64;
//!     type Catalog = ();
//!     type Runtime = ();
//!     type Command = CounterCommand;
//! }
//!
//! let registry = Arc::new(RuleRegistry::new());
//! registry.register(
//!     Rule::<Counter>::on("counter/INC")
//!         .apply(|_, _| Ok(RuleResult::<Counter>::none().durable(|n| n + 1))),
//! );
//!
//! let store = Store::new(0, (), ());
//! let coordinator = Coordinator::new(registry, store, CoordinatorConfig::default());
//! let _sub = coordinator.subscribe(|snapshot| println!("count = {}", snapshot.durable()));
//!
//! coordinator.dispatch(CounterCommand::Inc).await?;
//! ```

// Core modules
mod command;
mod config;
mod coordinator;
mod durable;
mod error;
mod operation;
mod pending;
mod registry;
mod result;
mod rule;
mod state;
mod store;
mod subscription;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export command types
pub use crate::command::{Command, CommandType, CorrelationId, Trigger, WILDCARD};

// Re-export state types
pub use crate::state::{Partition, Snapshot, StateModel};

// Re-export rule types
pub use crate::registry::{MatchedRules, RuleRegistry, RuleSet};
pub use crate::result::{Mutations, Mutator, RuleResult};
pub use crate::rule::{BusinessRule, Rule, RuleBuilder, RuleRunner};

// Re-export store types
pub use crate::store::{Applied, Store, DEFAULT_SNAPSHOT_CAPACITY};
pub use crate::subscription::Subscription;

// Re-export durable persistence types
pub use crate::durable::{
    DurableRecord, DurableRepository, DurableState, InMemoryDurableRepository, JsonFileRepository,
    Revision,
};

// Re-export coordinator types (primary entry point)
pub use crate::config::CoordinatorConfig;
pub use crate::coordinator::{Coordinator, DispatchReport};
pub use crate::operation::{operation, AsyncOperation, FnOperation, OperationContext};

// Re-export error types
pub use crate::error::{CoordinatorError, RuleFailure, RulePhase, StoreError};

// Re-export async-trait for operation and repository implementors
pub use async_trait::async_trait;
