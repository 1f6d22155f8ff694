//! Commands: the only unit of input the coordinator accepts.
//!
//! A command is an immutable intent. It carries a hierarchical type tag
//! (`domain/ACTION`) that rules match on, and a payload whose shape is
//! fixed by that tag.
//!
//! # Payloads
//!
//! Each command family is an enum. One variant is one command type, and the
//! variant's fields are that type's payload, so "one command type, one
//! payload shape" is enforced by the compiler instead of a runtime cast.
//!
//! ```ignore
//! use command_store::{Command, CommandType};
//!
//! #[derive(Debug, Clone, PartialEq)]
//! enum CatalogCommand {
//!     Refresh,
//!     Loaded { models: Vec<String> },
//! }
//!
//! impl Command for CatalogCommand {
//!     fn command_type(&self) -> CommandType {
//!         match self {
//!             Self::Refresh => CommandType::new("catalog/REFRESH"),
//!             Self::Loaded { .. } => CommandType::new("catalog/LOADED"),
//!         }
//!     }
//! }
//! ```

use std::fmt;

use uuid::Uuid;

/// Literal used as a trigger to match every command type.
pub const WILDCARD: &str = "*";

/// Hierarchical command type tag, by convention `domain/ACTION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandType(&'static str);

impl CommandType {
    /// Create a command type from a static tag.
    pub const fn new(tag: &'static str) -> Self {
        Self(tag)
    }

    /// The full tag.
    pub fn as_str(&self) -> &'static str {
        self.0
    }

    /// The namespace part (`catalog` in `catalog/LOADED`).
    ///
    /// Tags without a separator are their own domain.
    pub fn domain(&self) -> &'static str {
        match self.0.split_once('/') {
            Some((domain, _)) => domain,
            None => self.0,
        }
    }

    /// The action part (`LOADED` in `catalog/LOADED`).
    ///
    /// Tags without a separator are their own action.
    pub fn action(&self) -> &'static str {
        match self.0.split_once('/') {
            Some((_, action)) => action,
            None => self.0,
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl From<&'static str> for CommandType {
    fn from(tag: &'static str) -> Self {
        Self(tag)
    }
}

/// What a rule listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// Only commands with exactly this type.
    Exact(CommandType),
    /// Every command.
    Any,
}

impl Trigger {
    /// Check whether a command type fires this trigger.
    pub fn matches(&self, command_type: &CommandType) -> bool {
        match self {
            Trigger::Exact(expected) => expected == command_type,
            Trigger::Any => true,
        }
    }

    /// Returns true for the wildcard trigger.
    pub fn is_any(&self) -> bool {
        matches!(self, Trigger::Any)
    }
}

impl From<&'static str> for Trigger {
    fn from(tag: &'static str) -> Self {
        if tag == WILDCARD {
            Trigger::Any
        } else {
            Trigger::Exact(CommandType(tag))
        }
    }
}

impl From<CommandType> for Trigger {
    fn from(command_type: CommandType) -> Self {
        if command_type.as_str() == WILDCARD {
            Trigger::Any
        } else {
            Trigger::Exact(command_type)
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Exact(command_type) => write!(f, "{}", command_type),
            Trigger::Any => f.write_str(WILDCARD),
        }
    }
}

/// An intent to change state.
///
/// Commands are values: they have no identity beyond their type and payload,
/// and two equal commands are interchangeable for matching.
///
/// # Catalog loads
///
/// The catalog partition mirrors an external system of record and only
/// changes through explicit "loaded" commands. By default a command counts as
/// one when its action ends in `LOADED` (`catalog/LOADED`,
/// `models/LIST_LOADED`). Override [`Command::loads_catalog`] when a family
/// uses a different naming scheme.
pub trait Command: Clone + fmt::Debug + Send + Sync + 'static {
    /// The type tag rules are matched against.
    fn command_type(&self) -> CommandType;

    /// Whether rules reacting to this command may write the catalog partition.
    fn loads_catalog(&self) -> bool {
        self.command_type().action().ends_with("LOADED")
    }
}

/// Correlation ID linking a top-level dispatch to everything it caused.
///
/// A fresh ID is minted for each call to `Coordinator::dispatch`. Follow-up
/// commands and the redispatch of every async operation scheduled along the
/// way reuse it, so one user intent can be followed through the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Sentinel for uncorrelated work (nil UUID).
    pub const NONE: Self = Self(Uuid::nil());

    /// Create a new random correlation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Check if this is the NONE sentinel value.
    pub fn is_none(&self) -> bool {
        self.0.is_nil()
    }

    /// Get a reference to the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
