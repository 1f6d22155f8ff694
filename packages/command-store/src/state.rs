//! Partitioned state and the snapshots composed from it.
//!
//! State is split into three independently mutable partitions:
//!
//! | Partition | Holds                                         | Written by                |
//! |-----------|-----------------------------------------------|---------------------------|
//! | Durable   | values that survive a restart                 | any rule                  |
//! | Catalog   | values fetched from an external system        | rules for "loaded" commands |
//! | Runtime   | values detected from the live environment     | any rule                  |
//!
//! A [`Snapshot`] is the union of the three at one instant. It is never
//! mutated: every observable state is a freshly composed snapshot, and
//! composing one only clones three `Arc`s.

use std::fmt;
use std::sync::Arc;

use crate::command::Command;

/// Binds the partition types and the command family of one application.
///
/// ```ignore
/// struct Session;
///
/// impl StateModel for Session {
///     type Durable = Settings;
///     type Catalog = ModelCatalog;
///     type Runtime = Environment;
///     type Command = SessionCommand;
/// }
/// ```
pub trait StateModel: Send + Sync + 'static {
    /// Values that must survive a process restart.
    type Durable: Send + Sync + 'static;
    /// Values mirrored from an external system of record.
    type Catalog: Send + Sync + 'static;
    /// Values detected from the live environment.
    type Runtime: Send + Sync + 'static;
    /// The command family rules react to.
    type Command: Command;
}

/// Names a partition, for logs and for [`crate::Applied`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    Durable,
    Catalog,
    Runtime,
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Partition::Durable => write!(f, "durable"),
            Partition::Catalog => write!(f, "catalog"),
            Partition::Runtime => write!(f, "runtime"),
        }
    }
}

/// Immutable view of all partitions at one instant.
pub struct Snapshot<M: StateModel> {
    durable: Arc<M::Durable>,
    catalog: Arc<M::Catalog>,
    runtime: Arc<M::Runtime>,
}

impl<M: StateModel> Snapshot<M> {
    pub(crate) fn compose(
        durable: Arc<M::Durable>,
        catalog: Arc<M::Catalog>,
        runtime: Arc<M::Runtime>,
    ) -> Self {
        Self {
            durable,
            catalog,
            runtime,
        }
    }

    /// The durable partition.
    pub fn durable(&self) -> &M::Durable {
        &self.durable
    }

    /// The catalog partition.
    pub fn catalog(&self) -> &M::Catalog {
        &self.catalog
    }

    /// The runtime partition.
    pub fn runtime(&self) -> &M::Runtime {
        &self.runtime
    }

    /// True when both snapshots were composed from the very same partition
    /// values, i.e. nothing was written between them.
    pub fn same_partitions(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.durable, &other.durable)
            && Arc::ptr_eq(&self.catalog, &other.catalog)
            && Arc::ptr_eq(&self.runtime, &other.runtime)
    }

    #[cfg(any(test, feature = "testing"))]
    pub(crate) fn durable_arc(&self) -> &Arc<M::Durable> {
        &self.durable
    }

    #[cfg(any(test, feature = "testing"))]
    pub(crate) fn catalog_arc(&self) -> &Arc<M::Catalog> {
        &self.catalog
    }

    #[cfg(any(test, feature = "testing"))]
    pub(crate) fn runtime_arc(&self) -> &Arc<M::Runtime> {
        &self.runtime
    }
}

impl<M: StateModel> Clone for Snapshot<M> {
    fn clone(&self) -> Self {
        Self {
            durable: self.durable.clone(),
            catalog: self.catalog.clone(),
            runtime: self.runtime.clone(),
        }
    }
}

impl<M> PartialEq for Snapshot<M>
where
    M: StateModel,
    M::Durable: PartialEq,
    M::Catalog: PartialEq,
    M::Runtime: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.durable == other.durable
            && self.catalog == other.catalog
            && self.runtime == other.runtime
    }
}

impl<M> fmt::Debug for Snapshot<M>
where
    M: StateModel,
    M::Durable: fmt::Debug,
    M::Catalog: fmt::Debug,
    M::Runtime: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("durable", &self.durable)
            .field("catalog", &self.catalog)
            .field("runtime", &self.runtime)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandType;

    #[derive(Debug, Clone, PartialEq)]
    struct Noop;

    impl Command for Noop {
        fn command_type(&self) -> CommandType {
            CommandType::new("test/NOOP")
        }
    }

    struct Model;

    impl StateModel for Model {
        type Durable = u32;
        type Catalog = Vec<String>;
        type Runtime = bool;
        type Command = Noop;
    }

    fn snapshot(durable: u32) -> Snapshot<Model> {
        Snapshot::compose(Arc::new(durable), Arc::new(vec![]), Arc::new(false))
    }

    #[test]
    fn test_clone_shares_partitions() {
        let a = snapshot(1);
        let b = a.clone();
        assert!(a.same_partitions(&b));
        assert_eq!(a, b);
    }

    #[test]
    fn test_equal_content_is_not_same_partitions() {
        let a = snapshot(1);
        let b = snapshot(1);
        assert_eq!(a, b);
        assert!(!a.same_partitions(&b));
    }

    #[test]
    fn test_accessors() {
        let s = snapshot(7);
        assert_eq!(*s.durable(), 7);
        assert!(s.catalog().is_empty());
        assert!(!*s.runtime());
    }

    #[test]
    fn test_partition_display() {
        assert_eq!(Partition::Durable.to_string(), "durable");
        assert_eq!(Partition::Catalog.to_string(), "catalog");
        assert_eq!(Partition::Runtime.to_string(), "runtime");
    }
}
