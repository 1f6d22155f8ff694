//! The authoritative holder of all partitions.
//!
//! The store knows nothing about commands or rules. It offers three things:
//!
//! - a pure read ([`Store::get_state`]),
//! - serialized application of partition mutators ([`Store::apply_mutations`]),
//! - notification of observers, but only when told to ([`Store::emit`]).
//!
//! It never emits on its own initiative: the coordinator decides when the
//! system is settled enough to be observed.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::durable::{DurableRecord, DurableRepository, DurableState, Revision};
use crate::error::{panic_message, StoreError};
use crate::result::{Mutations, Mutator};
use crate::state::{Partition, Snapshot, StateModel};
use crate::subscription::{SubscriberList, Subscription};

/// Default capacity of the [`Store::snapshots`] broadcast channel.
pub const DEFAULT_SNAPSHOT_CAPACITY: usize = 64;

/// Which partitions an [`Store::apply_mutations`] call actually changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Applied {
    pub durable: bool,
    pub catalog: bool,
    pub runtime: bool,
}

impl Applied {
    /// True when at least one partition changed.
    pub fn any(&self) -> bool {
        self.durable || self.catalog || self.runtime
    }

    pub fn contains(&self, partition: Partition) -> bool {
        match partition {
            Partition::Durable => self.durable,
            Partition::Catalog => self.catalog,
            Partition::Runtime => self.runtime,
        }
    }
}

struct Partitions<M: StateModel> {
    durable: Arc<M::Durable>,
    catalog: Arc<M::Catalog>,
    runtime: Arc<M::Runtime>,
}

type EncodeFn<D> = fn(&D) -> Result<DurableRecord, StoreError>;
type DecodeFn<D> = fn(DurableRecord) -> Result<D, StoreError>;

/// Write-through link between the durable partition and a repository.
struct DurableWriter<D> {
    repository: Arc<dyn DurableRepository>,
    revision: AtomicU64,
    encode: EncodeFn<D>,
    decode: DecodeFn<D>,
}

impl<D> DurableWriter<D> {
    fn revision(&self) -> Revision {
        Revision(self.revision.load(Ordering::Acquire))
    }

    fn set_revision(&self, revision: Revision) {
        self.revision.store(revision.value(), Ordering::Release);
    }

    async fn persist(&self, state: &D) {
        let record = match (self.encode)(state) {
            Ok(record) => record,
            Err(e) => {
                error!(error = %e, "failed to encode durable partition, not saved");
                return;
            }
        };

        let expected = self.revision();
        match self.repository.save(record, expected).await {
            Ok(revision) => {
                self.set_revision(revision);
                debug!(%revision, "durable partition saved");
            }
            Err(e) if e.is_conflict() => {
                warn!(
                    %expected,
                    error = %e,
                    "durable partition save conflicted, in-memory state kept"
                );
            }
            Err(e) => {
                error!(
                    %expected,
                    error = %e,
                    "durable partition save failed, in-memory state kept"
                );
            }
        }
    }
}

/// Partitioned state plus its observers.
///
/// ```ignore
/// let store = Store::<Session>::new(
///     Settings::default(),
///     ModelCatalog::default(),
///     Environment::detect(),
/// )
///     .with_durable_repository(Arc::new(JsonFileRepository::new("session.json")));
/// store.restore().await?;
/// let store = Arc::new(store);
/// ```
pub struct Store<M: StateModel> {
    partitions: RwLock<Partitions<M>>,
    write_lock: Mutex<()>,
    subscribers: SubscriberList<Snapshot<M>>,
    channel: broadcast::Sender<Snapshot<M>>,
    durable: Option<DurableWriter<M::Durable>>,
}

impl<M: StateModel> Store<M> {
    /// Create a store holding the given initial partitions.
    pub fn new(durable: M::Durable, catalog: M::Catalog, runtime: M::Runtime) -> Self {
        let (channel, _) = broadcast::channel(DEFAULT_SNAPSHOT_CAPACITY);
        Self {
            partitions: RwLock::new(Partitions {
                durable: Arc::new(durable),
                catalog: Arc::new(catalog),
                runtime: Arc::new(runtime),
            }),
            write_lock: Mutex::new(()),
            subscribers: SubscriberList::new("snapshot"),
            channel,
            durable: None,
        }
    }

    /// Resize the broadcast channel behind [`Store::snapshots`].
    ///
    /// Receivers taken before this call are disconnected.
    pub fn with_snapshot_capacity(mut self, capacity: usize) -> Self {
        let (channel, _) = broadcast::channel(capacity.max(1));
        self.channel = channel;
        self
    }

    /// Write the durable partition through to `repository` whenever it changes.
    pub fn with_durable_repository(mut self, repository: Arc<dyn DurableRepository>) -> Self
    where
        M::Durable: DurableState,
    {
        self.durable = Some(DurableWriter {
            repository,
            revision: AtomicU64::new(Revision::NONE.value()),
            encode: DurableRecord::encode::<M::Durable>,
            decode: DurableRecord::decode::<M::Durable>,
        });
        self
    }

    /// Replace the durable partition with the last saved record.
    ///
    /// Returns `Ok(false)` when there is no repository or nothing was saved
    /// yet. Does not emit.
    pub async fn restore(&self) -> Result<bool, StoreError> {
        let Some(writer) = &self.durable else {
            return Ok(false);
        };

        let _write = self.write_lock.lock().await;
        let Some(record) = writer.repository.load().await? else {
            debug!("no durable record to restore");
            return Ok(false);
        };

        let revision = record.revision;
        let durable = (writer.decode)(record)?;
        self.write().durable = Arc::new(durable);
        writer.set_revision(revision);
        info!(%revision, "durable partition restored");
        Ok(true)
    }

    /// Revision of the last durable save (or restore).
    pub fn durable_revision(&self) -> Option<Revision> {
        self.durable.as_ref().map(|w| w.revision())
    }

    /// Compose a snapshot of the current partitions.
    pub fn get_state(&self) -> Snapshot<M> {
        let partitions = self.read();
        Snapshot::compose(
            partitions.durable.clone(),
            partitions.catalog.clone(),
            partitions.runtime.clone(),
        )
    }

    /// Apply mutators in durable, catalog, runtime order.
    ///
    /// Each mutator receives its partition as it is at that instant. Calls
    /// are serialized, so two calls apply in call order. A panicking mutator
    /// leaves its partition unchanged.
    pub async fn apply_mutations(&self, mutations: Mutations<M>) -> Applied {
        let _write = self.write_lock.lock().await;
        let Mutations {
            durable,
            catalog,
            runtime,
        } = mutations;

        let mut applied = Applied::default();

        if let Some(mutator) = durable {
            let current = self.read().durable.clone();
            if let Some(next) = run_mutator(Partition::Durable, mutator, &current) {
                self.write().durable = Arc::new(next);
                applied.durable = true;
            }
        }

        if let Some(mutator) = catalog {
            let current = self.read().catalog.clone();
            if let Some(next) = run_mutator(Partition::Catalog, mutator, &current) {
                self.write().catalog = Arc::new(next);
                applied.catalog = true;
            }
        }

        if let Some(mutator) = runtime {
            let current = self.read().runtime.clone();
            if let Some(next) = run_mutator(Partition::Runtime, mutator, &current) {
                self.write().runtime = Arc::new(next);
                applied.runtime = true;
            }
        }

        if applied.durable {
            if let Some(writer) = &self.durable {
                let current = self.read().durable.clone();
                writer.persist(&current).await;
            }
        }

        applied
    }

    /// Push the current snapshot to every listener.
    ///
    /// Listeners run synchronously, in subscription order; a panicking one is
    /// logged and skipped. Returns how many listeners completed.
    pub fn emit(&self) -> usize {
        let snapshot = self.get_state();
        let delivered = self.subscribers.notify(&snapshot);
        // No receivers is fine.
        let _ = self.channel.send(snapshot);
        debug!(listeners = delivered, "snapshot emitted");
        delivered
    }

    /// Register a snapshot listener.
    pub fn subscribe(
        &self,
        listener: impl Fn(&Snapshot<M>) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribers.subscribe(listener)
    }

    /// Receive emitted snapshots asynchronously.
    ///
    /// Slow receivers lag and lose the oldest snapshots; see
    /// [`broadcast::error::RecvError::Lagged`].
    pub fn snapshots(&self) -> broadcast::Receiver<Snapshot<M>> {
        self.channel.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Drop every listener.
    pub fn clear_subscribers(&self) {
        self.subscribers.clear();
    }

    fn read(&self) -> RwLockReadGuard<'_, Partitions<M>> {
        match self.partitions.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("partition lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Partitions<M>> {
        match self.partitions.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("partition lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl<M: StateModel> std::fmt::Debug for Store<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("subscribers", &self.subscribers.len())
            .field("durable_revision", &self.durable_revision())
            .finish_non_exhaustive()
    }
}

fn run_mutator<P>(partition: Partition, mutator: Mutator<P>, current: &P) -> Option<P> {
    match catch_unwind(AssertUnwindSafe(|| mutator(current))) {
        Ok(next) => Some(next),
        Err(panic_info) => {
            error!(
                %partition,
                panic = %panic_message(panic_info.as_ref()),
                "mutator panicked, partition left unchanged"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, CommandType};
    use crate::durable::InMemoryDurableRepository;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, PartialEq)]
    struct Noop;

    impl Command for Noop {
        fn command_type(&self) -> CommandType {
            CommandType::new("test/NOOP")
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Prefs {
        theme: String,
        opened: u32,
    }

    impl DurableState for Prefs {}

    struct Model;

    impl StateModel for Model {
        type Durable = Prefs;
        type Catalog = Vec<String>;
        type Runtime = u32;
        type Command = Noop;
    }

    fn store() -> Store<Model> {
        Store::new(Prefs::default(), vec![], 0)
    }

    #[tokio::test]
    async fn test_get_state_without_writes_shares_partitions() {
        let store = store();
        let a = store.get_state();
        let b = store.get_state();
        assert!(a.same_partitions(&b));
    }

    #[tokio::test]
    async fn test_mutations_apply_in_partition_order() {
        let store = store();
        let order = Arc::new(StdMutex::new(Vec::new()));

        let (d, c, r) = (order.clone(), order.clone(), order.clone());
        let mutations = Mutations::<Model>::none()
            .runtime(move |n| {
                r.lock().unwrap().push("runtime");
                n + 1
            })
            .catalog(move |items| {
                c.lock().unwrap().push("catalog");
                let mut items = items.clone();
                items.push("gpt".into());
                items
            })
            .durable(move |p| {
                d.lock().unwrap().push("durable");
                Prefs {
                    theme: "dark".into(),
                    ..p.clone()
                }
            });

        let applied = store.apply_mutations(mutations).await;
        assert_eq!(
            applied,
            Applied {
                durable: true,
                catalog: true,
                runtime: true
            }
        );
        assert_eq!(*order.lock().unwrap(), vec!["durable", "catalog", "runtime"]);

        let state = store.get_state();
        assert_eq!(state.durable().theme, "dark");
        assert_eq!(state.catalog(), &vec!["gpt".to_string()]);
        assert_eq!(*state.runtime(), 1);
    }

    #[tokio::test]
    async fn test_untouched_partitions_keep_identity() {
        let store = store();
        let before = store.get_state();

        store
            .apply_mutations(Mutations::<Model>::none().runtime(|n| n + 1))
            .await;
        let after = store.get_state();

        assert!(Arc::ptr_eq(before.durable_arc(), after.durable_arc()));
        assert!(!before.same_partitions(&after));
    }

    #[tokio::test]
    async fn test_panicking_mutator_leaves_partition_unchanged() {
        let store = store();
        let applied = store
            .apply_mutations(
                Mutations::<Model>::none()
                    .catalog(|_| panic!("bad catalog"))
                    .runtime(|n| n + 5),
            )
            .await;

        assert!(!applied.catalog);
        assert!(applied.runtime);
        assert!(store.get_state().catalog().is_empty());
        assert_eq!(*store.get_state().runtime(), 5);
    }

    #[tokio::test]
    async fn test_apply_does_not_emit() {
        let store = store();
        let count = Arc::new(StdMutex::new(0));
        let sink = count.clone();
        let _sub = store.subscribe(move |_| *sink.lock().unwrap() += 1);

        store.apply_mutations(Mutations::<Model>::none().runtime(|n| n + 1)).await;
        assert_eq!(*count.lock().unwrap(), 0);

        assert_eq!(store.emit(), 1);
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_emit_reaches_broadcast_receivers() {
        let store = store().with_snapshot_capacity(4);
        let mut rx = store.snapshots();

        store.apply_mutations(Mutations::<Model>::none().runtime(|_| 9)).await;
        store.emit();

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(*snapshot.runtime(), 9);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_clear() {
        let store = store();
        let sub = store.subscribe(|_| {});
        let _other = store.subscribe(|_| {});
        assert_eq!(store.subscriber_count(), 2);

        assert!(sub.unsubscribe());
        assert_eq!(store.emit(), 1);

        store.clear_subscribers();
        assert_eq!(store.emit(), 0);
    }

    #[tokio::test]
    async fn test_durable_write_through_and_restore() {
        let repo = Arc::new(InMemoryDurableRepository::new());
        let store = store().with_durable_repository(repo.clone());
        assert_eq!(store.durable_revision(), Some(Revision::NONE));

        store
            .apply_mutations(Mutations::<Model>::none().durable(|p| Prefs {
                opened: p.opened + 1,
                ..p.clone()
            }))
            .await;
        assert_eq!(store.durable_revision(), Some(Revision(1)));

        // Runtime-only changes do not touch the repository.
        store.apply_mutations(Mutations::<Model>::none().runtime(|n| n + 1)).await;
        assert_eq!(repo.record().unwrap().revision, Revision(1));

        let reopened = Store::<Model>::new(Prefs::default(), vec![], 0)
            .with_durable_repository(repo.clone());
        assert!(reopened.restore().await.unwrap());
        assert_eq!(reopened.get_state().durable().opened, 1);
        assert_eq!(reopened.durable_revision(), Some(Revision(1)));

        // And it keeps saving from the restored revision.
        reopened
            .apply_mutations(Mutations::<Model>::none().durable(|p| Prefs {
                theme: "light".into(),
                ..p.clone()
            }))
            .await;
        assert_eq!(repo.record().unwrap().revision, Revision(2));
    }

    #[tokio::test]
    async fn test_save_conflict_keeps_in_memory_state() {
        let repo = Arc::new(InMemoryDurableRepository::new());
        repo.save(DurableRecord::encode(&Prefs::default()).unwrap(), Revision::NONE)
            .await
            .unwrap();

        // Store never restored, so it believes nothing was saved.
        let store = store().with_durable_repository(repo.clone());
        store
            .apply_mutations(Mutations::<Model>::none().durable(|p| Prefs {
                opened: 42,
                ..p.clone()
            }))
            .await;

        assert_eq!(store.get_state().durable().opened, 42);
        assert_eq!(store.durable_revision(), Some(Revision::NONE));
        assert_eq!(repo.record().unwrap().decode::<Prefs>().unwrap().opened, 0);
    }

    #[tokio::test]
    async fn test_restore_without_repository_or_record() {
        assert!(!store().restore().await.unwrap());

        let empty = store().with_durable_repository(Arc::new(InMemoryDurableRepository::new()));
        assert!(!empty.restore().await.unwrap());
    }
}
