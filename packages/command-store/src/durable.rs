//! Write-through persistence for the durable partition.
//!
//! # The Contract
//!
//! 1. **Narrow representation.** The durable partition is stored as a
//!    [`DurableRecord`]: schema version, revision, timestamp and a JSON
//!    payload. Nothing else about the in-memory state leaks out.
//!
//! 2. **Versioned.** Records carry the [`DurableState::SCHEMA_VERSION`] they
//!    were written with. Loading an older record goes through
//!    [`DurableState::migrate`].
//!
//! 3. **Write after apply.** The store saves the partition after a mutation
//!    changed it. A failed save is logged; the in-memory partition is
//!    authoritative and is never rolled back.
//!
//! 4. **Optimistic concurrency.** Saves name the revision they expect to
//!    replace. A mismatch is [`StoreError::Conflict`], never a silent
//!    overwrite.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;

// =============================================================================
// Revision
// =============================================================================

/// Revision for optimistic concurrency control.
///
/// [`Revision::NONE`] means "never saved". Each successful save advances it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Revision(pub u64);

impl Revision {
    /// Sentinel value for state that has never been saved.
    pub const NONE: Revision = Revision(0);

    /// Get the next revision (for save operations).
    pub fn next(self) -> Self {
        Revision(self.0.saturating_add(1))
    }

    /// Check if this is the NONE sentinel.
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    /// Get the inner value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            write!(f, "r{}", self.0)
        }
    }
}

// =============================================================================
// Durable State
// =============================================================================

/// A durable partition type that can be written through a repository.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Settings {
///     profile: String,
///     #[serde(default)]
///     recent: Vec<String>,
/// }
///
/// impl DurableState for Settings {
///     const SCHEMA_VERSION: u32 = 2;
///
///     fn migrate(version: u32, data: serde_json::Value) -> Result<Self, StoreError> {
///         match version {
///             // v1 had no `recent` list; serde(default) fills it in.
///             1 => serde_json::from_value(data).map_err(StoreError::Decode),
///             found => Err(StoreError::UnsupportedVersion { found, expected: 2 }),
///         }
///     }
/// }
/// ```
pub trait DurableState: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Version written into every record.
    const SCHEMA_VERSION: u32 = 1;

    /// Decode a record written with an older (or unknown) schema version.
    ///
    /// The default rejects every version other than the current one.
    fn migrate(version: u32, _data: serde_json::Value) -> Result<Self, StoreError> {
        Err(StoreError::UnsupportedVersion {
            found: version,
            expected: Self::SCHEMA_VERSION,
        })
    }
}

/// The external representation of the durable partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableRecord {
    pub schema_version: u32,
    pub revision: Revision,
    pub saved_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl DurableRecord {
    /// Encode a durable partition value. The revision is stamped by the
    /// repository on save.
    pub fn encode<D: DurableState>(state: &D) -> Result<Self, StoreError> {
        Ok(Self {
            schema_version: D::SCHEMA_VERSION,
            revision: Revision::NONE,
            saved_at: Utc::now(),
            data: serde_json::to_value(state).map_err(StoreError::Encode)?,
        })
    }

    /// Decode into the current schema, migrating if needed.
    pub fn decode<D: DurableState>(self) -> Result<D, StoreError> {
        if self.schema_version == D::SCHEMA_VERSION {
            serde_json::from_value(self.data).map_err(StoreError::Decode)
        } else {
            debug!(
                from = self.schema_version,
                to = D::SCHEMA_VERSION,
                "migrating durable record"
            );
            D::migrate(self.schema_version, self.data)
        }
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Where durable records live.
///
/// Implementations must provide atomic load/save with revision checking.
#[async_trait]
pub trait DurableRepository: Send + Sync + 'static {
    /// Load the latest record, or `None` if nothing was ever saved.
    async fn load(&self) -> Result<Option<DurableRecord>, StoreError>;

    /// Save a record if the stored revision equals `expected`.
    ///
    /// The repository stamps `expected.next()` into the record and returns it.
    async fn save(&self, record: DurableRecord, expected: Revision) -> Result<Revision, StoreError>;
}

/// Repository that keeps the last record in memory.
#[derive(Debug, Default)]
pub struct InMemoryDurableRepository {
    record: Mutex<Option<DurableRecord>>,
}

impl InMemoryDurableRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing record, as if it had been saved earlier.
    pub fn with_record(record: DurableRecord) -> Self {
        Self {
            record: Mutex::new(Some(record)),
        }
    }

    /// The record currently stored.
    pub fn record(&self) -> Option<DurableRecord> {
        match self.record.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl DurableRepository for InMemoryDurableRepository {
    async fn load(&self) -> Result<Option<DurableRecord>, StoreError> {
        Ok(self.record())
    }

    async fn save(
        &self,
        mut record: DurableRecord,
        expected: Revision,
    ) -> Result<Revision, StoreError> {
        let mut stored = self
            .record
            .lock()
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("mutex poisoned: {}", e)))?;

        let actual = stored.as_ref().map(|r| r.revision).unwrap_or(Revision::NONE);
        if actual != expected {
            return Err(StoreError::Conflict { expected, actual });
        }

        let next = expected.next();
        record.revision = next;
        *stored = Some(record);
        Ok(next)
    }
}

/// Repository backed by one JSON file.
///
/// Writes go to a sibling temp file which is then renamed over the target,
/// so a crash mid-write leaves the previous record intact.
#[derive(Debug)]
pub struct JsonFileRepository {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "durable".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    async fn read(&self) -> Result<Option<DurableRecord>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(StoreError::Decode),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Backend(anyhow::Error::new(e).context(format!(
                "failed to read {}",
                self.path.display()
            )))),
        }
    }
}

#[async_trait]
impl DurableRepository for JsonFileRepository {
    async fn load(&self) -> Result<Option<DurableRecord>, StoreError> {
        self.read().await
    }

    async fn save(
        &self,
        mut record: DurableRecord,
        expected: Revision,
    ) -> Result<Revision, StoreError> {
        let _guard = self.write_lock.lock().await;

        let actual = self
            .read()
            .await?
            .map(|r| r.revision)
            .unwrap_or(Revision::NONE);
        if actual != expected {
            return Err(StoreError::Conflict { expected, actual });
        }

        let next = expected.next();
        record.revision = next;
        let bytes = serde_json::to_vec_pretty(&record).map_err(StoreError::Encode)?;

        let temp = self.temp_path();
        tokio::fs::write(&temp, &bytes).await.map_err(|e| {
            StoreError::Backend(
                anyhow::Error::new(e).context(format!("failed to write {}", temp.display())),
            )
        })?;
        tokio::fs::rename(&temp, &self.path).await.map_err(|e| {
            StoreError::Backend(
                anyhow::Error::new(e).context(format!("failed to replace {}", self.path.display())),
            )
        })?;

        Ok(next)
    }
}
