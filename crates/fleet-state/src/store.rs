//! StateStore — redb-backed state persistence for Fleet.
//!
//! Provides typed CRUD over services, versions, and replicas. All values
//! are JSON-serialized into redb's `&[u8]` value columns. Two backends:
//!
//! - **shared** (on disk): the database file is opened for the duration of
//!   one transaction. redb holds an exclusive file lock while open, so
//!   concurrent openers from other processes wait with backoff until the
//!   lock is released. This makes every operation atomic across processes.
//! - **resident** (in memory): a single long-lived handle, for tests.
//!
//! There is no cascading delete: removing a service, its versions, and its
//! replicas are separate calls, so an interrupted cleanup leaves an
//! inspectable residue.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fleet_core::ServiceTask;
use redb::{
    Database, DatabaseError, ReadTransaction, ReadableDatabase, ReadableTable, TableDefinition,
    WriteTransaction,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// How long a shared-mode open waits for another process to release the file.
const SHARED_OPEN_TIMEOUT: Duration = Duration::from_secs(30);
const SHARED_OPEN_MAX_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Clone)]
enum Backend {
    Resident(Arc<Database>),
    Shared(Arc<PathBuf>),
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    backend: Backend,
}

impl StateStore {
    /// Open (or create) the on-disk state store shared by every process on
    /// this host.
    pub fn open(path: &Path) -> StateResult<Self> {
        let store = Self {
            backend: Backend::Shared(Arc::new(path.to_path_buf())),
        };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            backend: Backend::Resident(Arc::new(db)),
        };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        self.write(|txn| {
            // Opening a table in a write transaction creates it if absent.
            txn.open_table(SERVICES).map_err(map_err!(Table))?;
            txn.open_table(VERSIONS).map_err(map_err!(Table))?;
            txn.open_table(REPLICAS).map_err(map_err!(Table))?;
            Ok(())
        })
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> StateResult<T>) -> StateResult<T> {
        match &self.backend {
            Backend::Resident(db) => f(db),
            Backend::Shared(path) => {
                let db = open_shared(path)?;
                f(&db)
            }
        }
    }

    /// Run `f` inside one write transaction. Nothing is committed if `f` fails.
    fn write<T>(&self, f: impl FnOnce(&WriteTransaction) -> StateResult<T>) -> StateResult<T> {
        self.with_db(|db| {
            let txn = db.begin_write().map_err(map_err!(Transaction))?;
            let out = f(&txn)?;
            txn.commit().map_err(map_err!(Transaction))?;
            Ok(out)
        })
    }

    fn read<T>(&self, f: impl FnOnce(&ReadTransaction) -> StateResult<T>) -> StateResult<T> {
        self.with_db(|db| {
            let txn = db.begin_read().map_err(map_err!(Transaction))?;
            f(&txn)
        })
    }

    fn get_row<T: DeserializeOwned>(
        &self,
        def: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        self.read(|txn| {
            let table = txn.open_table(def).map_err(map_err!(Table))?;
            match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => Ok(Some(decode(guard.value())?)),
                None => Ok(None),
            }
        })
    }

    fn list_rows<T: DeserializeOwned>(
        &self,
        def: TableDefinition<&str, &[u8]>,
        prefix: &str,
    ) -> StateResult<Vec<T>> {
        self.read(|txn| {
            let table = txn.open_table(def).map_err(map_err!(Table))?;
            let mut results = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                if key.value().starts_with(prefix) {
                    results.push(decode(value.value())?);
                }
            }
            Ok(results)
        })
    }

    fn put_row<T: Serialize>(
        &self,
        def: TableDefinition<&str, &[u8]>,
        key: &str,
        row: &T,
    ) -> StateResult<()> {
        let value = encode(row)?;
        self.write(|txn| {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
            Ok(())
        })
    }

    /// Insert `row` only if `key` is vacant. Returns whether it was inserted.
    fn insert_new_row<T: Serialize>(
        &self,
        def: TableDefinition<&str, &[u8]>,
        key: &str,
        row: &T,
    ) -> StateResult<bool> {
        let value = encode(row)?;
        self.write(|txn| {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let exists = table.get(key).map_err(map_err!(Read))?.is_some();
            if exists {
                return Ok(false);
            }
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
            Ok(true)
        })
    }

    /// Atomic read-modify-write of one row. `Ok(None)` if the row is absent.
    fn update_row<T, F>(
        &self,
        def: TableDefinition<&str, &[u8]>,
        key: &str,
        f: F,
    ) -> StateResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> StateResult<()>,
    {
        self.write(|txn| {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let current = table
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            let Some(bytes) = current else {
                return Ok(None);
            };
            let mut row: T = decode(&bytes)?;
            f(&mut row)?;
            let value = encode(&row)?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
            Ok(Some(row))
        })
    }

    fn delete_row(&self, def: TableDefinition<&str, &[u8]>, key: &str) -> StateResult<bool> {
        self.write(|txn| {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let existed = table.remove(key).map_err(map_err!(Write))?.is_some();
            Ok(existed)
        })
    }

    // ── Services ───────────────────────────────────────────────────

    /// Reserve a service name. Returns `false` if the name is taken.
    pub fn add_service(&self, record: &ServiceRecord) -> StateResult<bool> {
        let added = self.insert_new_row(SERVICES, &record.name, record)?;
        debug!(service = %record.name, added, "service add");
        Ok(added)
    }

    pub fn get_service(&self, name: &str) -> StateResult<Option<ServiceRecord>> {
        self.get_row(SERVICES, name)
    }

    pub fn list_services(&self) -> StateResult<Vec<ServiceRecord>> {
        self.list_rows(SERVICES, "")
    }

    pub fn count_services(&self) -> StateResult<usize> {
        Ok(self.list_services()?.len())
    }

    /// Current status, or `Removed` once the row is gone.
    pub fn service_status(&self, name: &str) -> StateResult<ServiceStatus> {
        Ok(self
            .get_service(name)?
            .map(|svc| svc.status)
            .unwrap_or(ServiceStatus::Removed))
    }

    fn update_service<F>(&self, name: &str, f: F) -> StateResult<Option<ServiceRecord>>
    where
        F: FnOnce(&mut ServiceRecord) -> StateResult<()>,
    {
        self.update_row(SERVICES, name, |svc: &mut ServiceRecord| {
            f(svc)?;
            svc.updated_at = epoch_secs();
            Ok(())
        })
    }

    /// Move a service to `status`, enforcing the status state machine.
    ///
    /// Returns `false` if the service row does not exist.
    pub fn set_service_status(&self, name: &str, status: ServiceStatus) -> StateResult<bool> {
        let updated = self.update_service(name, |svc| {
            if !svc.status.can_transition_to(status) {
                return Err(StateError::InvalidTransition {
                    service: svc.name.clone(),
                    from: svc.status,
                    to: status,
                });
            }
            svc.status = status;
            Ok(())
        })?;
        if updated.is_some() {
            debug!(service = %name, %status, "service status set");
        }
        Ok(updated.is_some())
    }

    pub fn set_service_controller_port(&self, name: &str, port: u16) -> StateResult<()> {
        self.update_service(name, |svc| {
            svc.controller_port = Some(port);
            Ok(())
        })?
        .ok_or_else(|| StateError::NotFound(name.to_string()))?;
        Ok(())
    }

    pub fn set_service_load_balancer_port(&self, name: &str, port: u16) -> StateResult<()> {
        self.update_service(name, |svc| {
            svc.load_balancer_port = Some(port);
            Ok(())
        })?
        .ok_or_else(|| StateError::NotFound(name.to_string()))?;
        Ok(())
    }

    /// Refresh the policy and resource descriptors after a task update.
    pub fn set_service_descriptors(&self, name: &str, task: &ServiceTask) -> StateResult<()> {
        self.update_service(name, |svc| {
            svc.policy = task.service.replica_policy.describe();
            svc.requested_resources = task.resources_descriptor();
            Ok(())
        })?
        .ok_or_else(|| StateError::NotFound(name.to_string()))?;
        Ok(())
    }

    pub fn set_active_versions(&self, name: &str, versions: &[VersionNumber]) -> StateResult<()> {
        self.update_service(name, |svc| {
            svc.active_versions = versions.to_vec();
            Ok(())
        })?
        .ok_or_else(|| StateError::NotFound(name.to_string()))?;
        Ok(())
    }

    /// Record a launch result and return the consecutive-failure count.
    pub fn record_launch_outcome(&self, name: &str, succeeded: bool) -> StateResult<u32> {
        let svc = self
            .update_service(name, |svc| {
                if succeeded {
                    svc.consecutive_launch_failures = 0;
                } else {
                    svc.consecutive_launch_failures += 1;
                }
                Ok(())
            })?
            .ok_or_else(|| StateError::NotFound(name.to_string()))?;
        Ok(svc.consecutive_launch_failures)
    }

    /// Hand out the next replica id for a service. Ids are never reused.
    pub fn allocate_replica_id(&self, name: &str) -> StateResult<ReplicaId> {
        let mut allocated = 0;
        self.update_service(name, |svc| {
            allocated = svc.next_replica_id;
            svc.next_replica_id += 1;
            Ok(())
        })?
        .ok_or_else(|| StateError::NotFound(name.to_string()))?;
        Ok(allocated)
    }

    /// Delete a service row. Versions and replicas are left untouched.
    pub fn remove_service(&self, name: &str) -> StateResult<bool> {
        let existed = self.delete_row(SERVICES, name)?;
        debug!(service = %name, existed, "service removed");
        Ok(existed)
    }

    // ── Versions ───────────────────────────────────────────────────

    /// Register a version. Versions are immutable: returns `false` if the
    /// version already exists.
    pub fn add_version(&self, record: &VersionRecord) -> StateResult<bool> {
        let added = self.insert_new_row(VERSIONS, &record.table_key(), record)?;
        debug!(service = %record.service_name, version = record.version, added, "version add");
        Ok(added)
    }

    pub fn get_version(
        &self,
        name: &str,
        version: VersionNumber,
    ) -> StateResult<Option<VersionRecord>> {
        self.get_row(VERSIONS, &version_key(name, version))
    }

    /// All versions of a service, oldest first.
    pub fn list_versions(&self, name: &str) -> StateResult<Vec<VersionRecord>> {
        self.list_rows(VERSIONS, &format!("{name}:"))
    }

    pub fn latest_version(&self, name: &str) -> StateResult<Option<VersionNumber>> {
        Ok(self.list_versions(name)?.last().map(|v| v.version))
    }

    /// Withdraw one version whose registration could not be completed.
    /// Returns true if it existed.
    pub fn remove_version(&self, name: &str, version: VersionNumber) -> StateResult<bool> {
        let existed = self.delete_row(VERSIONS, &version_key(name, version))?;
        debug!(service = %name, version, existed, "version removed");
        Ok(existed)
    }

    /// Delete every version of a service. Returns number deleted.
    pub fn remove_versions(&self, name: &str) -> StateResult<u32> {
        let prefix = format!("{name}:");
        self.write(|txn| {
            let mut table = txn.open_table(VERSIONS).map_err(map_err!(Table))?;
            let keys: Vec<String> = table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect();
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            Ok(keys.len() as u32)
        })
    }

    // ── Replicas ───────────────────────────────────────────────────

    /// Insert or replace a replica row.
    pub fn put_replica(&self, info: &ReplicaInfo) -> StateResult<()> {
        self.put_row(REPLICAS, &info.table_key(), info)
    }

    pub fn get_replica(&self, name: &str, id: ReplicaId) -> StateResult<Option<ReplicaInfo>> {
        self.get_row(REPLICAS, &replica_key(name, id))
    }

    /// All replicas of a service, by ascending id.
    pub fn list_replicas(&self, name: &str) -> StateResult<Vec<ReplicaInfo>> {
        self.list_rows(REPLICAS, &format!("{name}:"))
    }

    /// Atomically transition one replica row. `Ok(None)` if the row is absent.
    pub fn update_replica<F>(
        &self,
        name: &str,
        id: ReplicaId,
        f: F,
    ) -> StateResult<Option<ReplicaInfo>>
    where
        F: FnOnce(&mut ReplicaInfo),
    {
        self.update_row(REPLICAS, &replica_key(name, id), |info: &mut ReplicaInfo| {
            f(info);
            info.updated_at = epoch_secs();
            Ok(())
        })
    }

    /// Delete a replica row. Returns true if it existed.
    pub fn remove_replica(&self, name: &str, id: ReplicaId) -> StateResult<bool> {
        self.delete_row(REPLICAS, &replica_key(name, id))
    }
}

fn open_shared(path: &Path) -> StateResult<Database> {
    let deadline = Instant::now() + SHARED_OPEN_TIMEOUT;
    let mut backoff = Duration::from_millis(1);
    loop {
        match Database::create(path) {
            Ok(db) => return Ok(db),
            Err(DatabaseError::DatabaseAlreadyOpen) if Instant::now() < deadline => {
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(SHARED_OPEN_MAX_BACKOFF);
            }
            Err(e) => return Err(StateError::Open(e.to_string())),
        }
    }
}

fn encode<T: Serialize>(row: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(row).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}
