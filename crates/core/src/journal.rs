//! YAML record journal.
//!
//! When a data directory is configured, each committed record is written as a single YAML
//! document in a sharded layout:
//!
//! ```text
//! <data_dir>/
//!   <tenant>/
//!     pregnancies/<s1>/<s2>/<uuid>.yaml
//!     visits/...
//!     deliveries/...
//!     immunizations/...
//!     residents/...
//!     events/...
//! ```
//!
//! where `s1` and `s2` are the first four hex characters of the record id. Files are written to a
//! temporary sibling and renamed into place so a reader never sees a half-written record.
//!
//! On startup [`YamlJournal::load_all`] replays every record of a kind across all tenants.
//! Files that fail to parse are logged and skipped.

use crate::constants::{
    DELIVERIES_DIR_NAME, EVENTS_DIR_NAME, IMMUNIZATIONS_DIR_NAME, JOURNAL_EXTENSION,
    PREGNANCIES_DIR_NAME, RESIDENTS_DIR_NAME, VISITS_DIR_NAME,
};
use crate::context::TenantId;
use crate::{KiaError, KiaResult};
use kia_uuid::ShardableUuid;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use std::sync::{LazyLock, Mutex};

/// The record kinds stored in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Pregnancies,
    Visits,
    Deliveries,
    Immunizations,
    Residents,
    Events,
}

impl RecordKind {
    pub fn dir_name(self) -> &'static str {
        match self {
            RecordKind::Pregnancies => PREGNANCIES_DIR_NAME,
            RecordKind::Visits => VISITS_DIR_NAME,
            RecordKind::Deliveries => DELIVERIES_DIR_NAME,
            RecordKind::Immunizations => IMMUNIZATIONS_DIR_NAME,
            RecordKind::Residents => RESIDENTS_DIR_NAME,
            RecordKind::Events => EVENTS_DIR_NAME,
        }
    }
}

#[derive(Clone, Debug)]
pub struct YamlJournal {
    root: PathBuf,
}

impl YamlJournal {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn kind_dir(&self, tenant: &TenantId, kind: RecordKind) -> PathBuf {
        self.root.join(tenant.as_str()).join(kind.dir_name())
    }

    /// Path of the file holding record `id`.
    pub fn record_path(&self, tenant: &TenantId, kind: RecordKind, id: &ShardableUuid) -> PathBuf {
        id.sharded_file(&self.kind_dir(tenant, kind), JOURNAL_EXTENSION)
    }

    /// Writes (or overwrites) one record.
    pub fn write<T: Serialize>(
        &self,
        tenant: &TenantId,
        kind: RecordKind,
        id: &ShardableUuid,
        value: &T,
    ) -> KiaResult<()> {
        check_forced_failure()?;

        let yaml = serde_yaml::to_string(value).map_err(KiaError::YamlSerialization)?;
        let path = self.record_path(tenant, kind, id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(KiaError::DirCreation)?;
        }

        let tmp = path.with_extension(format!("{}.tmp", JOURNAL_EXTENSION));
        fs::write(&tmp, yaml).map_err(KiaError::FileWrite)?;
        fs::rename(&tmp, &path).map_err(KiaError::FileWrite)?;
        Ok(())
    }

    /// Removes one record. Removing a record that does not exist is not an error.
    pub fn remove(&self, tenant: &TenantId, kind: RecordKind, id: &ShardableUuid) -> KiaResult<()> {
        match fs::remove_file(self.record_path(tenant, kind, id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KiaError::FileRemove(e)),
        }
    }

    /// Reads one record.
    pub fn read<T: DeserializeOwned>(
        &self,
        tenant: &TenantId,
        kind: RecordKind,
        id: &ShardableUuid,
    ) -> KiaResult<T> {
        let contents =
            fs::read_to_string(self.record_path(tenant, kind, id)).map_err(KiaError::FileRead)?;
        serde_yaml::from_str(&contents).map_err(KiaError::YamlDeserialization)
    }

    /// Replays every record of `kind` across all tenants.
    pub fn load_all<T: DeserializeOwned>(&self, kind: RecordKind) -> KiaResult<Vec<T>> {
        let mut records = Vec::new();

        let tenant_iter = match fs::read_dir(&self.root) {
            Ok(it) => it,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(KiaError::FileRead(e)),
        };

        for tenant in tenant_iter.flatten() {
            let kind_dir = tenant.path().join(kind.dir_name());
            for path in sharded_files(&kind_dir) {
                let contents = match fs::read_to_string(&path) {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!("failed to read journal file {}: {}", path.display(), e);
                        continue;
                    }
                };
                match serde_yaml::from_str::<T>(&contents) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        tracing::warn!("failed to parse journal file {}: {}", path.display(), e);
                    }
                }
            }
        }

        Ok(records)
    }
}

/// Lists `<dir>/<s1>/<s2>/*.yaml`, ignoring anything that does not fit the layout.
fn sharded_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let s1_iter = match fs::read_dir(dir) {
        Ok(it) => it,
        Err(_) => return files,
    };
    for s1 in s1_iter.flatten() {
        let s1_path = s1.path();
        if !s1_path.is_dir() {
            continue;
        }

        let s2_iter = match fs::read_dir(&s1_path) {
            Ok(it) => it,
            Err(_) => continue,
        };

        for s2 in s2_iter.flatten() {
            let s2_path = s2.path();
            if !s2_path.is_dir() {
                continue;
            }

            let file_iter = match fs::read_dir(&s2_path) {
                Ok(it) => it,
                Err(_) => continue,
            };

            for file in file_iter.flatten() {
                let path = file.path();
                if path.is_file()
                    && path.extension().and_then(|e| e.to_str()) == Some(JOURNAL_EXTENSION)
                {
                    files.push(path);
                }
            }
        }
    }

    files
}

#[cfg(test)]
static FORCE_JOURNAL_ERROR_FOR_THREADS: LazyLock<Mutex<HashMap<std::thread::ThreadId, usize>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Makes the journal write after `skip` successful writes on the current thread fail.
#[cfg(test)]
pub(crate) fn force_journal_error_for_current_thread(skip: usize) {
    let mut guard = FORCE_JOURNAL_ERROR_FOR_THREADS
        .lock()
        .expect("FORCE_JOURNAL_ERROR_FOR_THREADS mutex poisoned");
    guard.insert(std::thread::current().id(), skip);
}

fn check_forced_failure() -> KiaResult<()> {
    #[cfg(test)]
    {
        let current_id = std::thread::current().id();
        let mut guard = FORCE_JOURNAL_ERROR_FOR_THREADS
            .lock()
            .expect("FORCE_JOURNAL_ERROR_FOR_THREADS mutex poisoned");

        if let Some(remaining) = guard.get_mut(&current_id) {
            if *remaining == 0 {
                guard.remove(&current_id);
                return Err(KiaError::FileWrite(std::io::Error::other(
                    "forced journal failure (test hook)",
                )));
            }
            *remaining -= 1;
        }
    }

    Ok(())
}
