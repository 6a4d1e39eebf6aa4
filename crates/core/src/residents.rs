//! Resident directory gateway.
//!
//! Residents are owned by the village population register, not by this engine. The engine only
//! resolves them (by NIK or by id), lists them to build immunization target populations, and asks
//! the register to provision a new child after a delivery.
//!
//! [`ResidentDirectory`] is the seam. [`LocalResidentDirectory`] is an in-process implementation
//! that keeps residents in memory and, when given a journal, persists them under the `residents`
//! record kind.

use crate::context::{RequestContext, TenantId};
use crate::journal::{RecordKind, YamlJournal};
use crate::{KiaError, KiaResult};
use chrono::{DateTime, NaiveDate, Utc};
use kia_types::{Nik, NonEmptyText, Sex};
use kia_uuid::ShardableUuid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resident {
    pub id: ShardableUuid,
    pub tenant: TenantId,
    /// Absent for newborns until civil registration issues one.
    pub nik: Option<Nik>,
    pub name: NonEmptyText,
    pub birth_date: NaiveDate,
    pub sex: Sex,
    pub address: Option<String>,
    pub sub_village: Option<String>,
    /// Set for children provisioned from a delivery record.
    #[serde(default)]
    pub mother_id: Option<ShardableUuid>,
    pub registered_at: DateTime<Utc>,
}

impl Resident {
    /// Case-insensitive match of `needle` against name and NIK.
    pub fn matches_search(&self, needle: &str) -> bool {
        let needle = needle.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }
        self.name.as_str().to_lowercase().contains(&needle)
            || self
                .nik
                .as_ref()
                .is_some_and(|nik| nik.as_str().contains(&needle))
    }

    pub fn in_sub_village(&self, sub_village: &str) -> bool {
        self.sub_village
            .as_deref()
            .is_some_and(|s| s.trim().eq_ignore_ascii_case(sub_village.trim()))
    }
}

/// Data needed to register an existing resident with the directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewResident {
    pub nik: Nik,
    pub name: NonEmptyText,
    pub birth_date: NaiveDate,
    pub sex: Sex,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub sub_village: Option<String>,
}

/// Birth facts taken from a delivery record.
#[derive(Clone, Debug)]
pub struct BirthFacts {
    pub name: NonEmptyText,
    pub sex: Sex,
    pub birth_date: NaiveDate,
    pub mother_id: ShardableUuid,
    pub address: Option<String>,
    pub sub_village: Option<String>,
}

/// Access to the population register.
pub trait ResidentDirectory: Send + Sync {
    /// Resolves a resident by national identity number.
    fn resolve_by_identifier(&self, ctx: &RequestContext, nik: &Nik) -> KiaResult<Resident>;

    fn get(&self, ctx: &RequestContext, id: &ShardableUuid) -> KiaResult<Resident>;

    /// Registers a newborn.
    fn provision(&self, ctx: &RequestContext, facts: BirthFacts) -> KiaResult<Resident>;

    /// Withdraws a resident provisioned by a delivery that was subsequently rolled back.
    fn retract(&self, ctx: &RequestContext, id: &ShardableUuid) -> KiaResult<()>;

    fn list(&self, ctx: &RequestContext) -> KiaResult<Vec<Resident>>;
}

/// Seed file entry; tenant is per entry so one file can seed several posyandu.
#[derive(Clone, Debug, Deserialize)]
struct SeedResident {
    tenant: TenantId,
    #[serde(flatten)]
    resident: NewResident,
}

#[derive(Default)]
pub struct LocalResidentDirectory {
    residents: RwLock<HashMap<ShardableUuid, Resident>>,
    journal: Option<YamlJournal>,
}

impl LocalResidentDirectory {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens a directory backed by `journal`, replaying residents already stored there.
    pub fn open(journal: YamlJournal) -> KiaResult<Self> {
        let stored: Vec<Resident> = journal.load_all(RecordKind::Residents)?;
        let residents = stored.into_iter().map(|r| (r.id, r)).collect();
        Ok(Self {
            residents: RwLock::new(residents),
            journal: Some(journal),
        })
    }

    /// Registers an existing resident.
    ///
    /// # Errors
    ///
    /// Returns `KiaError::Conflict` if the tenant already has a resident with the same NIK.
    pub fn register(&self, ctx: &RequestContext, new: NewResident) -> KiaResult<Resident> {
        let mut residents = self
            .residents
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let duplicate = residents
            .values()
            .any(|r| r.tenant == *ctx.tenant() && r.nik.as_ref() == Some(&new.nik));
        if duplicate {
            return Err(KiaError::conflict(format!(
                "a resident with NIK {} is already registered",
                new.nik
            )));
        }

        let resident = Resident {
            id: ShardableUuid::new(),
            tenant: ctx.tenant().clone(),
            nik: Some(new.nik),
            name: new.name,
            birth_date: new.birth_date,
            sex: new.sex,
            address: crate::validation::clean_note(new.address),
            sub_village: crate::validation::clean_note(new.sub_village),
            mother_id: None,
            registered_at: ctx.received_at(),
        };

        self.persist(&resident)?;
        residents.insert(resident.id, resident.clone());
        Ok(resident)
    }

    /// Registers every resident listed in a YAML seed file, skipping NIKs already present.
    ///
    /// Returns the number of residents added.
    pub fn seed_from_file(&self, path: &Path, registered_at: DateTime<Utc>) -> KiaResult<usize> {
        let contents = std::fs::read_to_string(path).map_err(KiaError::FileRead)?;
        let seeds: Vec<SeedResident> =
            serde_yaml::from_str(&contents).map_err(KiaError::YamlDeserialization)?;

        let mut added = 0;
        for seed in seeds {
            let ctx = RequestContext::at(
                seed.tenant,
                crate::context::WorkerRef::new("seed", "resident seed file")?,
                registered_at,
            );
            match self.register(&ctx, seed.resident) {
                Ok(_) => added += 1,
                Err(KiaError::Conflict(msg)) => tracing::debug!("seed skipped: {}", msg),
                Err(e) => return Err(e),
            }
        }
        Ok(added)
    }

    fn persist(&self, resident: &Resident) -> KiaResult<()> {
        match &self.journal {
            Some(journal) => {
                journal.write(&resident.tenant, RecordKind::Residents, &resident.id, resident)
            }
            None => Ok(()),
        }
    }
}

impl ResidentDirectory for LocalResidentDirectory {
    fn resolve_by_identifier(&self, ctx: &RequestContext, nik: &Nik) -> KiaResult<Resident> {
        let residents = self.residents.read().unwrap_or_else(PoisonError::into_inner);
        residents
            .values()
            .find(|r| r.tenant == *ctx.tenant() && r.nik.as_ref() == Some(nik))
            .cloned()
            .ok_or_else(|| KiaError::not_found("resident", nik))
    }

    fn get(&self, ctx: &RequestContext, id: &ShardableUuid) -> KiaResult<Resident> {
        let residents = self.residents.read().unwrap_or_else(PoisonError::into_inner);
        residents
            .get(id)
            .filter(|r| r.tenant == *ctx.tenant())
            .cloned()
            .ok_or_else(|| KiaError::not_found("resident", id))
    }

    fn provision(&self, ctx: &RequestContext, facts: BirthFacts) -> KiaResult<Resident> {
        let child = Resident {
            id: ShardableUuid::new(),
            tenant: ctx.tenant().clone(),
            nik: None,
            name: facts.name,
            birth_date: facts.birth_date,
            sex: facts.sex,
            address: facts.address,
            sub_village: facts.sub_village,
            mother_id: Some(facts.mother_id),
            registered_at: ctx.received_at(),
        };

        self.persist(&child)?;
        self.residents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(child.id, child.clone());
        Ok(child)
    }

    fn retract(&self, ctx: &RequestContext, id: &ShardableUuid) -> KiaResult<()> {
        let mut residents = self
            .residents
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if residents.get(id).is_some_and(|r| r.tenant == *ctx.tenant()) {
            if let Some(journal) = &self.journal {
                journal.remove(ctx.tenant(), RecordKind::Residents, id)?;
            }
            residents.remove(id);
        }
        Ok(())
    }

    fn list(&self, ctx: &RequestContext) -> KiaResult<Vec<Resident>> {
        let residents = self.residents.read().unwrap_or_else(PoisonError::into_inner);
        Ok(residents
            .values()
            .filter(|r| r.tenant == *ctx.tenant())
            .cloned()
            .collect())
    }
}
