//! Immunization scheduler and completeness engine.
//!
//! Dose records are stored per child. Everything else, the set of doses given, the IDL
//! (Imunisasi Dasar Lengkap) flag, the due and upcoming lists and the target population, is
//! derived on read by [`compute_status`] from the stored records and a reference date.
//!
//! ## IDL rule
//!
//! A child is complete when every code in [`BASIC_SCHEDULE`] has a `Given` record and the child is
//! at least `idl_completion_age_months` old (9 by default, the MR1 eligibility point). `Polio4` is
//! a basic-category dose on the posyandu card but is not part of the completeness set;
//! `DPTHBHib4` and `MR2` are boosters.

use crate::context::{RequestContext, TenantId};
use crate::dates::age_in_months;
use crate::events::{EntityKind, EventAction};
use crate::journal::RecordKind;
use crate::pagination::{Page, PageRequest};
use crate::residents::Resident;
use crate::store::{KiaStore, Tables};
use crate::validation::{clean_note, code_key};
use crate::{KiaError, KiaResult};
use chrono::{DateTime, NaiveDate, Utc};
use kia_uuid::ShardableUuid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VaccineCode {
    #[serde(rename = "HB0")]
    Hb0,
    #[serde(rename = "BCG")]
    Bcg,
    Polio1,
    Polio2,
    Polio3,
    Polio4,
    #[serde(rename = "DPTHBHib1")]
    DptHbHib1,
    #[serde(rename = "DPTHBHib2")]
    DptHbHib2,
    #[serde(rename = "DPTHBHib3")]
    DptHbHib3,
    #[serde(rename = "DPTHBHib4")]
    DptHbHib4,
    #[serde(rename = "IPV")]
    Ipv,
    #[serde(rename = "MR1")]
    Mr1,
    #[serde(rename = "MR2")]
    Mr2,
}

/// Doses that must all be given for a child to count as complete.
pub const BASIC_SCHEDULE: [VaccineCode; 10] = [
    VaccineCode::Hb0,
    VaccineCode::Bcg,
    VaccineCode::Polio1,
    VaccineCode::Polio2,
    VaccineCode::Polio3,
    VaccineCode::DptHbHib1,
    VaccineCode::DptHbHib2,
    VaccineCode::DptHbHib3,
    VaccineCode::Ipv,
    VaccineCode::Mr1,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VaccineCategory {
    Basic,
    Booster,
}

impl VaccineCode {
    pub const ALL: [VaccineCode; 13] = [
        VaccineCode::Hb0,
        VaccineCode::Bcg,
        VaccineCode::Polio1,
        VaccineCode::Polio2,
        VaccineCode::Polio3,
        VaccineCode::Polio4,
        VaccineCode::DptHbHib1,
        VaccineCode::DptHbHib2,
        VaccineCode::DptHbHib3,
        VaccineCode::DptHbHib4,
        VaccineCode::Ipv,
        VaccineCode::Mr1,
        VaccineCode::Mr2,
    ];

    pub fn code(self) -> &'static str {
        match self {
            VaccineCode::Hb0 => "HB0",
            VaccineCode::Bcg => "BCG",
            VaccineCode::Polio1 => "Polio1",
            VaccineCode::Polio2 => "Polio2",
            VaccineCode::Polio3 => "Polio3",
            VaccineCode::Polio4 => "Polio4",
            VaccineCode::DptHbHib1 => "DPTHBHib1",
            VaccineCode::DptHbHib2 => "DPTHBHib2",
            VaccineCode::DptHbHib3 => "DPTHBHib3",
            VaccineCode::DptHbHib4 => "DPTHBHib4",
            VaccineCode::Ipv => "IPV",
            VaccineCode::Mr1 => "MR1",
            VaccineCode::Mr2 => "MR2",
        }
    }

    pub fn category(self) -> VaccineCategory {
        match self {
            VaccineCode::DptHbHib4 | VaccineCode::Mr2 => VaccineCategory::Booster,
            _ => VaccineCategory::Basic,
        }
    }

    /// Age in months at which the dose is recommended.
    pub fn recommended_age_months(self) -> i64 {
        match self {
            VaccineCode::Hb0 => 0,
            VaccineCode::Bcg | VaccineCode::Polio1 => 1,
            VaccineCode::DptHbHib1 | VaccineCode::Polio2 => 2,
            VaccineCode::DptHbHib2 | VaccineCode::Polio3 => 3,
            VaccineCode::DptHbHib3 | VaccineCode::Polio4 | VaccineCode::Ipv => 4,
            VaccineCode::Mr1 => 9,
            VaccineCode::DptHbHib4 | VaccineCode::Mr2 => 18,
        }
    }
}

impl fmt::Display for VaccineCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for VaccineCode {
    type Err = KiaError;

    /// Matches the schedule codes ignoring case and punctuation, so `"DPT-HB-Hib 1"` is
    /// `DPTHBHib1`. `"HB-0"` and `"Hepatitis B0"` are accepted for `HB0`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = code_key(s);
        if key == "hepatitisb0" {
            return Ok(VaccineCode::Hb0);
        }
        VaccineCode::ALL
            .into_iter()
            .find(|code| code_key(code.code()) == key)
            .ok_or_else(|| KiaError::validation(format!("unknown vaccine code '{}'", s)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DoseStatus {
    Given,
    Deferred,
    NotGiven,
}

impl FromStr for DoseStatus {
    type Err = KiaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match code_key(s).as_str() {
            "given" | "diberikan" | "sudah" => Ok(DoseStatus::Given),
            "deferred" | "ditunda" => Ok(DoseStatus::Deferred),
            "notgiven" | "tidakdiberikan" | "belum" => Ok(DoseStatus::NotGiven),
            _ => Err(KiaError::validation(format!("unknown dose status '{}'", s))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImmunizationRecord {
    pub id: ShardableUuid,
    pub tenant: TenantId,
    pub child_resident_id: ShardableUuid,
    pub vaccine_code: VaccineCode,
    pub category: VaccineCategory,
    pub given_date: NaiveDate,
    pub posyandu_site: Option<String>,
    pub administration_site: Option<String>,
    pub worker_id: String,
    pub worker_name: String,
    pub vaccine_batch: Option<String>,
    pub status: DoseStatus,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ImmunizationRecord {
    /// Matches `needle` against the vaccine code (ignoring case and punctuation), the batch, the
    /// posyandu site and the note.
    pub fn matches_search(&self, needle: &str) -> bool {
        let key = code_key(needle);
        if key.is_empty() || code_key(self.vaccine_code.code()).contains(&key) {
            return true;
        }
        let needle = needle.trim().to_lowercase();
        [&self.vaccine_batch, &self.posyandu_site, &self.note]
            .into_iter()
            .flatten()
            .any(|text| text.to_lowercase().contains(&needle))
    }
}

#[derive(Clone, Debug)]
pub struct NewDose {
    pub vaccine: VaccineCode,
    pub given_date: NaiveDate,
    pub status: DoseStatus,
    pub posyandu_site: Option<String>,
    pub administration_site: Option<String>,
    pub vaccine_batch: Option<String>,
    pub note: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ImmunizationStatus {
    pub child_resident_id: ShardableUuid,
    pub age_months: i64,
    pub doses_given: BTreeSet<VaccineCode>,
    pub is_complete: bool,
    /// Basic doses whose recommended age has been reached but which are not yet given.
    pub due: Vec<VaccineCode>,
    /// Basic doses not yet recommended at the child's age.
    pub upcoming: Vec<VaccineCode>,
    /// Newest first.
    pub history: Vec<ImmunizationRecord>,
}

/// Derives a child's immunization status as of `as_of`.
///
/// Records dated after `as_of` are ignored, so the same call answers "what was the status on
/// that day" for past dates.
pub fn compute_status(
    child: &Resident,
    records: &[ImmunizationRecord],
    as_of: NaiveDate,
    completion_age_months: u32,
) -> ImmunizationStatus {
    let age_months = age_in_months(child.birth_date, as_of);

    let mut history: Vec<ImmunizationRecord> = records
        .iter()
        .filter(|r| r.given_date <= as_of)
        .cloned()
        .collect();
    history.sort_by(|a, b| {
        b.given_date
            .cmp(&a.given_date)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });

    let doses_given: BTreeSet<VaccineCode> = history
        .iter()
        .filter(|r| r.status == DoseStatus::Given)
        .map(|r| r.vaccine_code)
        .collect();

    let basic_done = BASIC_SCHEDULE.iter().all(|code| doses_given.contains(code));
    let is_complete = basic_done && age_months >= i64::from(completion_age_months);

    let (due, upcoming): (Vec<VaccineCode>, Vec<VaccineCode>) = BASIC_SCHEDULE
        .into_iter()
        .filter(|code| !doses_given.contains(code))
        .partition(|code| code.recommended_age_months() <= age_months);

    ImmunizationStatus {
        child_resident_id: child.id,
        age_months,
        doses_given,
        is_complete,
        due,
        upcoming,
        history,
    }
}

/// Age window and area filter for [`ImmunizationService::list_targets`].
#[derive(Clone, Debug, Default)]
pub struct TargetFilter {
    pub min_age_months: Option<u32>,
    /// Defaults to the configured target window.
    pub max_age_months: Option<u32>,
    pub sub_village: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TargetEntry {
    pub child: Resident,
    pub age_months: i64,
    pub is_complete: bool,
    pub doses_given: usize,
}

/// Children aged `min..=max` months on `as_of`, each with their status on that date.
///
/// Callers hold the table read lock, so a child provisioned by an in-flight delivery is never seen
/// without its closed pregnancy.
pub(crate) fn population(
    store: &KiaStore,
    tables: &Tables,
    ctx: &RequestContext,
    as_of: NaiveDate,
    min_age_months: u32,
    max_age_months: u32,
) -> KiaResult<Vec<(Resident, ImmunizationStatus)>> {
    let completion_age = store.cfg().idl_completion_age_months();
    let min = i64::from(min_age_months);
    let max = i64::from(max_age_months);

    let mut children = Vec::new();
    for resident in store.residents().list(ctx)? {
        if resident.birth_date > as_of {
            continue;
        }
        let age = age_in_months(resident.birth_date, as_of);
        if age < min || age > max {
            continue;
        }
        let status = compute_status(
            &resident,
            tables.doses_for(&resident.id),
            as_of,
            completion_age,
        );
        children.push((resident, status));
    }
    Ok(children)
}

#[derive(Clone)]
pub struct ImmunizationService {
    store: Arc<KiaStore>,
}

impl ImmunizationService {
    pub fn new(store: Arc<KiaStore>) -> Self {
        Self { store }
    }

    /// Records one dose event for a child.
    ///
    /// `Deferred` and `NotGiven` records never block a later `Given` record for the same code.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the child does not resolve.
    /// - `Validation` if `given_date` precedes the child's birth date or lies in the future.
    /// - `Conflict` if a `Given` record for the same code already exists.
    pub fn record_dose(
        &self,
        ctx: &RequestContext,
        child_id: &ShardableUuid,
        new: NewDose,
    ) -> KiaResult<ImmunizationRecord> {
        let child = {
            let _tables = self.store.read();
            self.store.residents().get(ctx, child_id)?
        };

        if new.given_date < child.birth_date {
            return Err(KiaError::validation(format!(
                "given_date {} precedes the child's birth date {}",
                new.given_date, child.birth_date
            )));
        }
        if new.given_date > ctx.today() {
            return Err(KiaError::validation(format!(
                "given_date {} is in the future",
                new.given_date
            )));
        }

        let lock = self.store.entity_lock(child.id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if new.status == DoseStatus::Given {
            let tables = self.store.read();
            let already = tables
                .doses_for(&child.id)
                .iter()
                .find(|r| r.vaccine_code == new.vaccine && r.status == DoseStatus::Given);
            if let Some(existing) = already {
                return Err(KiaError::conflict(format!(
                    "{} was already given to child {} on {}",
                    new.vaccine, child.id, existing.given_date
                )));
            }
        }

        let record = ImmunizationRecord {
            id: ShardableUuid::new(),
            tenant: ctx.tenant().clone(),
            child_resident_id: child.id,
            vaccine_code: new.vaccine,
            category: new.vaccine.category(),
            given_date: new.given_date,
            posyandu_site: clean_note(new.posyandu_site),
            administration_site: clean_note(new.administration_site),
            worker_id: ctx.worker().id.to_string(),
            worker_name: ctx.worker().name.to_string(),
            vaccine_batch: clean_note(new.vaccine_batch),
            status: new.status,
            note: clean_note(new.note),
            created_at: ctx.received_at(),
        };

        self.store
            .persist(ctx.tenant(), RecordKind::Immunizations, &record.id, &record)?;
        self.store
            .write()
            .immunizations
            .entry(record.child_resident_id)
            .or_default()
            .push(record.clone());

        self.store.publish(
            ctx,
            EventAction::EntityCreated,
            EntityKind::Immunization,
            record.id,
        );
        tracing::info!(
            "recorded {} ({:?}) for child {}",
            record.vaccine_code,
            record.status,
            record.child_resident_id
        );

        Ok(record)
    }

    /// The child's status as of the request date.
    pub fn get_status(
        &self,
        ctx: &RequestContext,
        child_id: &ShardableUuid,
    ) -> KiaResult<ImmunizationStatus> {
        let tables = self.store.read();
        let child = self.store.residents().get(ctx, child_id)?;
        Ok(compute_status(
            &child,
            tables.doses_for(&child.id),
            ctx.today(),
            self.store.cfg().idl_completion_age_months(),
        ))
    }

    /// Dose records for a child, newest first, filtered by the search text.
    pub fn history(
        &self,
        ctx: &RequestContext,
        child_id: &ShardableUuid,
        page: &PageRequest,
    ) -> KiaResult<Page<ImmunizationRecord>> {
        let tables = self.store.read();
        let child = self.store.residents().get(ctx, child_id)?;

        let mut records: Vec<ImmunizationRecord> = tables
            .doses_for(&child.id)
            .iter()
            .filter(|r| page.search().is_none_or(|s| r.matches_search(s)))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.given_date
                .cmp(&a.given_date)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(page.paginate(records))
    }

    /// The immunization target population ("sasaran"), youngest first.
    ///
    /// # Errors
    ///
    /// Returns `KiaError::Validation` if the age window is empty.
    pub fn list_targets(
        &self,
        ctx: &RequestContext,
        filter: &TargetFilter,
        page: &PageRequest,
    ) -> KiaResult<Page<TargetEntry>> {
        let min = filter.min_age_months.unwrap_or(0);
        let max = filter
            .max_age_months
            .unwrap_or(self.store.cfg().target_max_age_months());
        if min > max {
            return Err(KiaError::validation(format!(
                "min_age_months ({}) exceeds max_age_months ({})",
                min, max
            )));
        }

        let tables = self.store.read();
        let mut entries: Vec<TargetEntry> =
            population(&self.store, &tables, ctx, ctx.today(), min, max)?
                .into_iter()
                .filter(|(child, _)| {
                    filter
                        .sub_village
                        .as_deref()
                        .is_none_or(|sv| child.in_sub_village(sv))
                })
                .filter(|(child, _)| page.search().is_none_or(|s| child.matches_search(s)))
                .map(|(child, status)| TargetEntry {
                    age_months: status.age_months,
                    is_complete: status.is_complete,
                    doses_given: status.doses_given.len(),
                    child,
                })
                .collect();
        drop(tables);

        entries.sort_by(|a, b| {
            b.child
                .birth_date
                .cmp(&a.child.birth_date)
                .then_with(|| a.child.name.as_str().cmp(b.child.name.as_str()))
        });
        Ok(page.paginate(entries))
    }
}
