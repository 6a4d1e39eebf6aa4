//! Antenatal visit log.
//!
//! Visits are append-only. A correction is a new visit that names the visit it supersedes and
//! carries a note; the superseded record stays in the log.

use crate::context::RequestContext;
use crate::events::{EntityKind, EventAction};
use crate::journal::RecordKind;
use crate::pagination::{Page, PageRequest};
use crate::store::KiaStore;
use crate::validation::{clean_note, positive_measurement, positive_reading};
use crate::{KiaError, KiaResult};
use chrono::{DateTime, NaiveDate, Utc};
use kia_uuid::ShardableUuid;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AntenatalVisit {
    pub id: ShardableUuid,
    pub pregnancy_id: ShardableUuid,
    pub visit_number: u32,
    pub visit_date: NaiveDate,
    pub weight_kg: Option<f64>,
    pub blood_pressure_sys: Option<u16>,
    pub blood_pressure_dia: Option<u16>,
    pub fundal_height_cm: Option<f64>,
    pub fetal_heart_rate: Option<u16>,
    pub complaint: Option<String>,
    pub action_taken: Option<String>,
    pub note: Option<String>,
    #[serde(default)]
    pub supersedes: Option<ShardableUuid>,
    pub worker_id: String,
    pub worker_name: String,
    pub created_at: DateTime<Utc>,
}

impl AntenatalVisit {
    /// Case-insensitive match of `needle` against the complaint, action taken and note.
    pub fn matches_search(&self, needle: &str) -> bool {
        let needle = needle.trim().to_lowercase();
        needle.is_empty()
            || [&self.complaint, &self.action_taken, &self.note]
                .into_iter()
                .flatten()
                .any(|text| text.to_lowercase().contains(&needle))
    }
}

#[derive(Clone, Debug, Default)]
pub struct NewVisit {
    /// Signed so that a non-positive number from the caller is reported, not wrapped.
    pub visit_number: i64,
    pub visit_date: NaiveDate,
    pub weight_kg: Option<f64>,
    pub blood_pressure_sys: Option<u16>,
    pub blood_pressure_dia: Option<u16>,
    pub fundal_height_cm: Option<f64>,
    pub fetal_heart_rate: Option<u16>,
    pub complaint: Option<String>,
    pub action_taken: Option<String>,
    pub note: Option<String>,
    pub supersedes: Option<ShardableUuid>,
}

fn validate_measurements(new: &NewVisit) -> KiaResult<()> {
    positive_measurement("weight_kg", new.weight_kg)?;
    positive_measurement("fundal_height_cm", new.fundal_height_cm)?;
    positive_reading("blood_pressure_sys", new.blood_pressure_sys)?;
    positive_reading("blood_pressure_dia", new.blood_pressure_dia)?;
    positive_reading("fetal_heart_rate", new.fetal_heart_rate)?;

    match (new.blood_pressure_sys, new.blood_pressure_dia) {
        (Some(sys), Some(dia)) if sys <= dia => Err(KiaError::validation(format!(
            "systolic pressure ({}) must exceed diastolic pressure ({})",
            sys, dia
        ))),
        (Some(_), None) | (None, Some(_)) => Err(KiaError::validation(
            "blood pressure needs both systolic and diastolic readings",
        )),
        _ => Ok(()),
    }
}

#[derive(Clone)]
pub struct AntenatalService {
    store: Arc<KiaStore>,
}

impl AntenatalService {
    pub fn new(store: Arc<KiaStore>) -> Self {
        Self { store }
    }

    /// Appends a visit to an open pregnancy.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the pregnancy does not exist.
    /// - `InvalidState` if it is closed.
    /// - `Validation` for a non-positive visit number, a visit date before the LMP or after today,
    ///   non-positive measurements, systolic not above diastolic, or a correction without a note.
    /// - `Conflict` if the visit number is already used, unless this visit supersedes that one.
    pub fn add_visit(
        &self,
        ctx: &RequestContext,
        pregnancy_id: &ShardableUuid,
        new: NewVisit,
    ) -> KiaResult<AntenatalVisit> {
        let mother_id = self
            .store
            .read()
            .pregnancy(ctx.tenant(), pregnancy_id)?
            .resident_id;

        let lock = self.store.entity_lock(mother_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let tables = self.store.read();
        let pregnancy = tables.pregnancy(ctx.tenant(), pregnancy_id)?;
        if !pregnancy.is_open() {
            return Err(KiaError::invalid_state(format!(
                "pregnancy {} is closed; no further visits can be recorded",
                pregnancy_id
            )));
        }

        let visit_number = match u32::try_from(new.visit_number) {
            Ok(n) if n > 0 => n,
            _ => {
                return Err(KiaError::validation(format!(
                    "visit_number must be positive, got {}",
                    new.visit_number
                )))
            }
        };
        if new.visit_date < pregnancy.lmp_date {
            return Err(KiaError::validation(format!(
                "visit_date {} precedes lmp_date {}",
                new.visit_date, pregnancy.lmp_date
            )));
        }
        if new.visit_date > ctx.today() {
            return Err(KiaError::validation(format!(
                "visit_date {} is in the future",
                new.visit_date
            )));
        }
        validate_measurements(&new)?;

        let note = clean_note(new.note);
        let existing = tables.visits.get(pregnancy_id).map(Vec::as_slice).unwrap_or(&[]);

        let superseded = match new.supersedes {
            Some(id) => {
                let Some(target) = existing.iter().find(|v| v.id == id) else {
                    return Err(KiaError::validation(format!(
                        "superseded visit {} does not belong to pregnancy {}",
                        id, pregnancy_id
                    )));
                };
                if note.is_none() {
                    return Err(KiaError::validation(
                        "a correcting visit must carry a note explaining the correction",
                    ));
                }
                Some(target)
            }
            None => None,
        };

        let number_taken = existing.iter().any(|v| v.visit_number == visit_number);
        if number_taken && superseded.is_none_or(|s| s.visit_number != visit_number) {
            return Err(KiaError::conflict(format!(
                "pregnancy {} already has visit number {}",
                pregnancy_id, visit_number
            )));
        }
        drop(tables);

        let visit = AntenatalVisit {
            id: ShardableUuid::new(),
            pregnancy_id: *pregnancy_id,
            visit_number,
            visit_date: new.visit_date,
            weight_kg: new.weight_kg,
            blood_pressure_sys: new.blood_pressure_sys,
            blood_pressure_dia: new.blood_pressure_dia,
            fundal_height_cm: new.fundal_height_cm,
            fetal_heart_rate: new.fetal_heart_rate,
            complaint: clean_note(new.complaint),
            action_taken: clean_note(new.action_taken),
            note,
            supersedes: new.supersedes,
            worker_id: ctx.worker().id.to_string(),
            worker_name: ctx.worker().name.to_string(),
            created_at: ctx.received_at(),
        };

        self.store
            .persist(ctx.tenant(), RecordKind::Visits, &visit.id, &visit)?;
        self.store
            .write()
            .visits
            .entry(visit.pregnancy_id)
            .or_default()
            .push(visit.clone());

        self.store.publish(
            ctx,
            EventAction::EntityCreated,
            EntityKind::AntenatalVisit,
            visit.id,
        );
        tracing::info!(
            "recorded visit {} (#{}) for pregnancy {}",
            visit.id,
            visit.visit_number,
            visit.pregnancy_id
        );

        Ok(visit)
    }

    /// Visits of a pregnancy, most recent `visit_date` first.
    ///
    /// Visits on the same date are ordered by descending visit number, then by recording time, so a
    /// correction appears before the visit it supersedes.
    pub fn list_visits(
        &self,
        ctx: &RequestContext,
        pregnancy_id: &ShardableUuid,
    ) -> KiaResult<Vec<AntenatalVisit>> {
        let tables = self.store.read();
        tables.pregnancy(ctx.tenant(), pregnancy_id)?;

        let mut visits = tables.visits.get(pregnancy_id).cloned().unwrap_or_default();
        visits.sort_by(|a, b| {
            b.visit_date
                .cmp(&a.visit_date)
                .then_with(|| b.visit_number.cmp(&a.visit_number))
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(visits)
    }

    /// One page of [`AntenatalService::list_visits`], filtered by the search text.
    pub fn page_visits(
        &self,
        ctx: &RequestContext,
        pregnancy_id: &ShardableUuid,
        page: &PageRequest,
    ) -> KiaResult<Page<AntenatalVisit>> {
        let visits = self
            .list_visits(ctx, pregnancy_id)?
            .into_iter()
            .filter(|v| page.search().is_none_or(|s| v.matches_search(s)))
            .collect();
        Ok(page.paginate(visits))
    }
}
