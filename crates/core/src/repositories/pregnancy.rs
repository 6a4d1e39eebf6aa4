//! Pregnancy tracker.
//!
//! The pregnancy is the root of the maternal lifecycle. It is opened by a kader after resolving the
//! mother in the resident directory, re-assessed for risk over its course, and closed exactly once,
//! by the delivery recorder. A closed pregnancy is read-only.
//!
//! Gestational age and trimester are never stored; they are derived from `lmp_date` and the
//! request date on every read.

use crate::constants::MAX_GESTATION_WEEKS;
use crate::context::{RequestContext, TenantId};
use crate::dates::{estimated_due_date, gestational_age_weeks, Trimester};
use crate::events::{EntityKind, EventAction};
use crate::journal::RecordKind;
use crate::pagination::{Page, PageRequest};
use crate::residents::Resident;
use crate::store::KiaStore;
use crate::validation::{clean_note, code_key};
use crate::{KiaError, KiaResult};
use chrono::{DateTime, NaiveDate, Utc};
use kia_types::Sex;
use kia_uuid::ShardableUuid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RiskStatus {
    Low,
    High,
    VeryHigh,
}

impl RiskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskStatus::Low => "Low",
            RiskStatus::High => "High",
            RiskStatus::VeryHigh => "VeryHigh",
        }
    }
}

impl fmt::Display for RiskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskStatus {
    type Err = KiaError;

    /// Accepts the English names in any case, with or without separators, and the
    /// posyandu terms `rendah`, `tinggi` and `sangat tinggi`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match code_key(s).as_str() {
            "low" | "rendah" => Ok(RiskStatus::Low),
            "high" | "tinggi" => Ok(RiskStatus::High),
            "veryhigh" | "sangattinggi" => Ok(RiskStatus::VeryHigh),
            _ => Err(KiaError::validation(format!("unknown risk status '{}'", s))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PregnancyState {
    Open,
    Closed,
}

impl FromStr for PregnancyState {
    type Err = KiaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match code_key(s).as_str() {
            "open" | "aktif" => Ok(PregnancyState::Open),
            "closed" | "selesai" => Ok(PregnancyState::Closed),
            _ => Err(KiaError::validation(format!("unknown pregnancy state '{}'", s))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pregnancy {
    pub id: ShardableUuid,
    pub tenant: TenantId,
    pub resident_id: ShardableUuid,
    pub lmp_date: NaiveDate,
    pub gravida: u32,
    pub parity: u32,
    pub prior_abortions: u32,
    pub risk_status: RiskStatus,
    pub risk_factors: BTreeSet<String>,
    pub free_note: Option<String>,
    pub state: PregnancyState,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

impl Pregnancy {
    pub fn is_open(&self) -> bool {
        self.state == PregnancyState::Open
    }

    pub fn gestational_age_weeks(&self, today: NaiveDate) -> i64 {
        gestational_age_weeks(self.lmp_date, today)
    }

    pub fn trimester(&self, today: NaiveDate) -> Trimester {
        Trimester::from_weeks(self.gestational_age_weeks(today))
    }

    pub fn estimated_due_date(&self) -> NaiveDate {
        estimated_due_date(self.lmp_date)
    }
}

/// Input for [`PregnancyService::open_pregnancy`].
#[derive(Clone, Debug)]
pub struct NewPregnancy {
    pub resident_id: ShardableUuid,
    pub lmp_date: NaiveDate,
    pub gravida: u32,
    pub parity: u32,
    pub prior_abortions: u32,
    pub risk_status: RiskStatus,
    pub risk_factors: Vec<String>,
    pub free_note: Option<String>,
}

/// Input for [`PregnancyService::update_risk`].
#[derive(Clone, Debug)]
pub struct RiskAssessment {
    pub risk_status: RiskStatus,
    pub risk_factors: Vec<String>,
    pub note: Option<String>,
}

/// A pregnancy with its derived values as of the request date.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PregnancyView {
    pub pregnancy: Pregnancy,
    pub gestational_age_weeks: i64,
    pub trimester: Trimester,
    pub estimated_due_date: NaiveDate,
}

impl PregnancyView {
    pub fn new(pregnancy: Pregnancy, today: NaiveDate) -> Self {
        Self {
            gestational_age_weeks: pregnancy.gestational_age_weeks(today),
            trimester: pregnancy.trimester(today),
            estimated_due_date: pregnancy.estimated_due_date(),
            pregnancy,
        }
    }
}

/// A list entry: the pregnancy, its mother and how many antenatal visits it has.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PregnancyListEntry {
    pub view: PregnancyView,
    pub mother: Resident,
    pub visit_count: usize,
}

#[derive(Clone, Debug, Default)]
pub struct PregnancyFilter {
    pub state: Option<PregnancyState>,
    pub risk_status: Option<RiskStatus>,
    pub sub_village: Option<String>,
}

fn normalise_risk_factors(factors: Vec<String>) -> BTreeSet<String> {
    factors
        .into_iter()
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect()
}

#[derive(Clone)]
pub struct PregnancyService {
    store: Arc<KiaStore>,
}

impl PregnancyService {
    pub fn new(store: Arc<KiaStore>) -> Self {
        Self { store }
    }

    /// Opens a pregnancy for a resident.
    ///
    /// The risk classification is the worker's judgement and is stored as supplied.
    ///
    /// # Errors
    ///
    /// - `NotFound` if `resident_id` does not resolve in the resident directory.
    /// - `Validation` for an impossible obstetric history (gravida 0, or parity plus prior
    ///   abortions not below gravida), an LMP in the future or too far in the past, or a resident
    ///   who is not female.
    /// - `Conflict` if the resident already has an open pregnancy.
    pub fn open_pregnancy(
        &self,
        ctx: &RequestContext,
        new: NewPregnancy,
    ) -> KiaResult<PregnancyView> {
        let today = ctx.today();

        if new.gravida == 0 {
            return Err(KiaError::validation("gravida must be at least 1"));
        }
        if new.parity.saturating_add(new.prior_abortions) >= new.gravida {
            return Err(KiaError::validation(format!(
                "parity ({}) plus prior abortions ({}) must be less than gravida ({})",
                new.parity, new.prior_abortions, new.gravida
            )));
        }
        if new.lmp_date > today {
            return Err(KiaError::validation(format!(
                "lmp_date {} is in the future",
                new.lmp_date
            )));
        }
        let weeks = gestational_age_weeks(new.lmp_date, today);
        if weeks > MAX_GESTATION_WEEKS {
            return Err(KiaError::validation(format!(
                "lmp_date {} gives {} weeks of gestation, more than {}",
                new.lmp_date, weeks, MAX_GESTATION_WEEKS
            )));
        }

        let mother = self.store.residents().get(ctx, &new.resident_id)?;
        if mother.sex != Sex::Female {
            return Err(KiaError::validation(format!(
                "resident {} is not female",
                mother.id
            )));
        }

        let lock = self.store.entity_lock(mother.id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = self.store.read().open_pregnancy_for(ctx.tenant(), &mother.id) {
            return Err(KiaError::conflict(format!(
                "resident {} already has open pregnancy {}",
                mother.id, existing.id
            )));
        }

        let pregnancy = Pregnancy {
            id: ShardableUuid::new(),
            tenant: ctx.tenant().clone(),
            resident_id: mother.id,
            lmp_date: new.lmp_date,
            gravida: new.gravida,
            parity: new.parity,
            prior_abortions: new.prior_abortions,
            risk_status: new.risk_status,
            risk_factors: normalise_risk_factors(new.risk_factors),
            free_note: clean_note(new.free_note),
            state: PregnancyState::Open,
            created_at: ctx.received_at(),
            created_by: ctx.worker().id.to_string(),
            updated_at: None,
            closed_at: None,
        };

        self.store
            .persist(ctx.tenant(), RecordKind::Pregnancies, &pregnancy.id, &pregnancy)?;
        self.store
            .write()
            .pregnancies
            .insert(pregnancy.id, pregnancy.clone());

        self.store.publish(
            ctx,
            EventAction::EntityCreated,
            EntityKind::Pregnancy,
            pregnancy.id,
        );
        tracing::info!(
            "opened pregnancy {} for resident {} (risk {})",
            pregnancy.id,
            pregnancy.resident_id,
            pregnancy.risk_status
        );

        Ok(PregnancyView::new(pregnancy, today))
    }

    /// Records a new risk assessment.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the pregnancy does not exist in the caller's tenant.
    /// - `InvalidState` if the pregnancy is closed.
    pub fn update_risk(
        &self,
        ctx: &RequestContext,
        pregnancy_id: &ShardableUuid,
        assessment: RiskAssessment,
    ) -> KiaResult<PregnancyView> {
        let mother_id = self
            .store
            .read()
            .pregnancy(ctx.tenant(), pregnancy_id)?
            .resident_id;

        let lock = self.store.entity_lock(mother_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut updated = self
            .store
            .read()
            .pregnancy(ctx.tenant(), pregnancy_id)?
            .clone();
        if !updated.is_open() {
            return Err(KiaError::invalid_state(format!(
                "pregnancy {} is closed",
                pregnancy_id
            )));
        }

        updated.risk_status = assessment.risk_status;
        updated.risk_factors = normalise_risk_factors(assessment.risk_factors);
        if let Some(note) = clean_note(assessment.note) {
            updated.free_note = Some(note);
        }
        updated.updated_at = Some(ctx.received_at());

        self.store
            .persist(ctx.tenant(), RecordKind::Pregnancies, &updated.id, &updated)?;
        self.store
            .write()
            .pregnancies
            .insert(updated.id, updated.clone());

        self.store.publish(
            ctx,
            EventAction::EntityUpdated,
            EntityKind::Pregnancy,
            updated.id,
        );
        tracing::info!(
            "updated risk of pregnancy {} to {}",
            updated.id,
            updated.risk_status
        );

        Ok(PregnancyView::new(updated, ctx.today()))
    }

    pub fn get(&self, ctx: &RequestContext, pregnancy_id: &ShardableUuid) -> KiaResult<PregnancyView> {
        let pregnancy = self
            .store
            .read()
            .pregnancy(ctx.tenant(), pregnancy_id)?
            .clone();
        Ok(PregnancyView::new(pregnancy, ctx.today()))
    }

    /// The resident's open pregnancy, if any.
    pub fn open_for_resident(
        &self,
        ctx: &RequestContext,
        resident_id: &ShardableUuid,
    ) -> Option<PregnancyView> {
        self.store
            .read()
            .open_pregnancy_for(ctx.tenant(), resident_id)
            .cloned()
            .map(|p| PregnancyView::new(p, ctx.today()))
    }

    /// Lists pregnancies, newest first, matching `filter` and the page's search text
    /// (mother name or NIK).
    pub fn list_pregnancies(
        &self,
        ctx: &RequestContext,
        filter: &PregnancyFilter,
        page: &PageRequest,
    ) -> KiaResult<Page<PregnancyListEntry>> {
        let tables = self.store.read();

        let mut entries = Vec::new();
        for pregnancy in tables.pregnancies.values() {
            if &pregnancy.tenant != ctx.tenant()
                || filter.state.is_some_and(|s| s != pregnancy.state)
                || filter.risk_status.is_some_and(|r| r != pregnancy.risk_status)
            {
                continue;
            }

            let mother = match self.store.residents().get(ctx, &pregnancy.resident_id) {
                Ok(mother) => mother,
                Err(KiaError::NotFound { .. }) => {
                    tracing::warn!(
                        "pregnancy {} references unknown resident {}",
                        pregnancy.id,
                        pregnancy.resident_id
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            if filter
                .sub_village
                .as_deref()
                .is_some_and(|sv| !mother.in_sub_village(sv))
            {
                continue;
            }
            if page.search().is_some_and(|s| !mother.matches_search(s)) {
                continue;
            }

            entries.push(PregnancyListEntry {
                visit_count: tables.visits.get(&pregnancy.id).map_or(0, Vec::len),
                view: PregnancyView::new(pregnancy.clone(), ctx.today()),
                mother,
            });
        }

        entries.sort_by(|a, b| {
            b.view
                .pregnancy
                .created_at
                .cmp(&a.view.pregnancy.created_at)
                .then_with(|| a.view.pregnancy.id.cmp(&b.view.pregnancy.id))
        });

        Ok(page.paginate(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;

    #[test]
    fn test_open_pregnancy_derives_trimester_on_read() {
        let fx = fixture();
        let mother = register_mother(&fx, "3201010101950001", "Siti Aminah");
        let pregnancies = PregnancyService::new(fx.store.clone());

        let opened = pregnancies
            .open_pregnancy(
                &ctx_on(date(2024, 3, 1)),
                new_pregnancy(mother.id, date(2024, 1, 1)),
            )
            .expect("open should succeed");
        assert_eq!(opened.trimester, Trimester::First);

        let later = pregnancies
            .get(&ctx_on(date(2024, 9, 1)), &opened.pregnancy.id)
            .expect("get should succeed");
        assert_eq!(later.gestational_age_weeks, 34);
        assert_eq!(later.trimester.number(), 3);
        assert_eq!(later.estimated_due_date, date(2024, 10, 7));
    }

    #[test]
    fn test_open_pregnancy_rejects_second_open_pregnancy() {
        let fx = fixture();
        let mother = register_mother(&fx, "3201010101950001", "Siti Aminah");
        let pregnancies = PregnancyService::new(fx.store.clone());
        let ctx = ctx_on(date(2024, 3, 1));

        pregnancies
            .open_pregnancy(&ctx, new_pregnancy(mother.id, date(2024, 1, 1)))
            .expect("first open should succeed");

        let err = pregnancies
            .open_pregnancy(&ctx, new_pregnancy(mother.id, date(2024, 1, 15)))
            .expect_err("second open should fail");
        assert!(matches!(err, KiaError::Conflict(_)));
    }

    #[test]
    fn test_open_pregnancy_rejects_unknown_resident() {
        let fx = fixture();
        let pregnancies = PregnancyService::new(fx.store.clone());

        let err = pregnancies
            .open_pregnancy(
                &ctx_on(date(2024, 3, 1)),
                new_pregnancy(ShardableUuid::new(), date(2024, 1, 1)),
            )
            .expect_err("unknown resident should fail");
        assert!(matches!(err, KiaError::NotFound { .. }));
    }

    #[test]
    fn test_open_pregnancy_validates_history_and_dates() {
        let fx = fixture();
        let mother = register_mother(&fx, "3201010101950001", "Siti Aminah");
        let pregnancies = PregnancyService::new(fx.store.clone());
        let ctx = ctx_on(date(2024, 3, 1));

        let mut zero_gravida = new_pregnancy(mother.id, date(2024, 1, 1));
        zero_gravida.gravida = 0;
        assert!(matches!(
            pregnancies.open_pregnancy(&ctx, zero_gravida),
            Err(KiaError::Validation(_))
        ));

        let mut impossible = new_pregnancy(mother.id, date(2024, 1, 1));
        impossible.gravida = 2;
        impossible.parity = 1;
        impossible.prior_abortions = 1;
        assert!(matches!(
            pregnancies.open_pregnancy(&ctx, impossible),
            Err(KiaError::Validation(_))
        ));

        assert!(matches!(
            pregnancies.open_pregnancy(&ctx, new_pregnancy(mother.id, date(2024, 4, 1))),
            Err(KiaError::Validation(_))
        ));
        assert!(matches!(
            pregnancies.open_pregnancy(&ctx, new_pregnancy(mother.id, date(2022, 1, 1))),
            Err(KiaError::Validation(_))
        ));
    }

    #[test]
    fn test_open_pregnancy_rejects_male_resident() {
        let fx = fixture();
        let father = register_resident(
            &fx,
            "3201010101900003",
            "Budi",
            date(1990, 1, 1),
            Sex::Male,
        );
        let pregnancies = PregnancyService::new(fx.store.clone());

        let err = pregnancies
            .open_pregnancy(&ctx_on(date(2024, 3, 1)), new_pregnancy(father.id, date(2024, 1, 1)))
            .expect_err("male resident should be rejected");
        assert!(matches!(err, KiaError::Validation(_)));
    }

    #[test]
    fn test_concurrent_open_pregnancy_admits_exactly_one() {
        let fx = fixture();
        let mother = register_mother(&fx, "3201010101950001", "Siti Aminah");
        let pregnancies = PregnancyService::new(fx.store.clone());

        let results: Vec<KiaResult<PregnancyView>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let pregnancies = pregnancies.clone();
                    let mother_id = mother.id;
                    scope.spawn(move || {
                        pregnancies.open_pregnancy(
                            &ctx_on(date(2024, 3, 1)),
                            new_pregnancy(mother_id, date(2024, 1, 1 + i)),
                        )
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("thread should not panic"))
                .collect()
        });

        let opened = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(KiaError::Conflict(_))))
            .count();
        assert_eq!(opened, 1, "exactly one open should succeed");
        assert_eq!(conflicts, 7, "every other open should conflict");

        let open_count = fx
            .store
            .read()
            .pregnancies
            .values()
            .filter(|p| p.resident_id == mother.id && p.is_open())
            .count();
        assert_eq!(open_count, 1);
    }

    #[test]
    fn test_update_risk_replaces_classification_and_emits_event() {
        let fx = fixture();
        let mother = register_mother(&fx, "3201010101950001", "Siti Aminah");
        let pregnancies = PregnancyService::new(fx.store.clone());
        let ctx = ctx_on(date(2024, 3, 1));

        let opened = pregnancies
            .open_pregnancy(&ctx, new_pregnancy(mother.id, date(2024, 1, 1)))
            .expect("open");

        let updated = pregnancies
            .update_risk(
                &ctx_on(date(2024, 4, 1)),
                &opened.pregnancy.id,
                RiskAssessment {
                    risk_status: RiskStatus::High,
                    risk_factors: vec![" hipertensi ".into(), "".into(), "anemia".into()],
                    note: Some("rujuk ke puskesmas".into()),
                },
            )
            .expect("update should succeed");

        assert_eq!(updated.pregnancy.risk_status, RiskStatus::High);
        assert_eq!(
            updated.pregnancy.risk_factors.iter().cloned().collect::<Vec<_>>(),
            vec!["anemia".to_string(), "hipertensi".to_string()]
        );
        assert_eq!(
            updated.pregnancy.free_note.as_deref(),
            Some("rujuk ke puskesmas")
        );
        assert!(updated.pregnancy.updated_at.is_some());

        let events = fx.events.for_tenant(ctx.tenant(), None);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].action, EventAction::EntityUpdated);
    }

    #[test]
    fn test_get_is_tenant_scoped() {
        let fx = fixture();
        let mother = register_mother(&fx, "3201010101950001", "Siti Aminah");
        let pregnancies = PregnancyService::new(fx.store.clone());
        let opened = pregnancies
            .open_pregnancy(&ctx_on(date(2024, 3, 1)), new_pregnancy(mother.id, date(2024, 1, 1)))
            .expect("open");

        let err = pregnancies
            .get(&other_tenant_ctx(date(2024, 3, 1)), &opened.pregnancy.id)
            .expect_err("other tenant must not see the pregnancy");
        assert!(matches!(err, KiaError::NotFound { .. }));
    }

    #[test]
    fn test_list_pregnancies_filters_and_searches() {
        let fx = fixture();
        let siti = register_mother(&fx, "3201010101950001", "Siti Aminah");
        let dewi = register_mother(&fx, "3201010101900002", "Dewi Lestari");
        let pregnancies = PregnancyService::new(fx.store.clone());
        let ctx = ctx_on(date(2024, 3, 1));

        pregnancies
            .open_pregnancy(&ctx, new_pregnancy(siti.id, date(2024, 1, 1)))
            .expect("open siti");
        let mut high = new_pregnancy(dewi.id, date(2023, 11, 1));
        high.risk_status = RiskStatus::VeryHigh;
        pregnancies.open_pregnancy(&ctx, high).expect("open dewi");

        let all = pregnancies
            .list_pregnancies(&ctx, &PregnancyFilter::default(), &PageRequest::all())
            .expect("list");
        assert_eq!(all.total, 2);

        let very_high = pregnancies
            .list_pregnancies(
                &ctx,
                &PregnancyFilter {
                    risk_status: Some(RiskStatus::VeryHigh),
                    ..Default::default()
                },
                &PageRequest::all(),
            )
            .expect("list");
        assert_eq!(very_high.total, 1);
        assert_eq!(very_high.items[0].mother.name.as_str(), "Dewi Lestari");
        assert_eq!(very_high.items[0].view.trimester, Trimester::Second);

        let searched = pregnancies
            .list_pregnancies(
                &ctx,
                &PregnancyFilter::default(),
                &PageRequest::all().with_search("aminah"),
            )
            .expect("list");
        assert_eq!(searched.total, 1);
        assert_eq!(searched.items[0].mother.id, siti.id);
    }

    #[test]
    fn test_risk_status_parses_local_terms() {
        assert_eq!("tinggi".parse::<RiskStatus>().expect("parse"), RiskStatus::High);
        assert_eq!(
            "Sangat Tinggi".parse::<RiskStatus>().expect("parse"),
            RiskStatus::VeryHigh
        );
        assert_eq!("very_high".parse::<RiskStatus>().expect("parse"), RiskStatus::VeryHigh);
        assert!("medium".parse::<RiskStatus>().is_err());
    }
}
