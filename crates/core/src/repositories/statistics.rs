//! Aggregate statistics.
//!
//! Every figure is recomputed from the stored records on each call; there are no counters to
//! drift.

use crate::context::RequestContext;
use crate::dates::{Period, Trimester};
use crate::repositories::immunization::{population, DoseStatus, ImmunizationStatus};
use crate::repositories::pregnancy::RiskStatus;
use crate::residents::Resident;
use crate::store::KiaStore;
use crate::KiaResult;
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;

/// Immunization coverage over a period.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Coverage {
    pub period: Period,
    /// Date the target population and completeness were evaluated on.
    pub as_of: NaiveDate,
    /// `Given` dose records dated within the period.
    pub doses_given: usize,
    pub target_population: usize,
    pub idl_count: usize,
    pub idl_percentage: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TrimesterCounts {
    pub first: usize,
    pub second: usize,
    pub third: usize,
}

/// Dashboard figures as of the request date.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub as_of: NaiveDate,
    pub open_pregnancies: usize,
    pub by_trimester: TrimesterCounts,
    pub high_risk: usize,
    pub very_high_risk: usize,
    pub deliveries_this_month: usize,
    pub visits_this_month: usize,
    pub target_population: usize,
    pub idl_count: usize,
    pub idl_percentage: u32,
}

/// `round(100 * part / whole)`, halves rounded up; zero when `whole` is zero.
pub fn percentage(part: usize, whole: usize) -> u32 {
    if whole == 0 {
        return 0;
    }
    let rounded = (200 * part as u64 + whole as u64) / (2 * whole as u64);
    u32::try_from(rounded).unwrap_or(u32::MAX)
}

fn idl_figures(children: &[(Resident, ImmunizationStatus)]) -> (usize, usize, u32) {
    let target = children.len();
    let complete = children.iter().filter(|(_, s)| s.is_complete).count();
    (target, complete, percentage(complete, target))
}

#[derive(Clone)]
pub struct StatisticsService {
    store: Arc<KiaStore>,
}

impl StatisticsService {
    pub fn new(store: Arc<KiaStore>) -> Self {
        Self { store }
    }

    /// Coverage for `period`.
    ///
    /// The target population and IDL count are evaluated on the last day of the period, or on the
    /// request date if the period has not ended yet.
    pub fn coverage(&self, ctx: &RequestContext, period: Period) -> KiaResult<Coverage> {
        let as_of = period.end().min(ctx.today());
        let tables = self.store.read();

        let doses_given = tables
            .immunizations
            .values()
            .flatten()
            .filter(|r| {
                &r.tenant == ctx.tenant()
                    && r.status == DoseStatus::Given
                    && period.contains(r.given_date)
            })
            .count();

        let children = population(
            &self.store,
            &tables,
            ctx,
            as_of,
            0,
            self.store.cfg().target_max_age_months(),
        )?;
        let (target_population, idl_count, idl_percentage) = idl_figures(&children);

        tracing::debug!(
            "coverage {}..{}: {} doses, {}/{} complete",
            period.start(),
            period.end(),
            doses_given,
            idl_count,
            target_population
        );

        Ok(Coverage {
            period,
            as_of,
            doses_given,
            target_population,
            idl_count,
            idl_percentage,
        })
    }

    pub fn summary(&self, ctx: &RequestContext) -> KiaResult<Summary> {
        let today = ctx.today();
        let month = Period::month_of(today);
        let tables = self.store.read();

        let open: Vec<_> = tables
            .pregnancies
            .values()
            .filter(|p| &p.tenant == ctx.tenant() && p.is_open())
            .collect();

        let mut by_trimester = TrimesterCounts {
            first: 0,
            second: 0,
            third: 0,
        };
        for pregnancy in &open {
            match pregnancy.trimester(today) {
                Trimester::First => by_trimester.first += 1,
                Trimester::Second => by_trimester.second += 1,
                Trimester::Third => by_trimester.third += 1,
            }
        }

        let deliveries_this_month = tables
            .deliveries
            .values()
            .filter(|d| &d.tenant == ctx.tenant() && month.contains(d.delivery_date))
            .count();

        let visits_this_month = tables
            .visits
            .iter()
            .filter(|(pregnancy_id, _)| {
                tables
                    .pregnancies
                    .get(*pregnancy_id)
                    .is_some_and(|p| &p.tenant == ctx.tenant())
            })
            .flat_map(|(_, visits)| visits)
            .filter(|v| month.contains(v.visit_date))
            .count();

        let children = population(
            &self.store,
            &tables,
            ctx,
            today,
            0,
            self.store.cfg().target_max_age_months(),
        )?;
        let (target_population, idl_count, idl_percentage) = idl_figures(&children);

        Ok(Summary {
            as_of: today,
            open_pregnancies: open.len(),
            high_risk: open
                .iter()
                .filter(|p| p.risk_status == RiskStatus::High)
                .count(),
            very_high_risk: open
                .iter()
                .filter(|p| p.risk_status == RiskStatus::VeryHigh)
                .count(),
            by_trimester,
            deliveries_this_month,
            visits_this_month,
            target_population,
            idl_count,
            idl_percentage,
        })
    }
}


#[cfg(test)]
mod proptest_tests {
    use super::*;
    use crate::dates::age_in_months;
    use crate::repositories::immunization::{compute_status, ImmunizationService, VaccineCode};
    use crate::test_support::*;
    use chrono::Days;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// Coverage for any period equals a from-scratch count over the stored records.
        #[test]
        fn test_coverage_matches_recount_for_any_period(
            births in proptest::collection::vec(0u64..900, 1..5),
            doses in proptest::collection::vec(
                (0usize..5, 0..VaccineCode::ALL.len(), 0u64..400),
                0..30
            ),
            start_day in 0u64..900,
            length in 0u64..400,
        ) {
            let origin = date(2023, 1, 1);
            let today = date(2025, 9, 1);
            let fx = fixture();
            let children: Vec<Resident> = births
                .iter()
                .enumerate()
                .map(|(i, day)| {
                    register_child(
                        &fx,
                        &format!("32010101012400{:02}", i),
                        &format!("Anak {}", i),
                        origin + Days::new(*day),
                    )
                })
                .collect();
            let service = ImmunizationService::new(fx.store.clone());
            let ctx = ctx_on(today);
            for (who, code, day) in doses {
                let child = &children[who % children.len()];
                let dose = given(VaccineCode::ALL[code], child.birth_date + Days::new(day));
                let _ = service.record_dose(&ctx, &child.id, dose);
            }

            let start = origin + Days::new(start_day);
            let period = Period::new(start, start + Days::new(length)).expect("period");
            let stats = StatisticsService::new(fx.store.clone());
            let reported = stats.coverage(&ctx, period).expect("coverage");
            prop_assert_eq!(&reported, &stats.coverage(&ctx, period).expect("coverage again"));

            let as_of = period.end().min(today);
            let records: Vec<_> = fx
                .store
                .read()
                .immunizations
                .values()
                .flatten()
                .cloned()
                .collect();
            let doses_given = records
                .iter()
                .filter(|r| r.status == DoseStatus::Given && period.contains(r.given_date))
                .count();
            let targets: Vec<&Resident> = children
                .iter()
                .filter(|c| c.birth_date <= as_of)
                .filter(|c| (0..=18).contains(&age_in_months(c.birth_date, as_of)))
                .collect();
            let complete = targets
                .iter()
                .filter(|child| {
                    let own: Vec<_> = records
                        .iter()
                        .filter(|r| r.child_resident_id == child.id)
                        .cloned()
                        .collect();
                    compute_status(child, &own, as_of, 9).is_complete
                })
                .count();

            prop_assert_eq!(reported.as_of, as_of);
            prop_assert_eq!(reported.doses_given, doses_given);
            prop_assert_eq!(reported.target_population, targets.len());
            prop_assert_eq!(reported.idl_count, complete);
            prop_assert_eq!(reported.idl_percentage, percentage(complete, targets.len()));
        }
    }
}
