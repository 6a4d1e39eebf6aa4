//! # KIA Core
//!
//! Core business logic for the maternal-and-child health (KIA) lifecycle engine.
//!
//! This crate contains the domain operations and their storage:
//! - Pregnancy tracking, antenatal visits and delivery recording
//! - Infant immunization records and the IDL completeness rule
//! - Coverage and dashboard statistics recomputed from the records
//! - An optional sharded YAML journal under a configured data directory
//!
//! **No API concerns**: HTTP servers and wire formats belong in `api-rest` and `api-shared`.

pub mod config;
pub mod constants;
pub mod context;
pub mod dates;
pub mod error;
pub mod events;
pub mod journal;
pub mod pagination;
pub mod repositories;
pub mod residents;
pub mod store;
pub mod validation;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::CoreConfig;
pub use context::{RequestContext, TenantId, WorkerRef};
pub use dates::{Period, Trimester};
pub use error::{ErrorKind, KiaError, KiaResult};
pub use events::{EventSink, FanOut, MemoryEventLog, TracingEventSink, WorkerEvent};
pub use pagination::{Page, PageRequest};
pub use residents::{LocalResidentDirectory, Resident, ResidentDirectory};
pub use store::{KiaStore, ResidentView};

pub use kia_types::{Nik, NonEmptyText, Sex};
pub use kia_uuid::ShardableUuid;

use repositories::antenatal::AntenatalService;
use repositories::delivery::DeliveryService;
use repositories::immunization::ImmunizationService;
use repositories::pregnancy::PregnancyService;
use repositories::statistics::StatisticsService;
use std::sync::Arc;

/// All lifecycle services over one shared store.
#[derive(Clone)]
pub struct KiaEngine {
    store: Arc<KiaStore>,
    pregnancies: PregnancyService,
    antenatal: AntenatalService,
    deliveries: DeliveryService,
    immunizations: ImmunizationService,
    statistics: StatisticsService,
}

impl KiaEngine {
    /// Opens the store (replaying the journal if `cfg` names a data directory) and wires the
    /// services to it.
    pub fn open(
        cfg: Arc<CoreConfig>,
        residents: Arc<dyn ResidentDirectory>,
        events: Arc<dyn EventSink>,
    ) -> KiaResult<Self> {
        let store = KiaStore::open(cfg, residents, events)?;
        Ok(Self::from_store(store))
    }

    pub fn from_store(store: Arc<KiaStore>) -> Self {
        Self {
            pregnancies: PregnancyService::new(store.clone()),
            antenatal: AntenatalService::new(store.clone()),
            deliveries: DeliveryService::new(store.clone()),
            immunizations: ImmunizationService::new(store.clone()),
            statistics: StatisticsService::new(store.clone()),
            store,
        }
    }

    pub fn cfg(&self) -> &CoreConfig {
        self.store.cfg()
    }

    /// Resident lookups. These wait for an in-flight delivery, so a newborn is visible only
    /// together with its mother's closed pregnancy.
    pub fn residents(&self) -> ResidentView<'_> {
        self.store.resident_view()
    }

    pub fn pregnancies(&self) -> &PregnancyService {
        &self.pregnancies
    }

    pub fn antenatal(&self) -> &AntenatalService {
        &self.antenatal
    }

    pub fn deliveries(&self) -> &DeliveryService {
        &self.deliveries
    }

    pub fn immunizations(&self) -> &ImmunizationService {
        &self.immunizations
    }

    pub fn statistics(&self) -> &StatisticsService {
        &self.statistics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EntityKind;
    use crate::journal::YamlJournal;
    use crate::repositories::immunization::VaccineCode;
    use crate::test_support::*;
    use tempfile::TempDir;

    #[test]
    fn test_engine_runs_full_lifecycle() {
        let fx = fixture();
        let engine = KiaEngine::from_store(fx.store.clone());
        let mother = register_mother(&fx, "3201010101950001", "Siti Aminah");

        let nik = Nik::parse("3201010101950001").expect("nik");
        let resolved = engine
            .residents()
            .resolve_by_identifier(&ctx_on(date(2024, 3, 1)), &nik)
            .expect("resolve");
        assert_eq!(resolved.id, mother.id);

        let pregnancy = engine
            .pregnancies()
            .open_pregnancy(&ctx_on(date(2024, 3, 1)), new_pregnancy(mother.id, date(2024, 1, 1)))
            .expect("open");
        let outcome = engine
            .deliveries()
            .record_delivery(
                &ctx_on(date(2024, 10, 6)),
                &pregnancy.pregnancy.id,
                new_delivery(date(2024, 10, 5), 3200),
            )
            .expect("delivery");

        let ctx = ctx_on(date(2024, 10, 6));
        engine
            .immunizations()
            .record_dose(&ctx, &outcome.child.id, given(VaccineCode::Hb0, date(2024, 10, 5)))
            .expect("HB0");
        let status = engine
            .immunizations()
            .get_status(&ctx, &outcome.child.id)
            .expect("status");
        assert!(status.doses_given.contains(&VaccineCode::Hb0));
        assert!(!status.is_complete);

        let summary = engine.statistics().summary(&ctx).expect("summary");
        assert_eq!(summary.open_pregnancies, 0);
        assert_eq!(summary.target_population, 1);
        assert_eq!(fx.events.len(), 5);
    }

    #[test]
    fn test_event_feed_survives_engine_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let ctx = ctx_on(date(2024, 10, 6));
        {
            let fx = journaled_fixture(dir.path());
            let mother = register_mother(&fx, "3201010101950001", "Siti Aminah");
            let log = Arc::new(
                MemoryEventLog::open(YamlJournal::new(dir.path()), 100).expect("event log"),
            );
            let cfg = CoreConfig::new(Some(dir.path().to_path_buf()), 9, 18).expect("config");
            let engine =
                KiaEngine::open(Arc::new(cfg), fx.directory.clone(), log).expect("engine");
            let pregnancy = engine
                .pregnancies()
                .open_pregnancy(&ctx_on(date(2024, 3, 1)), new_pregnancy(mother.id, date(2024, 1, 1)))
                .expect("open");
            engine
                .deliveries()
                .record_delivery(&ctx, &pregnancy.pregnancy.id, new_delivery(date(2024, 10, 5), 3200))
                .expect("delivery");
        }

        let reopened =
            MemoryEventLog::open(YamlJournal::new(dir.path()), 100).expect("reopen event log");
        let entities: Vec<EntityKind> = reopened
            .for_tenant(ctx.tenant(), None)
            .iter()
            .map(|e| e.entity)
            .collect();
        assert_eq!(
            entities,
            vec![
                EntityKind::Pregnancy,
                EntityKind::Delivery,
                EntityKind::Pregnancy,
                EntityKind::Resident
            ]
        );

        let fx = journaled_fixture(dir.path());
        assert_eq!(fx.store.read().pregnancies.len(), 1, "events do not disturb replay");
    }
}
