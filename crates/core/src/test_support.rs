//! Fixtures shared by the repository tests.

use crate::config::CoreConfig;
use crate::context::{RequestContext, TenantId, WorkerRef};
use crate::events::MemoryEventLog;
use crate::journal::YamlJournal;
use crate::repositories::delivery::{
    AttendantType, DeliveryType, InfantCondition, MaternalCondition, NewDelivery,
};
use crate::repositories::immunization::{DoseStatus, NewDose, VaccineCode};
use crate::repositories::pregnancy::{NewPregnancy, RiskStatus};
use crate::residents::{LocalResidentDirectory, NewResident, Resident};
use crate::store::KiaStore;
use chrono::NaiveDate;
use kia_types::{Nik, NonEmptyText, Sex};
use kia_uuid::ShardableUuid;
use std::path::Path;
use std::sync::Arc;

pub(crate) const TENANT: &str = "posyandu-melati";

pub(crate) struct Fixture {
    pub(crate) store: Arc<KiaStore>,
    pub(crate) directory: Arc<LocalResidentDirectory>,
    pub(crate) events: Arc<MemoryEventLog>,
}

pub(crate) fn fixture() -> Fixture {
    let directory = Arc::new(LocalResidentDirectory::in_memory());
    let events = Arc::new(MemoryEventLog::new());
    let store = KiaStore::open(
        Arc::new(CoreConfig::default()),
        directory.clone(),
        events.clone(),
    )
    .expect("in-memory store should open");
    Fixture {
        store,
        directory,
        events,
    }
}

/// A store and directory both journaled under `data_dir`.
pub(crate) fn journaled_fixture(data_dir: &Path) -> Fixture {
    let directory = Arc::new(
        LocalResidentDirectory::open(YamlJournal::new(data_dir)).expect("directory should open"),
    );
    let events = Arc::new(MemoryEventLog::new());
    let cfg = CoreConfig::new(Some(data_dir.to_path_buf()), 9, 18).expect("config");
    let store =
        KiaStore::open(Arc::new(cfg), directory.clone(), events.clone()).expect("store should open");
    Fixture {
        store,
        directory,
        events,
    }
}

pub(crate) fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

pub(crate) fn ctx_on(today: NaiveDate) -> RequestContext {
    RequestContext::on(
        TenantId::parse(TENANT).expect("tenant"),
        WorkerRef::new("k-01", "Bu Sri").expect("worker"),
        today,
    )
}

pub(crate) fn other_tenant_ctx(today: NaiveDate) -> RequestContext {
    RequestContext::on(
        TenantId::parse("posyandu-mawar").expect("tenant"),
        WorkerRef::new("k-07", "Bu Ani").expect("worker"),
        today,
    )
}

pub(crate) fn register_resident(
    fx: &Fixture,
    nik: &str,
    name: &str,
    birth_date: NaiveDate,
    sex: Sex,
) -> Resident {
    fx.directory
        .register(
            &ctx_on(date(2024, 1, 1)),
            NewResident {
                nik: Nik::parse(nik).expect("nik"),
                name: NonEmptyText::new(name).expect("name"),
                birth_date,
                sex,
                address: Some("Jl. Melati 3".into()),
                sub_village: Some("Dusun Krajan".into()),
            },
        )
        .expect("register should succeed")
}

pub(crate) fn register_mother(fx: &Fixture, nik: &str, name: &str) -> Resident {
    register_resident(fx, nik, name, date(1995, 4, 12), Sex::Female)
}

pub(crate) fn register_child(fx: &Fixture, nik: &str, name: &str, birth_date: NaiveDate) -> Resident {
    register_resident(fx, nik, name, birth_date, Sex::Male)
}

pub(crate) fn new_pregnancy(resident_id: ShardableUuid, lmp_date: NaiveDate) -> NewPregnancy {
    NewPregnancy {
        resident_id,
        lmp_date,
        gravida: 2,
        parity: 1,
        prior_abortions: 0,
        risk_status: RiskStatus::Low,
        risk_factors: Vec::new(),
        free_note: None,
    }
}

pub(crate) fn new_delivery(delivery_date: NaiveDate, birth_weight_g: u32) -> NewDelivery {
    NewDelivery {
        delivery_date,
        place: "Puskesmas Sukamaju".into(),
        delivery_type: DeliveryType::Spontaneous,
        attendant_type: AttendantType::Midwife,
        attendant_name: "Bidan Rina".into(),
        maternal_condition: MaternalCondition::Good,
        maternal_complication_note: None,
        infant_condition: InfantCondition::HealthyAlive,
        birth_weight_g,
        birth_length_cm: 49.0,
        infant_sex: Sex::Female,
        infant_name: None,
        note: None,
    }
}

pub(crate) fn given(vaccine: VaccineCode, given_date: NaiveDate) -> NewDose {
    NewDose {
        vaccine,
        given_date,
        status: DoseStatus::Given,
        posyandu_site: Some("Posyandu Melati".into()),
        administration_site: Some("paha kiri".into()),
        vaccine_batch: Some("B-2024-01".into()),
        note: None,
    }
}
