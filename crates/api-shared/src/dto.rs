//! Request and response bodies.
//!
//! Dates travel as `YYYY-MM-DD` strings and instants as RFC 3339 strings. Enumerated values travel
//! as their names (`"High"`, `"CSection"`, `"DPTHBHib1"`) and are parsed by the core's `FromStr`
//! implementations, so an unknown code is a validation error rather than a silent mismatch.

use kia_core::repositories::antenatal::AntenatalVisit;
use kia_core::repositories::delivery::{Delivery, DeliveryOutcome};
use kia_core::repositories::immunization::{ImmunizationRecord, ImmunizationStatus, TargetEntry};
use kia_core::repositories::pregnancy::{PregnancyListEntry, PregnancyView};
use kia_core::repositories::statistics::{Coverage, Summary};
use kia_core::{Resident, WorkerEvent};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

fn day(date: chrono::NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ResidentRes {
    pub id: String,
    pub nik: Option<String>,
    pub name: String,
    pub birth_date: String,
    pub sex: String,
    pub address: Option<String>,
    pub sub_village: Option<String>,
    pub mother_id: Option<String>,
}

impl From<&Resident> for ResidentRes {
    fn from(r: &Resident) -> Self {
        Self {
            id: r.id.to_string(),
            nik: r.nik.as_ref().map(|n| n.to_string()),
            name: r.name.to_string(),
            birth_date: day(r.birth_date),
            sex: r.sex.code().to_string(),
            address: r.address.clone(),
            sub_village: r.sub_village.clone(),
            mother_id: r.mother_id.map(|id| id.to_string()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct OpenPregnancyReq {
    /// NIK of the mother, resolved through the resident directory.
    pub mother_nik: String,
    pub lmp_date: String,
    pub gravida: u32,
    pub parity: u32,
    #[serde(default)]
    pub prior_abortions: u32,
    pub risk_status: String,
    #[serde(default)]
    pub risk_factors: Vec<String>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct UpdateRiskReq {
    pub risk_status: String,
    #[serde(default)]
    pub risk_factors: Vec<String>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PregnancyRes {
    pub id: String,
    pub resident_id: String,
    pub lmp_date: String,
    pub gravida: u32,
    pub parity: u32,
    pub prior_abortions: u32,
    pub risk_status: String,
    pub risk_factors: Vec<String>,
    pub note: Option<String>,
    pub state: String,
    pub gestational_age_weeks: i64,
    pub trimester: u8,
    pub estimated_due_date: String,
    pub created_at: String,
    pub closed_at: Option<String>,
}

impl From<&PregnancyView> for PregnancyRes {
    fn from(v: &PregnancyView) -> Self {
        let p = &v.pregnancy;
        Self {
            id: p.id.to_string(),
            resident_id: p.resident_id.to_string(),
            lmp_date: day(p.lmp_date),
            gravida: p.gravida,
            parity: p.parity,
            prior_abortions: p.prior_abortions,
            risk_status: p.risk_status.to_string(),
            risk_factors: p.risk_factors.iter().cloned().collect(),
            note: p.free_note.clone(),
            state: format!("{:?}", p.state),
            gestational_age_weeks: v.gestational_age_weeks,
            trimester: v.trimester.number(),
            estimated_due_date: day(v.estimated_due_date),
            created_at: p.created_at.to_rfc3339(),
            closed_at: p.closed_at.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PregnancyListItem {
    pub pregnancy: PregnancyRes,
    pub mother: ResidentRes,
    pub visit_count: usize,
}

impl From<&PregnancyListEntry> for PregnancyListItem {
    fn from(e: &PregnancyListEntry) -> Self {
        Self {
            pregnancy: PregnancyRes::from(&e.view),
            mother: ResidentRes::from(&e.mother),
            visit_count: e.visit_count,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PregnancyListQuery {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    pub search: Option<String>,
    /// `Open` or `Closed`.
    pub state: Option<String>,
    pub risk_status: Option<String>,
    pub sub_village: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct AddVisitReq {
    pub visit_number: i64,
    pub visit_date: String,
    pub weight_kg: Option<f64>,
    pub blood_pressure_sys: Option<u16>,
    pub blood_pressure_dia: Option<u16>,
    pub fundal_height_cm: Option<f64>,
    pub fetal_heart_rate: Option<u16>,
    pub complaint: Option<String>,
    pub action_taken: Option<String>,
    pub note: Option<String>,
    /// Id of the visit this one corrects.
    pub supersedes: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct VisitRes {
    pub id: String,
    pub pregnancy_id: String,
    pub visit_number: u32,
    pub visit_date: String,
    pub weight_kg: Option<f64>,
    pub blood_pressure_sys: Option<u16>,
    pub blood_pressure_dia: Option<u16>,
    pub fundal_height_cm: Option<f64>,
    pub fetal_heart_rate: Option<u16>,
    pub complaint: Option<String>,
    pub action_taken: Option<String>,
    pub note: Option<String>,
    pub supersedes: Option<String>,
    pub worker_name: String,
    pub created_at: String,
}

impl From<&AntenatalVisit> for VisitRes {
    fn from(v: &AntenatalVisit) -> Self {
        Self {
            id: v.id.to_string(),
            pregnancy_id: v.pregnancy_id.to_string(),
            visit_number: v.visit_number,
            visit_date: day(v.visit_date),
            weight_kg: v.weight_kg,
            blood_pressure_sys: v.blood_pressure_sys,
            blood_pressure_dia: v.blood_pressure_dia,
            fundal_height_cm: v.fundal_height_cm,
            fetal_heart_rate: v.fetal_heart_rate,
            complaint: v.complaint.clone(),
            action_taken: v.action_taken.clone(),
            note: v.note.clone(),
            supersedes: v.supersedes.map(|id| id.to_string()),
            worker_name: v.worker_name.clone(),
            created_at: v.created_at.to_rfc3339(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct RecordDeliveryReq {
    pub delivery_date: String,
    pub place: String,
    pub delivery_type: String,
    pub attendant_type: String,
    pub attendant_name: String,
    pub maternal_condition: String,
    #[serde(default)]
    pub maternal_complication_note: Option<String>,
    pub infant_condition: String,
    pub birth_weight_g: u32,
    pub birth_length_cm: f64,
    /// `M` or `F` (`L`/`P` accepted).
    pub infant_sex: String,
    #[serde(default)]
    pub infant_name: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DeliveryRes {
    pub id: String,
    pub pregnancy_id: String,
    pub mother_resident_id: String,
    pub child_resident_id: String,
    pub delivery_date: String,
    pub place: String,
    pub delivery_type: String,
    pub attendant_type: String,
    pub attendant_name: String,
    pub maternal_condition: String,
    pub maternal_complication_note: Option<String>,
    pub infant_condition: String,
    pub birth_weight_g: u32,
    pub birth_length_cm: f64,
    pub infant_sex: String,
    pub infant_name: String,
    pub note: Option<String>,
    pub worker_name: String,
    pub created_at: String,
}

impl From<&Delivery> for DeliveryRes {
    fn from(d: &Delivery) -> Self {
        Self {
            id: d.id.to_string(),
            pregnancy_id: d.pregnancy_id.to_string(),
            mother_resident_id: d.mother_resident_id.to_string(),
            child_resident_id: d.child_resident_id.to_string(),
            delivery_date: day(d.delivery_date),
            place: d.place.clone(),
            delivery_type: format!("{:?}", d.delivery_type),
            attendant_type: format!("{:?}", d.attendant_type),
            attendant_name: d.attendant_name.clone(),
            maternal_condition: format!("{:?}", d.maternal_condition),
            maternal_complication_note: d.maternal_complication_note.clone(),
            infant_condition: format!("{:?}", d.infant_condition),
            birth_weight_g: d.birth_weight_g,
            birth_length_cm: d.birth_length_cm,
            infant_sex: d.infant_sex.code().to_string(),
            infant_name: d.infant_name.clone(),
            note: d.note.clone(),
            worker_name: d.worker_name.clone(),
            created_at: d.created_at.to_rfc3339(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DeliveryOutcomeRes {
    pub delivery: DeliveryRes,
    pub child: ResidentRes,
}

impl From<&DeliveryOutcome> for DeliveryOutcomeRes {
    fn from(o: &DeliveryOutcome) -> Self {
        Self {
            delivery: DeliveryRes::from(&o.delivery),
            child: ResidentRes::from(&o.child),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct RecordDoseReq {
    pub vaccine_code: String,
    pub given_date: String,
    /// `Given` (default), `Deferred` or `NotGiven`.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub posyandu_site: Option<String>,
    #[serde(default)]
    pub administration_site: Option<String>,
    #[serde(default)]
    pub vaccine_batch: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ImmunizationRecordRes {
    pub id: String,
    pub child_resident_id: String,
    pub vaccine_code: String,
    pub category: String,
    pub given_date: String,
    pub status: String,
    pub posyandu_site: Option<String>,
    pub administration_site: Option<String>,
    pub vaccine_batch: Option<String>,
    pub worker_name: String,
    pub note: Option<String>,
    pub created_at: String,
}

impl From<&ImmunizationRecord> for ImmunizationRecordRes {
    fn from(r: &ImmunizationRecord) -> Self {
        Self {
            id: r.id.to_string(),
            child_resident_id: r.child_resident_id.to_string(),
            vaccine_code: r.vaccine_code.to_string(),
            category: format!("{:?}", r.category),
            given_date: day(r.given_date),
            status: format!("{:?}", r.status),
            posyandu_site: r.posyandu_site.clone(),
            administration_site: r.administration_site.clone(),
            vaccine_batch: r.vaccine_batch.clone(),
            worker_name: r.worker_name.clone(),
            note: r.note.clone(),
            created_at: r.created_at.to_rfc3339(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ImmunizationStatusRes {
    pub child_resident_id: String,
    pub age_months: i64,
    pub doses_given: Vec<String>,
    pub is_complete: bool,
    pub due: Vec<String>,
    pub upcoming: Vec<String>,
    pub history: Vec<ImmunizationRecordRes>,
}

impl From<&ImmunizationStatus> for ImmunizationStatusRes {
    fn from(s: &ImmunizationStatus) -> Self {
        Self {
            child_resident_id: s.child_resident_id.to_string(),
            age_months: s.age_months,
            doses_given: s.doses_given.iter().map(|c| c.to_string()).collect(),
            is_complete: s.is_complete,
            due: s.due.iter().map(|c| c.to_string()).collect(),
            upcoming: s.upcoming.iter().map(|c| c.to_string()).collect(),
            history: s.history.iter().map(ImmunizationRecordRes::from).collect(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct TargetQuery {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    pub search: Option<String>,
    pub min_age_months: Option<u32>,
    pub max_age_months: Option<u32>,
    pub sub_village: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TargetRes {
    pub child: ResidentRes,
    pub age_months: i64,
    pub is_complete: bool,
    pub doses_given: usize,
}

impl From<&TargetEntry> for TargetRes {
    fn from(t: &TargetEntry) -> Self {
        Self {
            child: ResidentRes::from(&t.child),
            age_months: t.age_months,
            is_complete: t.is_complete,
            doses_given: t.doses_given,
        }
    }
}

/// Inclusive period; both ends default to the current month.
#[derive(Clone, Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CoverageQuery {
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CoverageRes {
    pub from: String,
    pub to: String,
    pub as_of: String,
    pub total_pemberian: usize,
    pub total_target: usize,
    pub idl_count: usize,
    pub idl_percentage: u32,
}

impl From<&Coverage> for CoverageRes {
    fn from(c: &Coverage) -> Self {
        Self {
            from: day(c.period.start()),
            to: day(c.period.end()),
            as_of: day(c.as_of),
            total_pemberian: c.doses_given,
            total_target: c.target_population,
            idl_count: c.idl_count,
            idl_percentage: c.idl_percentage,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SummaryRes {
    pub as_of: String,
    pub open_pregnancies: usize,
    pub trimester_1: usize,
    pub trimester_2: usize,
    pub trimester_3: usize,
    pub high_risk: usize,
    pub very_high_risk: usize,
    pub deliveries_this_month: usize,
    pub visits_this_month: usize,
    pub total_target: usize,
    pub idl_count: usize,
    pub idl_percentage: u32,
}

impl From<&Summary> for SummaryRes {
    fn from(s: &Summary) -> Self {
        Self {
            as_of: day(s.as_of),
            open_pregnancies: s.open_pregnancies,
            trimester_1: s.by_trimester.first,
            trimester_2: s.by_trimester.second,
            trimester_3: s.by_trimester.third,
            high_risk: s.high_risk,
            very_high_risk: s.very_high_risk,
            deliveries_this_month: s.deliveries_this_month,
            visits_this_month: s.visits_this_month,
            total_target: s.target_population,
            idl_count: s.idl_count,
            idl_percentage: s.idl_percentage,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct EventsQuery {
    /// RFC 3339 instant; only events at or after it are returned.
    pub since: Option<String>,
    /// 1-based page number.
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    /// Matched against worker id and name.
    pub search: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct WorkerEventRes {
    pub worker_id: String,
    pub worker_name: String,
    /// `entity_created` or `entity_updated`.
    pub action: String,
    pub entity: String,
    pub entity_id: String,
    pub timestamp: String,
}

impl From<&WorkerEvent> for WorkerEventRes {
    fn from(e: &WorkerEvent) -> Self {
        let action = match e.action {
            kia_core::events::EventAction::EntityCreated => "entity_created",
            kia_core::events::EventAction::EntityUpdated => "entity_updated",
        };
        let entity = match e.entity {
            kia_core::events::EntityKind::Pregnancy => "pregnancy",
            kia_core::events::EntityKind::AntenatalVisit => "antenatal_visit",
            kia_core::events::EntityKind::Delivery => "delivery",
            kia_core::events::EntityKind::Immunization => "immunization",
            kia_core::events::EntityKind::Resident => "resident",
        };
        Self {
            worker_id: e.worker_id.clone(),
            worker_name: e.worker_name.clone(),
            action: action.into(),
            entity: entity.into(),
            entity_id: e.entity_id.to_string(),
            timestamp: e.timestamp.to_rfc3339(),
        }
    }
}
