//! Delivery recorder.
//!
//! Recording a delivery is the only multi-entity write in the engine. It closes the pregnancy,
//! provisions the newborn in the resident directory and stores the delivery, all or nothing:
//!
//! 1. Under the mother's entity lock, check the pregnancy is open and validate the birth facts.
//! 2. Take the table write lock, so no reader observes an intermediate state.
//! 3. Provision the child resident.
//! 4. Journal the delivery, then the closed pregnancy.
//! 5. Commit both to the tables and release the lock.
//!
//! A failure in step 4 undoes what was already done (the journaled delivery and the child
//! resident). If that compensation fails too, the caller gets `RollbackFailed` carrying both
//! errors.

use crate::constants::{MIN_BIRTH_LENGTH_CM, MIN_BIRTH_WEIGHT_G};
use crate::context::{RequestContext, TenantId};
use crate::events::{EntityKind, EventAction};
use crate::journal::RecordKind;
use crate::repositories::pregnancy::PregnancyState;
use crate::residents::{BirthFacts, Resident};
use crate::store::KiaStore;
use crate::validation::{clean_note, code_key, required_text};
use crate::{KiaError, KiaResult};
use chrono::{DateTime, NaiveDate, Utc};
use kia_types::{NonEmptyText, Sex};
use kia_uuid::ShardableUuid;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::{Arc, PoisonError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryType {
    Spontaneous,
    CSection,
    Vacuum,
    Forceps,
    Other,
}

impl FromStr for DeliveryType {
    type Err = KiaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match code_key(s).as_str() {
            "spontaneous" | "normal" | "spontan" => Ok(DeliveryType::Spontaneous),
            "csection" | "caesarean" | "sc" | "sesar" => Ok(DeliveryType::CSection),
            "vacuum" | "vakum" => Ok(DeliveryType::Vacuum),
            "forceps" | "forsep" => Ok(DeliveryType::Forceps),
            "other" | "lainnya" => Ok(DeliveryType::Other),
            _ => Err(KiaError::validation(format!("unknown delivery type '{}'", s))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendantType {
    Midwife,
    Doctor,
    Nurse,
    TraditionalBirthAttendant,
    Other,
}

impl FromStr for AttendantType {
    type Err = KiaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match code_key(s).as_str() {
            "midwife" | "bidan" => Ok(AttendantType::Midwife),
            "doctor" | "dokter" => Ok(AttendantType::Doctor),
            "nurse" | "perawat" => Ok(AttendantType::Nurse),
            "traditionalbirthattendant" | "traditional" | "dukun" => {
                Ok(AttendantType::TraditionalBirthAttendant)
            }
            "other" | "lainnya" => Ok(AttendantType::Other),
            _ => Err(KiaError::validation(format!("unknown attendant type '{}'", s))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaternalCondition {
    Good,
    Complication,
    Deceased,
}

impl FromStr for MaternalCondition {
    type Err = KiaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match code_key(s).as_str() {
            "good" | "baik" | "sehat" => Ok(MaternalCondition::Good),
            "complication" | "komplikasi" => Ok(MaternalCondition::Complication),
            "deceased" | "meninggal" => Ok(MaternalCondition::Deceased),
            _ => Err(KiaError::validation(format!(
                "unknown maternal condition '{}'",
                s
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InfantCondition {
    HealthyAlive,
    AliveWithAbnormality,
    Deceased,
}

impl FromStr for InfantCondition {
    type Err = KiaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match code_key(s).as_str() {
            "healthyalive" | "healthy" | "hidupsehat" => Ok(InfantCondition::HealthyAlive),
            "alivewithabnormality" | "hidupkelainan" => Ok(InfantCondition::AliveWithAbnormality),
            "deceased" | "meninggal" => Ok(InfantCondition::Deceased),
            _ => Err(KiaError::validation(format!(
                "unknown infant condition '{}'",
                s
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: ShardableUuid,
    pub tenant: TenantId,
    pub pregnancy_id: ShardableUuid,
    pub mother_resident_id: ShardableUuid,
    pub child_resident_id: ShardableUuid,
    pub delivery_date: NaiveDate,
    pub place: String,
    pub delivery_type: DeliveryType,
    pub attendant_type: AttendantType,
    pub attendant_name: String,
    pub maternal_condition: MaternalCondition,
    pub maternal_complication_note: Option<String>,
    pub infant_condition: InfantCondition,
    pub birth_weight_g: u32,
    pub birth_length_cm: f64,
    pub infant_sex: Sex,
    pub infant_name: String,
    pub note: Option<String>,
    pub worker_id: String,
    pub worker_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewDelivery {
    pub delivery_date: NaiveDate,
    pub place: String,
    pub delivery_type: DeliveryType,
    pub attendant_type: AttendantType,
    pub attendant_name: String,
    pub maternal_condition: MaternalCondition,
    pub maternal_complication_note: Option<String>,
    pub infant_condition: InfantCondition,
    pub birth_weight_g: u32,
    pub birth_length_cm: f64,
    pub infant_sex: Sex,
    /// Defaults to "Bayi Ny. <mother's name>" when absent.
    pub infant_name: Option<String>,
    pub note: Option<String>,
}

/// A recorded delivery and the child resident it provisioned.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeliveryOutcome {
    pub delivery: Delivery,
    pub child: Resident,
}

#[derive(Clone)]
pub struct DeliveryService {
    store: Arc<KiaStore>,
}

impl DeliveryService {
    pub fn new(store: Arc<KiaStore>) -> Self {
        Self { store }
    }

    /// Records the delivery that closes `pregnancy_id`.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the pregnancy does not exist.
    /// - `InvalidState` if the pregnancy is already closed.
    /// - `Validation` for birth weight under 500 g, birth length under 20 cm, a delivery date before
    ///   the LMP or after today, a missing place or attendant name, or a complication without a note.
    /// - `Gateway` / journal errors if provisioning or persistence fails; nothing is left behind.
    /// - `RollbackFailed` if undoing a partial write failed.
    pub fn record_delivery(
        &self,
        ctx: &RequestContext,
        pregnancy_id: &ShardableUuid,
        new: NewDelivery,
    ) -> KiaResult<DeliveryOutcome> {
        let mother_id = self
            .store
            .read()
            .pregnancy(ctx.tenant(), pregnancy_id)?
            .resident_id;

        let lock = self.store.entity_lock(mother_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let pregnancy = self
            .store
            .read()
            .pregnancy(ctx.tenant(), pregnancy_id)?
            .clone();
        if !pregnancy.is_open() {
            return Err(KiaError::invalid_state(format!(
                "pregnancy {} is already closed by a delivery",
                pregnancy_id
            )));
        }

        if new.birth_weight_g < MIN_BIRTH_WEIGHT_G {
            return Err(KiaError::validation(format!(
                "birth_weight_g must be at least {}, got {}",
                MIN_BIRTH_WEIGHT_G, new.birth_weight_g
            )));
        }
        if !new.birth_length_cm.is_finite() || new.birth_length_cm < MIN_BIRTH_LENGTH_CM {
            return Err(KiaError::validation(format!(
                "birth_length_cm must be at least {}, got {}",
                MIN_BIRTH_LENGTH_CM, new.birth_length_cm
            )));
        }
        if new.delivery_date < pregnancy.lmp_date {
            return Err(KiaError::validation(format!(
                "delivery_date {} precedes lmp_date {}",
                new.delivery_date, pregnancy.lmp_date
            )));
        }
        if new.delivery_date > ctx.today() {
            return Err(KiaError::validation(format!(
                "delivery_date {} is in the future",
                new.delivery_date
            )));
        }
        let place = required_text("place", &new.place)?;
        let attendant_name = required_text("attendant_name", &new.attendant_name)?;
        let complication_note = clean_note(new.maternal_complication_note);
        if new.maternal_condition == MaternalCondition::Complication && complication_note.is_none()
        {
            return Err(KiaError::validation(
                "maternal_complication_note is required when the mother has a complication",
            ));
        }

        let mother = self.store.residents().get(ctx, &mother_id)?;
        let infant_name = match NonEmptyText::optional(new.infant_name) {
            Some(name) => name,
            None => NonEmptyText::new(format!("Bayi Ny. {}", mother.name))?,
        };

        let mut tables = self.store.write();

        let child = self.store.residents().provision(
            ctx,
            BirthFacts {
                name: infant_name.clone(),
                sex: new.infant_sex,
                birth_date: new.delivery_date,
                mother_id,
                address: mother.address.clone(),
                sub_village: mother.sub_village.clone(),
            },
        )?;

        let delivery = Delivery {
            id: ShardableUuid::new(),
            tenant: ctx.tenant().clone(),
            pregnancy_id: *pregnancy_id,
            mother_resident_id: mother_id,
            child_resident_id: child.id,
            delivery_date: new.delivery_date,
            place,
            delivery_type: new.delivery_type,
            attendant_type: new.attendant_type,
            attendant_name,
            maternal_condition: new.maternal_condition,
            maternal_complication_note: complication_note,
            infant_condition: new.infant_condition,
            birth_weight_g: new.birth_weight_g,
            birth_length_cm: new.birth_length_cm,
            infant_sex: new.infant_sex,
            infant_name: infant_name.to_string(),
            note: clean_note(new.note),
            worker_id: ctx.worker().id.to_string(),
            worker_name: ctx.worker().name.to_string(),
            created_at: ctx.received_at(),
        };

        let mut closed = pregnancy;
        closed.state = PregnancyState::Closed;
        closed.closed_at = Some(ctx.received_at());
        closed.updated_at = Some(ctx.received_at());

        if let Err(e) =
            self.store
                .persist(ctx.tenant(), RecordKind::Deliveries, &delivery.id, &delivery)
        {
            return Err(self.roll_back(ctx, e, &child, None));
        }
        if let Err(e) =
            self.store
                .persist(ctx.tenant(), RecordKind::Pregnancies, &closed.id, &closed)
        {
            return Err(self.roll_back(ctx, e, &child, Some(&delivery)));
        }

        tables.deliveries.insert(delivery.pregnancy_id, delivery.clone());
        tables.pregnancies.insert(closed.id, closed);
        drop(tables);

        self.store
            .publish(ctx, EventAction::EntityCreated, EntityKind::Delivery, delivery.id);
        self.store
            .publish(ctx, EventAction::EntityUpdated, EntityKind::Pregnancy, *pregnancy_id);
        self.store
            .publish(ctx, EventAction::EntityCreated, EntityKind::Resident, child.id);
        tracing::info!(
            "recorded delivery {} for pregnancy {}; provisioned child {}",
            delivery.id,
            pregnancy_id,
            child.id
        );

        Ok(DeliveryOutcome { delivery, child })
    }

    /// Undoes a partially applied delivery and returns the error to report.
    fn roll_back(
        &self,
        ctx: &RequestContext,
        error: KiaError,
        child: &Resident,
        journaled: Option<&Delivery>,
    ) -> KiaError {
        tracing::warn!(
            "delivery for child {} failed, rolling back: {}",
            child.id,
            error
        );

        let undo_delivery = match journaled {
            Some(delivery) => {
                self.store
                    .unpersist(ctx.tenant(), RecordKind::Deliveries, &delivery.id)
            }
            None => Ok(()),
        };
        let compensation = undo_delivery.and(self.store.residents().retract(ctx, &child.id));

        match compensation {
            Ok(()) => error,
            Err(compensation) => {
                tracing::error!(
                    "rollback of delivery for child {} failed: {}",
                    child.id,
                    compensation
                );
                KiaError::RollbackFailed {
                    error: Box::new(error),
                    compensation: Box::new(compensation),
                }
            }
        }
    }

    /// The delivery that closed `pregnancy_id`.
    pub fn get_delivery(
        &self,
        ctx: &RequestContext,
        pregnancy_id: &ShardableUuid,
    ) -> KiaResult<Delivery> {
        let tables = self.store.read();
        tables.pregnancy(ctx.tenant(), pregnancy_id)?;
        tables
            .deliveries
            .get(pregnancy_id)
            .cloned()
            .ok_or_else(|| KiaError::not_found("delivery", pregnancy_id))
    }
}
