//! Shared engine state.
//!
//! [`KiaStore`] owns the in-memory record tables, the optional YAML journal, the resident
//! directory handle and the event sink. The services in [`crate::repositories`] are thin views
//! over one shared `Arc<KiaStore>`.
//!
//! ## Concurrency
//!
//! Writes are serialised per subject resident: every pregnancy, visit and delivery write holds the
//! mother's entity lock, and every dose write holds the child's entity lock. Uniqueness checks
//! (one open pregnancy per mother, one given dose per code) run under that lock, so they cannot
//! be raced. Writers for different residents proceed in parallel; they only meet on the table
//! `RwLock`, which is held briefly to commit.
//!
//! The delivery transaction holds the table write lock from the moment it provisions the child
//! until both the delivery and the closed pregnancy are committed. Readers take the table read lock
//! before consulting the resident directory, so no reader sees a closed pregnancy without its
//! child, or a provisioned child whose pregnancy is still open.

use crate::config::CoreConfig;
use crate::context::{RequestContext, TenantId, WorkerRef};
use crate::events::{EntityKind, EventAction, EventSink, WorkerEvent};
use crate::journal::{RecordKind, YamlJournal};
use crate::repositories::antenatal::AntenatalVisit;
use crate::repositories::delivery::Delivery;
use crate::repositories::immunization::ImmunizationRecord;
use crate::repositories::pregnancy::{Pregnancy, PregnancyState};
use crate::residents::{Resident, ResidentDirectory};
use crate::{KiaError, KiaResult};
use chrono::Utc;
use kia_types::Nik;
use kia_uuid::ShardableUuid;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

#[derive(Default)]
pub(crate) struct Tables {
    pub(crate) pregnancies: HashMap<ShardableUuid, Pregnancy>,
    /// Keyed by pregnancy id.
    pub(crate) visits: HashMap<ShardableUuid, Vec<AntenatalVisit>>,
    /// Keyed by pregnancy id.
    pub(crate) deliveries: HashMap<ShardableUuid, Delivery>,
    /// Keyed by child resident id.
    pub(crate) immunizations: HashMap<ShardableUuid, Vec<ImmunizationRecord>>,
}

impl Tables {
    /// Looks up a pregnancy within the caller's tenant.
    pub(crate) fn pregnancy(
        &self,
        tenant: &TenantId,
        id: &ShardableUuid,
    ) -> KiaResult<&Pregnancy> {
        self.pregnancies
            .get(id)
            .filter(|p| &p.tenant == tenant)
            .ok_or_else(|| KiaError::not_found("pregnancy", id))
    }

    pub(crate) fn open_pregnancy_for(
        &self,
        tenant: &TenantId,
        resident_id: &ShardableUuid,
    ) -> Option<&Pregnancy> {
        self.pregnancies
            .values()
            .find(|p| &p.tenant == tenant && &p.resident_id == resident_id && p.is_open())
    }

    pub(crate) fn doses_for(&self, child_id: &ShardableUuid) -> &[ImmunizationRecord] {
        self.immunizations
            .get(child_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

pub struct KiaStore {
    cfg: Arc<CoreConfig>,
    tables: RwLock<Tables>,
    /// Entries die with the last holder of the lock and are pruned on the next insert.
    entity_locks: Mutex<HashMap<ShardableUuid, Weak<Mutex<()>>>>,
    journal: Option<YamlJournal>,
    residents: Arc<dyn ResidentDirectory>,
    events: Arc<dyn EventSink>,
}

impl KiaStore {
    /// Builds the store, replaying the journal when `cfg` names a data directory.
    ///
    /// After replay, children the directory holds for a delivery that never reached the journal
    /// are retracted, so a crash between provisioning and journaling leaves no orphan behind.
    pub fn open(
        cfg: Arc<CoreConfig>,
        residents: Arc<dyn ResidentDirectory>,
        events: Arc<dyn EventSink>,
    ) -> KiaResult<Arc<Self>> {
        let journal = cfg.data_dir().map(YamlJournal::new);
        let tables = match &journal {
            Some(journal) => replay(journal)?,
            None => Tables::default(),
        };

        if journal.is_some() {
            retract_orphaned_children(&tables, residents.as_ref())?;
        }

        Ok(Arc::new(Self {
            cfg,
            tables: RwLock::new(tables),
            entity_locks: Mutex::new(HashMap::new()),
            journal,
            residents,
            events,
        }))
    }

    pub fn cfg(&self) -> &CoreConfig {
        &self.cfg
    }

    /// The directory itself, without the table lock. Callers inside the crate take
    /// [`KiaStore::read`] first when they combine residents with record tables.
    pub(crate) fn residents(&self) -> &dyn ResidentDirectory {
        self.residents.as_ref()
    }

    /// Read access to the directory that waits for any in-flight delivery to commit or roll back.
    pub fn resident_view(&self) -> ResidentView<'_> {
        ResidentView { store: self }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// The lock serialising writes about one resident.
    pub(crate) fn entity_lock(&self, id: ShardableUuid) -> Arc<Mutex<()>> {
        let mut locks = self
            .entity_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = locks.get(&id).and_then(Weak::upgrade) {
            return lock;
        }

        locks.retain(|_, lock| lock.strong_count() > 0);
        let lock = Arc::new(Mutex::new(()));
        locks.insert(id, Arc::downgrade(&lock));
        lock
    }

    pub(crate) fn persist<T: Serialize>(
        &self,
        tenant: &TenantId,
        kind: RecordKind,
        id: &ShardableUuid,
        value: &T,
    ) -> KiaResult<()> {
        match &self.journal {
            Some(journal) => journal.write(tenant, kind, id, value),
            None => Ok(()),
        }
    }

    pub(crate) fn unpersist(
        &self,
        tenant: &TenantId,
        kind: RecordKind,
        id: &ShardableUuid,
    ) -> KiaResult<()> {
        match &self.journal {
            Some(journal) => journal.remove(tenant, kind, id),
            None => Ok(()),
        }
    }

    pub(crate) fn publish(
        &self,
        ctx: &RequestContext,
        action: EventAction,
        entity: EntityKind,
        id: ShardableUuid,
    ) {
        self.events
            .publish(&WorkerEvent::new(ctx, action, entity, id));
    }
}

/// Resident lookups taken under the table read lock.
///
/// A delivery holds the table write lock from provisioning the child until the delivery commits
/// or is rolled back, so a lookup through this view never returns a child whose pregnancy is
/// still open.
pub struct ResidentView<'a> {
    store: &'a KiaStore,
}

impl ResidentView<'_> {
    pub fn resolve_by_identifier(&self, ctx: &RequestContext, nik: &Nik) -> KiaResult<Resident> {
        let _tables = self.store.read();
        self.store.residents().resolve_by_identifier(ctx, nik)
    }

    pub fn get(&self, ctx: &RequestContext, id: &ShardableUuid) -> KiaResult<Resident> {
        let _tables = self.store.read();
        self.store.residents().get(ctx, id)
    }

    pub fn list(&self, ctx: &RequestContext) -> KiaResult<Vec<Resident>> {
        let _tables = self.store.read();
        self.store.residents().list(ctx)
    }
}

/// Retracts children provisioned for a delivery whose record never reached the journal.
///
/// The child is provisioned before the delivery is written, so a crash in between leaves a
/// resident with a `mother_id` and no delivery naming it. Only tenants that have pregnancies can
/// hold such a child.
fn retract_orphaned_children(tables: &Tables, residents: &dyn ResidentDirectory) -> KiaResult<()> {
    let delivered: HashSet<ShardableUuid> = tables
        .deliveries
        .values()
        .map(|d| d.child_resident_id)
        .collect();
    let tenants: BTreeSet<&TenantId> = tables.pregnancies.values().map(|p| &p.tenant).collect();
    let worker = WorkerRef::new("journal-replay", "journal replay")?;

    for tenant in tenants {
        let ctx = RequestContext::at(tenant.clone(), worker.clone(), Utc::now());
        for child in residents.list(&ctx)? {
            if child.mother_id.is_some() && !delivered.contains(&child.id) {
                tracing::warn!(
                    "child {} has no stored delivery; retracting it from tenant {}",
                    child.id,
                    tenant
                );
                residents.retract(&ctx, &child.id)?;
            }
        }
    }
    Ok(())
}

/// Rebuilds the tables from the journal.
///
/// A delivery is the only event that closes a pregnancy, so a pregnancy that has a delivery on
/// disk is treated as closed even if its own file was not rewritten before a crash.
fn replay(journal: &YamlJournal) -> KiaResult<Tables> {
    let mut tables = Tables::default();

    for pregnancy in journal.load_all::<Pregnancy>(RecordKind::Pregnancies)? {
        tables.pregnancies.insert(pregnancy.id, pregnancy);
    }

    for visit in journal.load_all::<AntenatalVisit>(RecordKind::Visits)? {
        tables.visits.entry(visit.pregnancy_id).or_default().push(visit);
    }

    for delivery in journal.load_all::<Delivery>(RecordKind::Deliveries)? {
        if let Some(pregnancy) = tables.pregnancies.get_mut(&delivery.pregnancy_id) {
            if pregnancy.is_open() {
                tracing::warn!(
                    "pregnancy {} has delivery {} but was stored open; closing it",
                    pregnancy.id,
                    delivery.id
                );
                pregnancy.state = PregnancyState::Closed;
                pregnancy.closed_at = Some(delivery.created_at);
            }
        }
        tables.deliveries.insert(delivery.pregnancy_id, delivery);
    }

    for record in journal.load_all::<ImmunizationRecord>(RecordKind::Immunizations)? {
        tables
            .immunizations
            .entry(record.child_resident_id)
            .or_default()
            .push(record);
    }

    tracing::info!(
        "replayed journal {}: {} pregnancies, {} deliveries, {} immunized children",
        journal.root().display(),
        tables.pregnancies.len(),
        tables.deliveries.len(),
        tables.immunizations.len()
    );

    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::delivery::DeliveryService;
    use crate::repositories::pregnancy::PregnancyService;
    use crate::repositories::statistics::StatisticsService;
    use crate::residents::BirthFacts;
    use crate::test_support::*;
    use kia_types::{NonEmptyText, Sex};
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn children_of(fx: &Fixture, mother_id: ShardableUuid) -> usize {
        fx.directory
            .list(&ctx_on(date(2024, 10, 10)))
            .expect("list")
            .into_iter()
            .filter(|r| r.mother_id == Some(mother_id))
            .count()
    }

    #[test]
    fn test_replay_closes_pregnancy_with_stored_delivery() {
        let dir = TempDir::new().expect("tempdir");
        let fx = journaled_fixture(dir.path());
        let mother = register_mother(&fx, "3201010101950001", "Siti Aminah");
        let open = PregnancyService::new(fx.store.clone())
            .open_pregnancy(&ctx_on(date(2024, 3, 1)), new_pregnancy(mother.id, date(2024, 1, 1)))
            .expect("open")
            .pregnancy;
        DeliveryService::new(fx.store.clone())
            .record_delivery(
                &ctx_on(date(2024, 10, 6)),
                &open.id,
                new_delivery(date(2024, 10, 5), 3100),
            )
            .expect("delivery");

        // Crash between the delivery write and the pregnancy rewrite.
        YamlJournal::new(dir.path())
            .write(&open.tenant, RecordKind::Pregnancies, &open.id, &open)
            .expect("rewrite open pregnancy");

        let reopened = KiaStore::open(fx.store.cfg.clone(), fx.directory.clone(), fx.events.clone())
            .expect("reopen");
        let tables = reopened.read();
        let pregnancy = tables.pregnancy(&open.tenant, &open.id).expect("pregnancy");
        assert!(!pregnancy.is_open());
        assert!(pregnancy.closed_at.is_some());
        assert!(tables.deliveries.contains_key(&open.id));
    }

    #[test]
    fn test_reopen_retracts_child_provisioned_before_crash() {
        let dir = TempDir::new().expect("tempdir");
        let ctx = ctx_on(date(2024, 10, 10));
        let (mother_id, pregnancy_id) = {
            let fx = journaled_fixture(dir.path());
            let mother = register_mother(&fx, "3201010101950001", "Siti Aminah");
            let pregnancy_id = PregnancyService::new(fx.store.clone())
                .open_pregnancy(&ctx_on(date(2024, 3, 1)), new_pregnancy(mother.id, date(2024, 1, 1)))
                .expect("open")
                .pregnancy
                .id;

            // The child reaches the journal, the delivery never does.
            fx.directory
                .provision(
                    &ctx,
                    BirthFacts {
                        name: NonEmptyText::new("Bayi Ny. Siti Aminah").expect("name"),
                        sex: Sex::Female,
                        birth_date: date(2024, 10, 5),
                        mother_id: mother.id,
                        address: mother.address.clone(),
                        sub_village: mother.sub_village.clone(),
                    },
                )
                .expect("provision");
            (mother.id, pregnancy_id)
        };

        let reopened = journaled_fixture(dir.path());
        assert_eq!(children_of(&reopened, mother_id), 0, "orphan retracted");
        assert!(PregnancyService::new(reopened.store.clone())
            .get(&ctx, &pregnancy_id)
            .expect("pregnancy")
            .pregnancy
            .is_open());
        let summary = StatisticsService::new(reopened.store.clone())
            .summary(&ctx)
            .expect("summary");
        assert_eq!(summary.target_population, 0);

        DeliveryService::new(reopened.store.clone())
            .record_delivery(&ctx, &pregnancy_id, new_delivery(date(2024, 10, 5), 3100))
            .expect("retry");
        assert_eq!(children_of(&reopened, mother_id), 1);

        drop(reopened);
        let again = journaled_fixture(dir.path());
        assert_eq!(children_of(&again, mother_id), 1, "delivered child is kept");
    }

    #[test]
    fn test_entity_lock_is_shared_per_id() {
        let fx = fixture();
        let id = ShardableUuid::new();
        let a = fx.store.entity_lock(id);
        let b = fx.store.entity_lock(id);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &fx.store.entity_lock(ShardableUuid::new())));
    }

    #[test]
    fn test_released_entity_locks_are_pruned() {
        let fx = fixture();
        for _ in 0..50 {
            let lock = fx.store.entity_lock(ShardableUuid::new());
            drop(lock.lock().unwrap_or_else(PoisonError::into_inner));
        }
        let held = fx.store.entity_lock(ShardableUuid::new());

        let locks = fx.store.entity_locks.lock().unwrap_or_else(PoisonError::into_inner);
        assert_eq!(locks.len(), 1, "only the held lock remains");
        drop(locks);
        drop(held);
    }

    #[test]
    fn test_resident_view_waits_for_delivery_rollback() {
        let fx = fixture();
        let ctx = ctx_on(date(2024, 10, 10));
        let mother = register_mother(&fx, "3201010101950001", "Siti Aminah");
        let (provisioned_tx, provisioned_rx) = mpsc::channel();

        std::thread::scope(|scope| {
            let store = fx.store.clone();
            let thread_ctx = ctx.clone();
            let mother = mother.clone();
            scope.spawn(move || {
                let _tables = store.write();
                let child = store
                    .residents()
                    .provision(
                        &thread_ctx,
                        BirthFacts {
                            name: NonEmptyText::new("Bayi Ny. Siti Aminah").expect("name"),
                            sex: Sex::Male,
                            birth_date: date(2024, 10, 5),
                            mother_id: mother.id,
                            address: None,
                            sub_village: None,
                        },
                    )
                    .expect("provision");
                provisioned_tx.send(()).expect("send");
                std::thread::sleep(Duration::from_millis(50));
                store.residents().retract(&thread_ctx, &child.id).expect("retract");
            });

            provisioned_rx.recv().expect("provisioned");
            let visible = fx.store.resident_view().list(&ctx).expect("list");
            assert_eq!(visible.len(), 1, "only the mother is visible");
        });
    }
}
