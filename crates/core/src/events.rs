//! Worker activity feed.
//!
//! Every successful write emits a [`WorkerEvent`] naming the worker, the entity touched and
//! whether it was created or updated. The worker-performance scorer consumes this feed; the
//! engine itself never aggregates it. [`MemoryEventLog`] backs the feed and, given a journal,
//! keeps it across restarts.

use crate::constants::DEFAULT_EVENT_LOG_CAPACITY;
use crate::context::{RequestContext, TenantId};
use crate::journal::{RecordKind, YamlJournal};
use crate::pagination::{Page, PageRequest};
use crate::KiaResult;
use chrono::{DateTime, Utc};
use kia_uuid::ShardableUuid;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    EntityCreated,
    EntityUpdated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Pregnancy,
    AntenatalVisit,
    Delivery,
    Immunization,
    Resident,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerEvent {
    pub tenant: TenantId,
    pub worker_id: String,
    pub worker_name: String,
    pub action: EventAction,
    pub entity: EntityKind,
    pub entity_id: ShardableUuid,
    pub timestamp: DateTime<Utc>,
}

impl WorkerEvent {
    pub fn new(
        ctx: &RequestContext,
        action: EventAction,
        entity: EntityKind,
        entity_id: ShardableUuid,
    ) -> Self {
        Self {
            tenant: ctx.tenant().clone(),
            worker_id: ctx.worker().id.to_string(),
            worker_name: ctx.worker().name.to_string(),
            action,
            entity,
            entity_id,
            timestamp: ctx.received_at(),
        }
    }

    /// Case-insensitive match of `needle` against the worker id and name.
    pub fn matches_search(&self, needle: &str) -> bool {
        let needle = needle.trim().to_lowercase();
        needle.is_empty()
            || self.worker_id.to_lowercase().contains(&needle)
            || self.worker_name.to_lowercase().contains(&needle)
    }
}

/// Destination for worker events.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &WorkerEvent);
}

/// An event as stored by [`MemoryEventLog`], with its position in the feed.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct LoggedEvent {
    id: ShardableUuid,
    seq: u64,
    event: WorkerEvent,
}

#[derive(Default)]
struct LogState {
    events: VecDeque<LoggedEvent>,
    next_seq: u64,
}

/// The most recent events, in publication order, optionally journaled under `events`.
///
/// Once `capacity` is reached the oldest event is dropped for each new one, from memory and from
/// the journal.
pub struct MemoryEventLog {
    state: Mutex<LogState>,
    capacity: usize,
    journal: Option<YamlJournal>,
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(LogState::default()),
            capacity: capacity.max(1),
            journal: None,
        }
    }

    /// Opens a log backed by `journal`, replaying the events already stored there.
    pub fn open(journal: YamlJournal, capacity: usize) -> KiaResult<Self> {
        let mut stored: Vec<LoggedEvent> = journal.load_all(RecordKind::Events)?;
        stored.sort_by_key(|e| e.seq);
        let next_seq = stored.last().map_or(0, |e| e.seq + 1);

        let log = Self {
            state: Mutex::new(LogState {
                events: stored.into(),
                next_seq,
            }),
            capacity: capacity.max(1),
            journal: Some(journal),
        };
        {
            let mut state = log.state.lock().unwrap_or_else(PoisonError::into_inner);
            log.evict(&mut state);
            tracing::info!("replayed {} worker events", state.events.len());
        }
        Ok(log)
    }

    fn evict(&self, state: &mut LogState) {
        while state.events.len() > self.capacity {
            let Some(oldest) = state.events.pop_front() else {
                break;
            };
            if let Some(journal) = &self.journal {
                if let Err(e) = journal.remove(&oldest.event.tenant, RecordKind::Events, &oldest.id)
                {
                    tracing::warn!("failed to drop journaled event {}: {}", oldest.id, e);
                }
            }
        }
    }

    /// Events for `tenant`, optionally only those at or after `since`.
    pub fn for_tenant(
        &self,
        tenant: &TenantId,
        since: Option<DateTime<Utc>>,
    ) -> Vec<WorkerEvent> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .events
            .iter()
            .map(|e| &e.event)
            .filter(|e| &e.tenant == tenant)
            .filter(|e| since.is_none_or(|s| e.timestamp >= s))
            .cloned()
            .collect()
    }

    /// One page of the tenant's feed, oldest first. The search text matches the worker.
    pub fn feed(
        &self,
        tenant: &TenantId,
        since: Option<DateTime<Utc>>,
        page: &PageRequest,
    ) -> Page<WorkerEvent> {
        let events = self
            .for_tenant(tenant, since)
            .into_iter()
            .filter(|e| page.search().is_none_or(|s| e.matches_search(s)))
            .collect();
        page.paginate(events)
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemoryEventLog {
    fn publish(&self, event: &WorkerEvent) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let logged = LoggedEvent {
            id: ShardableUuid::new(),
            seq: state.next_seq,
            event: event.clone(),
        };
        state.next_seq += 1;

        if let Some(journal) = &self.journal {
            if let Err(e) = journal.write(&event.tenant, RecordKind::Events, &logged.id, &logged) {
                tracing::warn!("failed to journal event for {}: {}", event.entity_id, e);
            }
        }
        state.events.push_back(logged);
        self.evict(&mut state);
    }
}

/// Writes events to the `kia::events` tracing target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: &WorkerEvent) {
        tracing::info!(
            target: "kia::events",
            tenant = %event.tenant,
            worker_id = %event.worker_id,
            action = ?event.action,
            entity = ?event.entity,
            entity_id = %event.entity_id,
            "worker event"
        );
    }
}

/// Publishes each event to every inner sink.
#[derive(Default)]
pub struct FanOut {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanOut {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanOut {
    fn publish(&self, event: &WorkerEvent) {
        for sink in &self.sinks {
            sink.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WorkerRef;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn created(tenant: &str, day: u32) -> WorkerEvent {
        WorkerEvent::new(
            &ctx(tenant, day),
            EventAction::EntityCreated,
            EntityKind::Immunization,
            ShardableUuid::new(),
        )
    }

    fn ctx(tenant: &str, day: u32) -> RequestContext {
        RequestContext::on(
            TenantId::parse(tenant).expect("tenant"),
            WorkerRef::new("k-01", "Bu Sri").expect("worker"),
            NaiveDate::from_ymd_opt(2024, 5, day).expect("date"),
        )
    }

    #[test]
    fn test_memory_log_filters_by_tenant_and_time() {
        let log = MemoryEventLog::new();
        let id = ShardableUuid::new();

        log.publish(&WorkerEvent::new(
            &ctx("desa-a", 1),
            EventAction::EntityCreated,
            EntityKind::Pregnancy,
            id,
        ));
        log.publish(&WorkerEvent::new(
            &ctx("desa-a", 3),
            EventAction::EntityUpdated,
            EntityKind::Pregnancy,
            id,
        ));
        log.publish(&WorkerEvent::new(
            &ctx("desa-b", 3),
            EventAction::EntityCreated,
            EntityKind::Immunization,
            ShardableUuid::new(),
        ));

        let tenant = TenantId::parse("desa-a").expect("tenant");
        assert_eq!(log.for_tenant(&tenant, None).len(), 2);

        let since = ctx("desa-a", 2).received_at();
        let recent = log.for_tenant(&tenant, Some(since));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].action, EventAction::EntityUpdated);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_fan_out_reaches_every_sink() {
        let a = Arc::new(MemoryEventLog::new());
        let b = Arc::new(MemoryEventLog::new());
        let fan = FanOut::new(vec![a.clone(), b.clone(), Arc::new(TracingEventSink)]);

        fan.publish(&WorkerEvent::new(
            &ctx("desa-a", 1),
            EventAction::EntityCreated,
            EntityKind::Delivery,
            ShardableUuid::new(),
        ));

        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_journaled_log_replays_in_order_after_reopen() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let tenant = TenantId::parse("desa-a").expect("tenant");
        let published: Vec<WorkerEvent> = (1..=4).map(|day| created("desa-a", day)).collect();
        {
            let log = MemoryEventLog::open(YamlJournal::new(temp_dir.path()), 100).expect("open");
            for event in &published {
                log.publish(event);
            }
        }

        let reopened =
            MemoryEventLog::open(YamlJournal::new(temp_dir.path()), 100).expect("reopen");
        assert_eq!(reopened.for_tenant(&tenant, None), published);

        let next = created("desa-a", 5);
        reopened.publish(&next);
        assert_eq!(reopened.for_tenant(&tenant, None).last(), Some(&next));
    }

    #[test]
    fn test_capacity_drops_oldest_from_memory_and_journal() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let tenant = TenantId::parse("desa-a").expect("tenant");
        {
            let log = MemoryEventLog::open(YamlJournal::new(temp_dir.path()), 3).expect("open");
            for day in 1..=5 {
                log.publish(&created("desa-a", day));
            }
            assert_eq!(log.len(), 3);
        }

        let reopened = MemoryEventLog::open(YamlJournal::new(temp_dir.path()), 3).expect("reopen");
        let kept: Vec<u32> = reopened
            .for_tenant(&tenant, None)
            .iter()
            .map(|e| chrono::Datelike::day(&e.timestamp))
            .collect();
        assert_eq!(kept, vec![3, 4, 5]);
        let files: Vec<LoggedEvent> = YamlJournal::new(temp_dir.path())
            .load_all(RecordKind::Events)
            .expect("load");
        assert_eq!(files.len(), 3, "evicted events are removed from the journal");
    }

    #[test]
    fn test_feed_pages_and_searches_by_worker() {
        let log = MemoryEventLog::new();
        for day in 1..=5 {
            log.publish(&created("desa-a", day));
        }
        let other = RequestContext::on(
            TenantId::parse("desa-a").expect("tenant"),
            WorkerRef::new("k-02", "Pak Joko").expect("worker"),
            NaiveDate::from_ymd_opt(2024, 5, 6).expect("date"),
        );
        log.publish(&WorkerEvent::new(
            &other,
            EventAction::EntityUpdated,
            EntityKind::Pregnancy,
            ShardableUuid::new(),
        ));
        let tenant = TenantId::parse("desa-a").expect("tenant");
        let cfg = crate::config::CoreConfig::default();

        let second = log.feed(
            &tenant,
            None,
            &PageRequest::new(&cfg, Some(2), Some(4), None).expect("page"),
        );
        assert_eq!(second.total, 6);
        assert_eq!(second.items.len(), 2);
        assert_eq!(second.items[1].worker_id, "k-02");

        let joko = log.feed(&tenant, None, &PageRequest::all().with_search("joko"));
        assert_eq!(joko.total, 1);
        assert_eq!(joko.items[0].entity, EntityKind::Pregnancy);
    }
}
