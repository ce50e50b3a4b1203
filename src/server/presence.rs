use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::common::models::{PresenceRecord, PresenceStatus, UserId};
use crate::server::directory::UserDirectory;
use crate::server::events::{EventBus, PresenceEvent};

/// Authoritative in-memory presence, hydrated lazily and written back best-effort.
pub struct PresenceStore {
    records: DashMap<UserId, PresenceRecord>,
    dirty: DashSet<UserId>,
    directory: Arc<dyn UserDirectory>,
    events: EventBus,
    away_after: chrono::Duration,
    offline_after: chrono::Duration,
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn status_event(record: &PresenceRecord) -> PresenceEvent {
    PresenceEvent::StatusChanged {
        user_id: record.user_id,
        status: record.status,
        status_message: record.status_message.clone(),
        department: record.department.clone(),
        last_seen: record.last_seen,
    }
}

impl PresenceStore {
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        events: EventBus,
        away_after: Duration,
        offline_after: Duration,
    ) -> Self {
        Self {
            records: DashMap::new(),
            dirty: DashSet::new(),
            directory,
            events,
            away_after: to_chrono(away_after),
            offline_after: to_chrono(offline_after),
        }
    }

    async fn ensure_loaded(&self, user_id: UserId) {
        if self.records.contains_key(&user_id) {
            return;
        }
        let now = Utc::now();
        let record = match self.directory.load_presence(user_id).await {
            // a stored Online/Away/Busy comes from an earlier run; this process has no connection for it yet
            Ok(Some(mut record)) => {
                if record.status != PresenceStatus::Offline {
                    debug!("[PRESENCE] Stale {} status for user {} reset to offline", record.status, user_id);
                    record.status = PresenceStatus::Offline;
                }
                record
            }
            Ok(None) => {
                let department = match self.directory.find_user(user_id).await {
                    Ok(user) => user.and_then(|u| u.department),
                    Err(e) => {
                        warn!("[PRESENCE] Failed to load user {}: {}", user_id, e);
                        None
                    }
                };
                PresenceRecord::offline(user_id, department, now)
            }
            Err(e) => {
                warn!("[PRESENCE] Failed to hydrate presence for user {}: {}", user_id, e);
                PresenceRecord::offline(user_id, None, now)
            }
        };
        // another task may have hydrated meanwhile; keep whichever landed first
        self.records.entry(user_id).or_insert(record);
    }

    /// Runs `apply` on the user's record and publishes the event it returns.
    async fn transition<F>(&self, user_id: UserId, apply: F) -> Option<PresenceEvent>
    where
        F: FnOnce(&mut PresenceRecord) -> Option<PresenceEvent>,
    {
        self.ensure_loaded(user_id).await;
        let event = {
            let mut record = self.records.get_mut(&user_id)?;
            apply(record.value_mut())
        };
        self.dirty.insert(user_id);
        if let Some(event) = &event {
            self.events.publish(event.clone());
        }
        event
    }

    pub async fn get_status(&self, user_id: UserId) -> PresenceStatus {
        self.get_record(user_id).await.status
    }

    pub async fn get_record(&self, user_id: UserId) -> PresenceRecord {
        self.ensure_loaded(user_id).await;
        match self.records.get(&user_id) {
            Some(record) => record.clone(),
            None => PresenceRecord::offline(user_id, None, Utc::now()),
        }
    }

    /// In-memory view only, no hydration.
    pub fn snapshot(&self, user_id: UserId) -> Option<PresenceRecord> {
        self.records.get(&user_id).map(|r| r.clone())
    }

    pub async fn update_status(&self, user_id: UserId, status: PresenceStatus, message: Option<String>) -> bool {
        let now = Utc::now();
        let event = self
            .transition(user_id, |record| {
                if record.status == status && record.status_message == message {
                    return None;
                }
                record.status = status;
                record.status_message = message;
                record.last_activity = now;
                record.last_seen = now;
                Some(status_event(record))
            })
            .await;
        if event.is_some() {
            info!("[PRESENCE] User {} set status to {}", user_id, status);
            self.persist_in_background(user_id);
        }
        true
    }

    /// Bumps last activity; Away or Offline users come back Online. Returns true on a transition.
    pub async fn record_activity(&self, user_id: UserId) -> bool {
        let now = Utc::now();
        let event = self
            .transition(user_id, |record| {
                record.last_activity = now;
                record.last_seen = now;
                match record.status {
                    PresenceStatus::Away | PresenceStatus::Offline => {
                        record.status = PresenceStatus::Online;
                        Some(status_event(record))
                    }
                    _ => None,
                }
            })
            .await;
        if event.is_some() {
            debug!("[PRESENCE] User {} is active again", user_id);
        }
        event.is_some()
    }

    pub async fn set_chat_availability(&self, user_id: UserId, available: bool) -> bool {
        let event = self
            .transition(user_id, |record| {
                if record.is_available_for_chat == available {
                    return None;
                }
                record.is_available_for_chat = available;
                Some(PresenceEvent::AvailabilityChanged {
                    user_id,
                    is_available: available,
                    department: record.department.clone(),
                })
            })
            .await;
        if event.is_some() {
            self.persist_in_background(user_id);
        }
        true
    }

    /// A new connection: Offline/Away users become Online, a manual Busy is kept.
    pub async fn mark_connected(&self, user_id: UserId) -> bool {
        let now = Utc::now();
        self.transition(user_id, |record| {
            record.last_activity = now;
            record.last_seen = now;
            if record.status == PresenceStatus::Busy || record.status == PresenceStatus::Online {
                return None;
            }
            record.status = PresenceStatus::Online;
            Some(status_event(record))
        })
        .await
        .is_some()
    }

    /// Last connection closed: Offline immediately, no idle wait.
    pub async fn mark_disconnected(&self, user_id: UserId) -> bool {
        let now = Utc::now();
        let changed = self
            .transition(user_id, |record| {
                record.last_seen = now;
                if record.status == PresenceStatus::Offline {
                    return None;
                }
                record.status = PresenceStatus::Offline;
                Some(status_event(record))
            })
            .await
            .is_some();
        if changed {
            self.persist_in_background(user_id);
        }
        changed
    }

    pub fn sweep_inactive(&self) -> Vec<PresenceEvent> {
        self.sweep_inactive_at(Utc::now())
    }

    /// Applies idle thresholds to every loaded record, then publishes one event per changed user.
    pub fn sweep_inactive_at(&self, now: DateTime<Utc>) -> Vec<PresenceEvent> {
        let users: Vec<UserId> = self.records.iter().map(|entry| *entry.key()).collect();
        let mut events = Vec::new();

        for user_id in users {
            let Some(mut record) = self.records.get_mut(&user_id) else { continue };
            let idle = now - record.last_activity;
            let next = match record.status {
                PresenceStatus::Offline => None,
                _ if idle >= self.offline_after => Some(PresenceStatus::Offline),
                PresenceStatus::Online if idle >= self.away_after => Some(PresenceStatus::Away),
                _ => None,
            };
            if let Some(status) = next {
                record.status = status;
                if status == PresenceStatus::Offline {
                    record.last_seen = record.last_activity;
                }
                events.push(status_event(&record));
                drop(record);
                self.dirty.insert(user_id);
            }
        }

        for event in &events {
            self.events.publish(event.clone());
        }
        if !events.is_empty() {
            info!("[PRESENCE] Idle sweep changed {} users", events.len());
        }
        events
    }

    /// Writes dirty records back to the directory. Failed users stay dirty for the next round.
    pub async fn sync_to_store(&self) -> usize {
        let users: Vec<UserId> = self.dirty.iter().map(|u| *u).collect();
        let mut saved = 0;
        for user_id in users {
            self.dirty.remove(&user_id);
            let Some(record) = self.snapshot(user_id) else { continue };
            match self.directory.save_presence(&record).await {
                Ok(()) => saved += 1,
                Err(e) => {
                    warn!("[PRESENCE] Failed to persist presence of user {}: {}", user_id, e);
                    self.dirty.insert(user_id);
                }
            }
        }
        saved
    }

    /// Early write of a user-visible change. The user stays dirty so the next
    /// sync (including the one at shutdown) still covers a save that never ran.
    fn persist_in_background(&self, user_id: UserId) {
        let Some(record) = self.snapshot(user_id) else { return };
        let directory = self.directory.clone();
        tokio::spawn(async move {
            if let Err(e) = directory.save_presence(&record).await {
                warn!("[PRESENCE] Background save for user {} failed: {}", user_id, e);
            }
        });
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.records
            .iter()
            .filter(|entry| entry.status.is_connected())
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn spawn_maintenance(self: Arc<Self>, sweep_every: Duration, sync_every: Duration, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(sweep_every);
            let mut sync = tokio::time::interval(sync_every);
            sweep.tick().await;
            sync.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.sync_to_store().await;
                        break;
                    }
                    _ = sweep.tick() => {
                        self.sweep_inactive();
                    }
                    _ = sync.tick() => {
                        let saved = self.sync_to_store().await;
                        if saved > 0 {
                            debug!("[PRESENCE] Synced {} presence records", saved);
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::models::UserRecord;
    use crate::server::database::Database;
    use crate::server::directory::SqliteDirectory;

    async fn store() -> (Arc<PresenceStore>, Arc<SqliteDirectory>, EventBus) {
        let db = Arc::new(Database::connect_in_memory().await.unwrap());
        let directory = Arc::new(SqliteDirectory::new(db));
        directory
            .upsert_user(&UserRecord {
                id: 1,
                username: "anna".into(),
                department: Some("sales".into()),
                role: None,
                is_active: true,
            })
            .await
            .unwrap();
        let events = EventBus::new();
        let store = PresenceStore::new(
            directory.clone(),
            events.clone(),
            Duration::from_secs(600),
            Duration::from_secs(1800),
        );
        (Arc::new(store), directory, events)
    }

    #[tokio::test]
    async fn unknown_users_start_offline_with_department() {
        let (store, _, _) = store().await;
        let record = store.get_record(1).await;
        assert_eq!(record.status, PresenceStatus::Offline);
        assert_eq!(record.department.as_deref(), Some("sales"));
        assert_eq!(store.get_status(42).await, PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn stored_online_status_hydrates_as_offline() {
        let (store, directory, _) = store().await;
        let mut saved = PresenceRecord::offline(1, Some("sales".into()), Utc::now());
        saved.status = PresenceStatus::Busy;
        saved.status_message = Some("on site".into());
        saved.is_available_for_chat = false;
        directory.save_presence(&saved).await.unwrap();

        let record = store.get_record(1).await;
        assert_eq!(record.status, PresenceStatus::Offline);
        assert_eq!(record.status_message.as_deref(), Some("on site"));
        assert!(!record.is_available_for_chat);

        assert!(store.mark_connected(1).await);
        assert_eq!(store.get_status(1).await, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn activity_while_away_emits_one_event() {
        let (store, _, events) = store().await;
        store.update_status(1, PresenceStatus::Away, None).await;
        let mut rx = events.subscribe();

        assert!(store.record_activity(1).await);
        assert!(!store.record_activity(1).await);

        let event = rx.try_recv().unwrap();
        assert!(matches!(
            event,
            PresenceEvent::StatusChanged { user_id: 1, status: PresenceStatus::Online, .. }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn busy_survives_connect_and_activity() {
        let (store, _, _) = store().await;
        store.update_status(1, PresenceStatus::Busy, Some("meeting".into())).await;
        store.mark_connected(1).await;
        store.record_activity(1).await;
        assert_eq!(store.get_status(1).await, PresenceStatus::Busy);
    }

    #[tokio::test]
    async fn sweep_demotes_idle_users() {
        let (store, _, _) = store().await;
        store.mark_connected(1).await;
        let last = store.snapshot(1).unwrap().last_activity;

        assert!(store.sweep_inactive_at(last + chrono::Duration::minutes(5)).is_empty());

        let events = store.sweep_inactive_at(last + chrono::Duration::minutes(11));
        assert_eq!(events.len(), 1);
        assert_eq!(store.snapshot(1).unwrap().status, PresenceStatus::Away);

        store.sweep_inactive_at(last + chrono::Duration::minutes(31));
        let record = store.snapshot(1).unwrap();
        assert_eq!(record.status, PresenceStatus::Offline);
        assert_eq!(record.last_seen, last);
    }

    #[tokio::test]
    async fn sweep_never_demotes_busy_to_away() {
        let (store, _, _) = store().await;
        store.update_status(1, PresenceStatus::Busy, None).await;
        let last = store.snapshot(1).unwrap().last_activity;

        assert!(store.sweep_inactive_at(last + chrono::Duration::minutes(15)).is_empty());
        store.sweep_inactive_at(last + chrono::Duration::minutes(45));
        assert_eq!(store.snapshot(1).unwrap().status, PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn availability_changes_are_published_once() {
        let (store, _, events) = store().await;
        let mut rx = events.subscribe();
        assert!(store.set_chat_availability(1, false).await);
        assert!(store.set_chat_availability(1, false).await);

        assert!(matches!(
            rx.try_recv().unwrap(),
            PresenceEvent::AvailabilityChanged { user_id: 1, is_available: false, .. }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sync_writes_dirty_records() {
        let (store, directory, _) = store().await;
        store.record_activity(1).await;
        assert!(store.sync_to_store().await >= 1);

        let saved = directory.load_presence(1).await.unwrap().unwrap();
        assert_eq!(saved.status, PresenceStatus::Online);
        assert_eq!(store.sync_to_store().await, 0);
    }

    #[tokio::test]
    async fn disconnect_stays_queued_for_the_next_sync() {
        let (store, directory, _) = store().await;
        store.mark_connected(1).await;
        store.sync_to_store().await;

        store.mark_disconnected(1).await;
        assert_eq!(store.sync_to_store().await, 1);
        let saved = directory.load_presence(1).await.unwrap().unwrap();
        assert_eq!(saved.status, PresenceStatus::Offline);
    }
}
