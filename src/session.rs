// Per-session cache of canonical snapshots.
//
// The outer map is guarded by a std mutex held only for lookups. Each session has
// its own async mutex held for the duration of one merge, so reconciliations for
// one session are serialized while different sessions run in parallel.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::metrics;
use crate::rate_limit::RateLimiter;
use crate::snapshot::{reconcile, ReconcileError, ReconcileWarning, Reconciled, Snapshot, Update};

#[derive(Debug, Default)]
struct SessionState {
    snapshot: Option<Snapshot>,
    updated_at: Option<DateTime<Utc>>,
    reconciliations: u64,
}

#[derive(Debug)]
struct SessionEntry {
    slot: Arc<tokio::sync::Mutex<SessionState>>,
    last_used: Instant,
}

/// Summary of one cached session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub has_snapshot: bool,
    pub updated_at: Option<DateTime<Utc>>,
    pub reconciliations: u64,
}

/// Thread-safe map of session id to canonical snapshot.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    inner: Arc<Mutex<HashMap<String, SessionEntry>>>,
    // Ids bound to a live connection. Lock before `inner` when both are needed.
    leases: Arc<Mutex<HashSet<String>>>,
}

/// A live connection's exclusive claim on a session id.
///
/// Dropping the lease frees the id. If the session did not exist when the lease
/// was taken, the connection owns it and the session is removed as well.
#[derive(Debug)]
pub struct SessionLease {
    store: SessionStore,
    session_id: String,
    owns_session: bool,
}

impl SessionLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn owns_session(&self) -> bool {
        self.owns_session
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Ok(mut leases) = self.store.leases.lock() {
            leases.remove(&self.session_id);
        }
        if self.owns_session {
            self.store.remove(&self.session_id);
        }
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a session id to a live connection. Returns `None` if another
    /// connection already holds it.
    pub fn lease(&self, session_id: &str) -> Option<SessionLease> {
        let mut leases = self.leases.lock().unwrap();
        if !leases.insert(session_id.to_string()) {
            return None;
        }
        let owns_session = !self.inner.lock().unwrap().contains_key(session_id);
        Some(SessionLease {
            store: self.clone(),
            session_id: session_id.to_string(),
            owns_session,
        })
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(session_id)
    }

    /// Get or create the slot for a session and mark it as used.
    fn slot(&self, session_id: &str) -> Arc<tokio::sync::Mutex<SessionState>> {
        let mut map = self.inner.lock().unwrap();
        let now = Instant::now();
        let entry = map.entry(session_id.to_string()).or_insert_with(|| {
            tracing::debug!(session_id, "Session created");
            SessionEntry {
                slot: Arc::new(tokio::sync::Mutex::new(SessionState::default())),
                last_used: now,
            }
        });
        entry.last_used = now;
        let slot = entry.slot.clone();
        metrics::ACTIVE_SESSIONS.set(map.len() as i64);
        slot
    }

    fn existing_slot(&self, session_id: &str) -> Option<Arc<tokio::sync::Mutex<SessionState>>> {
        let map = self.inner.lock().unwrap();
        map.get(session_id).map(|e| e.slot.clone())
    }

    /// Merge an update into the session's canonical snapshot.
    ///
    /// On success the new snapshot replaces the cached one. On error the cache is
    /// left exactly as it was.
    pub async fn reconcile(
        &self,
        session_id: &str,
        update: Update,
    ) -> Result<Reconciled, ReconcileError> {
        let mode = update.mode();
        let slot = self.slot(session_id);
        let mut state = slot.lock().await;

        match reconcile(state.snapshot.as_ref(), update) {
            Ok(reconciled) => {
                state.snapshot = Some(reconciled.snapshot.clone());
                state.updated_at = Some(Utc::now());
                state.reconciliations += 1;

                metrics::RECONCILIATIONS_TOTAL
                    .with_label_values(&[mode])
                    .inc();
                for warning in &reconciled.warnings {
                    log_warning(session_id, warning);
                }
                tracing::debug!(
                    session_id,
                    mode,
                    objects = reconciled.snapshot.game_context.objects_in_view.len(),
                    interactions = reconciled.snapshot.active_interactions.len(),
                    "Snapshot reconciled"
                );
                Ok(reconciled)
            }
            Err(e) => {
                metrics::RECONCILE_ERRORS_TOTAL
                    .with_label_values(&[e.kind()])
                    .inc();
                tracing::warn!(session_id, mode, "Reconciliation rejected: {e}");
                Err(e)
            }
        }
    }

    /// Current canonical snapshot for a session.
    pub async fn snapshot(&self, session_id: &str) -> Option<Snapshot> {
        let slot = self.existing_slot(session_id)?;
        let state = slot.lock().await;
        state.snapshot.clone()
    }

    /// Drop a session. Returns false if it did not exist.
    pub fn remove(&self, session_id: &str) -> bool {
        let mut map = self.inner.lock().unwrap();
        let removed = map.remove(session_id).is_some();
        metrics::ACTIVE_SESSIONS.set(map.len() as i64);
        if removed {
            tracing::debug!(session_id, "Session removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All sessions, sorted by id.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let slots: Vec<(String, Arc<tokio::sync::Mutex<SessionState>>)> = {
            let map = self.inner.lock().unwrap();
            map.iter()
                .map(|(id, e)| (id.clone(), e.slot.clone()))
                .collect()
        };

        let mut sessions = Vec::with_capacity(slots.len());
        for (session_id, slot) in slots {
            let state = slot.lock().await;
            sessions.push(SessionInfo {
                session_id,
                has_snapshot: state.snapshot.is_some(),
                updated_at: state.updated_at,
                reconciliations: state.reconciliations,
            });
        }
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    /// Remove sessions unused for longer than `ttl`. Sessions with a merge in
    /// flight or bound to a live connection are kept. Returns the evicted ids.
    pub fn evict_idle(&self, ttl: Duration) -> Vec<String> {
        let leases = self.leases.lock().unwrap();
        let mut map = self.inner.lock().unwrap();
        let now = Instant::now();
        let mut evicted = Vec::new();
        map.retain(|session_id, entry| {
            let idle = now.duration_since(entry.last_used) >= ttl;
            let in_use = Arc::strong_count(&entry.slot) > 1 || leases.contains(session_id);
            if idle && !in_use {
                tracing::info!(session_id = %session_id, "Evicting idle session");
                evicted.push(session_id.clone());
                false
            } else {
                true
            }
        });
        metrics::ACTIVE_SESSIONS.set(map.len() as i64);
        evicted
    }
}

fn log_warning(session_id: &str, warning: &ReconcileWarning) {
    match warning {
        ReconcileWarning::DanglingInteractionTarget { kind, target } => {
            metrics::DANGLING_INTERACTIONS_DROPPED_TOTAL.inc();
            tracing::warn!(
                session_id,
                interaction = %kind,
                target = %target,
                "Dropped interaction with dangling target"
            );
        }
        ReconcileWarning::SupersededUpdate { collection, id } => {
            tracing::warn!(
                session_id,
                collection = %collection,
                id = %id,
                "Update superseded by add in the same delta"
            );
        }
    }
}

/// One sweep: evict idle sessions, forget their rate-limit windows and purge
/// windows that have emptied. Returns the number of sessions evicted.
pub fn sweep(store: &SessionStore, limiter: &RateLimiter, ttl: Duration) -> usize {
    let evicted = store.evict_idle(ttl);
    for session_id in &evicted {
        limiter.release(session_id);
    }
    let purged = limiter.purge_expired();
    if !evicted.is_empty() || purged > 0 {
        tracing::info!(
            evicted = evicted.len(),
            purged,
            remaining = store.len(),
            "Session sweep"
        );
    }
    evicted.len()
}

/// Spawn a background task that periodically runs [`sweep`].
pub fn spawn_session_sweeper(
    store: SessionStore,
    limiter: RateLimiter,
    ttl: Duration,
    interval: Duration,
) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            sweep(&store, &limiter, ttl);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::model::WorldObject;
    use crate::snapshot::Delta;

    fn object(id: &str) -> WorldObject {
        WorldObject {
            id: id.into(),
            name: id.to_uppercase(),
            attributes: Default::default(),
            position: None,
            text: None,
        }
    }

    fn full_with(ids: &[&str]) -> Update {
        let mut snap = Snapshot::default();
        snap.game_context.objects_in_view = ids.iter().map(|id| object(id)).collect();
        Update::Full(snap)
    }

    fn add(id: &str) -> Update {
        let mut delta = Delta::default();
        delta.added.game_context.objects_in_view = vec![object(id)];
        Update::Delta(delta)
    }

    #[tokio::test]
    async fn test_delta_before_full_is_rejected() {
        let store = SessionStore::new();
        let err = store.reconcile("s1", add("obj_1")).await.unwrap_err();
        assert_eq!(err, ReconcileError::MissingBaseState);
        assert!(store.snapshot("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_full_then_delta() {
        let store = SessionStore::new();
        store.reconcile("s1", full_with(&["obj_1"])).await.unwrap();
        store.reconcile("s1", add("obj_2")).await.unwrap();

        let snap = store.snapshot("s1").await.unwrap();
        let ids: Vec<&str> = snap
            .game_context
            .objects_in_view
            .iter()
            .map(|o| o.id.as_str())
            .collect();
        assert_eq!(ids, vec!["obj_1", "obj_2"]);
    }

    #[tokio::test]
    async fn test_failed_delta_leaves_cache_unchanged() {
        let store = SessionStore::new();
        store.reconcile("s1", full_with(&["obj_1"])).await.unwrap();
        let before = store.snapshot("s1").await.unwrap();

        let err = store.reconcile("s1", add("obj_1")).await.unwrap_err();
        assert_eq!(err.kind(), "duplicate_id");
        assert_eq!(store.snapshot("s1").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let store = SessionStore::new();
        store.reconcile("a", full_with(&["obj_a"])).await.unwrap();
        store.reconcile("b", full_with(&["obj_b"])).await.unwrap();

        assert!(store.snapshot("a").await.unwrap().object("obj_b").is_none());
        assert!(store.snapshot("b").await.unwrap().object("obj_a").is_none());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_locked_session_does_not_block_others() {
        let store = SessionStore::new();
        store.reconcile("a", full_with(&["obj_a"])).await.unwrap();

        let slot_a = store.slot("a");
        let _guard = slot_a.lock().await;

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            store.reconcile("b", full_with(&["obj_b"])),
        )
        .await;
        assert!(result.is_ok(), "session b must not wait on session a");

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), store.reconcile("a", add("x"))).await;
        assert!(blocked.is_err(), "session a is held by another writer");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_deltas_on_one_session_are_serialized() {
        let store = SessionStore::new();
        store.reconcile("s", full_with(&[])).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.reconcile("s", add(&format!("obj_{i}"))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let snap = store.snapshot("s").await.unwrap();
        assert_eq!(snap.game_context.objects_in_view.len(), 32);
        let info = store.list().await;
        assert_eq!(info[0].reconciliations, 33);
    }

    #[tokio::test]
    async fn test_remove_and_list() {
        let store = SessionStore::new();
        store.reconcile("b", full_with(&[])).await.unwrap();
        store.reconcile("a", full_with(&[])).await.unwrap();

        let ids: Vec<String> = store.list().await.into_iter().map(|s| s.session_id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(store.remove("a"));
        assert!(!store.remove("a"));
        assert_eq!(store.len(), 1);
        assert!(store.snapshot("a").await.is_none());
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let store = SessionStore::new();
        store.reconcile("old", full_with(&[])).await.unwrap();

        assert!(store.evict_idle(Duration::from_secs(3600)).is_empty());
        tokio::time::sleep(Duration::from_millis(200)).await;
        store.reconcile("fresh", full_with(&[])).await.unwrap();

        assert_eq!(store.evict_idle(Duration::from_millis(100)), vec!["old"]);
        assert!(store.snapshot("old").await.is_none());
        assert!(store.snapshot("fresh").await.is_some());
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_and_owner_cleans_up() {
        let store = SessionStore::new();
        let lease = store.lease("ws").unwrap();
        assert!(lease.owns_session());
        assert!(store.lease("ws").is_none());

        store.reconcile("ws", full_with(&["obj_1"])).await.unwrap();
        drop(lease);
        assert!(!store.contains("ws"));
        assert!(store.lease("ws").is_some());
    }

    #[tokio::test]
    async fn test_lease_on_existing_session_keeps_it() {
        let store = SessionStore::new();
        store.reconcile("shared", full_with(&["obj_1"])).await.unwrap();

        let lease = store.lease("shared").unwrap();
        assert!(!lease.owns_session());
        drop(lease);
        assert!(store.snapshot("shared").await.is_some());
    }

    #[tokio::test]
    async fn test_leased_session_is_not_evicted() {
        let store = SessionStore::new();
        let _lease = store.lease("live").unwrap();
        store.reconcile("live", full_with(&[])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(store.evict_idle(Duration::from_millis(10)).is_empty());
        assert!(store.contains("live"));
    }

    #[tokio::test]
    async fn test_sweep_releases_rate_limit_windows() {
        let store = SessionStore::new();
        let limiter = RateLimiter::new(10, Duration::from_secs(60));
        store.reconcile("gone", full_with(&[])).await.unwrap();
        limiter.check("gone").unwrap();
        limiter.check("never-stored").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(sweep(&store, &limiter, Duration::from_millis(10)), 1);
        assert_eq!(limiter.tracked(), 1);

        let short = RateLimiter::new(10, Duration::from_millis(10));
        short.check("never-stored").unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        sweep(&store, &short, Duration::from_secs(3600));
        assert_eq!(short.tracked(), 0);
    }
}
