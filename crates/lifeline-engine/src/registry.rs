//! Connection registry.
//!
//! Owns every live [`ConnectionInfo`] together with its optional timeout
//! deadline. Both live in the same sharded-map entry, so inserting or
//! removing a connection inserts or removes its deadline in the same step.
//! No I/O ever happens while a shard guard is held.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use lifeline_core::{ConnectionId, EngineError, IdentityKey, Result, UserId};
use lifeline_telemetry::{MetricsCollector, Tags, names};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::transport::Transport;

/// One admitted connection.
pub struct ConnectionInfo {
    /// Per-socket id.
    pub connection_id: ConnectionId,
    /// Owning principal.
    pub user_id: UserId,
    /// Logical session this connection serves.
    pub identity: IdentityKey,
    /// Admission time.
    pub established_at: DateTime<Utc>,
    last_activity_at: Mutex<DateTime<Utc>>,
    transport: Arc<dyn Transport>,
}

impl ConnectionInfo {
    /// Describe a new connection with a freshly minted id.
    pub fn new(user_id: UserId, identity: IdentityKey, transport: Arc<dyn Transport>) -> Self {
        Self::with_id(ConnectionId::new(), user_id, identity, transport)
    }

    /// Describe a new connection with a caller-chosen id.
    pub fn with_id(
        connection_id: ConnectionId,
        user_id: UserId,
        identity: IdentityKey,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let now = Utc::now();
        Self {
            connection_id,
            user_id,
            identity,
            established_at: now,
            last_activity_at: Mutex::new(now),
            transport,
        }
    }

    /// Transport handle.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Last inbound or outbound frame.
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        *self.last_activity_at.lock()
    }

    /// Mark activity now.
    pub fn touch(&self) {
        *self.last_activity_at.lock() = Utc::now();
    }
}

impl std::fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("connection_id", &self.connection_id)
            .field("user_id", &self.user_id)
            .field("identity", &self.identity)
            .field("established_at", &self.established_at)
            .finish_non_exhaustive()
    }
}

struct Entry {
    info: Arc<ConnectionInfo>,
    timeout_at: Option<Instant>,
}

/// Concurrent map of live connections and their deadlines.
pub struct ConnectionRegistry {
    entries: DashMap<ConnectionId, Entry>,
    count: AtomicUsize,
    max_connections: usize,
    metrics: Arc<MetricsCollector>,
}

impl ConnectionRegistry {
    /// Create an empty registry admitting at most `max_connections`.
    pub fn new(max_connections: usize, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            entries: DashMap::new(),
            count: AtomicUsize::new(0),
            max_connections: max_connections.max(1),
            metrics,
        }
    }

    /// Register a connection that never times out.
    pub fn register(&self, info: ConnectionInfo) -> Result<ConnectionId> {
        self.insert(info, None)
    }

    /// Register a connection with an initial deadline.
    pub fn register_with_timeout(
        &self,
        info: ConnectionInfo,
        timeout_at: Instant,
    ) -> Result<ConnectionId> {
        self.insert(info, Some(timeout_at))
    }

    fn insert(&self, info: ConnectionInfo, timeout_at: Option<Instant>) -> Result<ConnectionId> {
        let limit = self.max_connections;
        if self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c < limit).then_some(c + 1)
            })
            .is_err()
        {
            self.metrics
                .record_counter(names::CONNECTIONS_REJECTED_TOTAL, 1.0, Tags::new());
            return Err(EngineError::CapacityExceeded { limit });
        }

        let id = info.connection_id.clone();
        match self.entries.entry(id.clone()) {
            MapEntry::Occupied(_) => {
                let _ = self.count.fetch_sub(1, Ordering::AcqRel);
                return Err(EngineError::Internal(format!(
                    "connection {id} is already registered"
                )));
            }
            MapEntry::Vacant(slot) => {
                let _ = slot.insert(Entry {
                    info: Arc::new(info),
                    timeout_at,
                });
            }
        }

        debug!(conn_id = %id, "connection registered");
        self.metrics
            .record_counter(names::CONNECTIONS_REGISTERED_TOTAL, 1.0, Tags::new());
        self.record_active();
        Ok(id)
    }

    /// Look up a connection.
    pub fn lookup(&self, id: &ConnectionId) -> Result<Arc<ConnectionInfo>> {
        self.entries
            .get(id)
            .map(|e| e.info.clone())
            .ok_or_else(|| EngineError::NotFound(id.clone()))
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.entries.contains_key(id)
    }

    /// Remove a connection and its deadline. Absent ids are a no-op.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<ConnectionInfo>> {
        let (_, entry) = self.entries.remove(id)?;
        let _ = self.count.fetch_sub(1, Ordering::AcqRel);
        debug!(conn_id = %id, "connection removed");
        self.metrics
            .record_counter(names::CONNECTIONS_REMOVED_TOTAL, 1.0, Tags::new());
        self.record_active();
        Some(entry.info)
    }

    /// Snapshot of every registered connection.
    pub fn list_all(&self) -> Vec<Arc<ConnectionInfo>> {
        self.entries.iter().map(|e| e.info.clone()).collect()
    }

    /// Snapshot of every registered id.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Admission limit.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    // ── Deadlines ───────────────────────────────────────────────────

    /// Set the deadline of `id`. Returns false when `id` is absent.
    pub fn extend_timeout(&self, id: &ConnectionId, timeout_at: Instant) -> bool {
        if let Some(mut e) = self.entries.get_mut(id) {
            e.timeout_at = Some(timeout_at);
            true
        } else {
            false
        }
    }

    /// Drop the deadline of `id` so it never times out.
    pub fn clear_timeout(&self, id: &ConnectionId) -> bool {
        if let Some(mut e) = self.entries.get_mut(id) {
            e.timeout_at = None;
            true
        } else {
            false
        }
    }

    /// Move the deadline of `id` to now so the next cleanup pass evicts it.
    pub fn expire_now(&self, id: &ConnectionId) -> bool {
        self.extend_timeout(id, Instant::now())
    }

    /// Current deadline of `id`, if any.
    pub fn timeout_at(&self, id: &ConnectionId) -> Option<Instant> {
        self.entries.get(id).and_then(|e| e.timeout_at)
    }

    /// Ids whose deadline is at or before `now`.
    pub fn expired(&self, now: Instant) -> Vec<ConnectionId> {
        self.entries
            .iter()
            .filter(|e| e.timeout_at.is_some_and(|t| t <= now))
            .map(|e| e.key().clone())
            .collect()
    }

    // ── Activity and grouping ───────────────────────────────────────

    /// Mark activity on `id`. Returns false when `id` is absent.
    pub fn touch(&self, id: &ConnectionId) -> bool {
        if let Some(e) = self.entries.get(id) {
            e.info.touch();
            true
        } else {
            false
        }
    }

    /// Connection count per owning user.
    pub fn per_user_counts(&self) -> HashMap<UserId, usize> {
        let mut counts = HashMap::new();
        for e in &self.entries {
            *counts.entry(e.info.user_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Connections currently serving `identity`.
    pub fn connections_for_identity(&self, identity: &IdentityKey) -> Vec<Arc<ConnectionInfo>> {
        self.entries
            .iter()
            .filter(|e| &e.info.identity == identity)
            .map(|e| e.info.clone())
            .collect()
    }

    /// Whether any registered connection serves `identity`.
    pub fn serves_identity(&self, identity: &IdentityKey) -> bool {
        self.entries.iter().any(|e| &e.info.identity == identity)
    }

    /// Remove everything, returning what was registered.
    pub fn drain(&self) -> Vec<Arc<ConnectionInfo>> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.remove(&id))
            .collect()
    }

    /// Remove everything.
    pub fn clear(&self) {
        let _ = self.drain();
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_active(&self) {
        self.metrics.record_gauge(
            names::CONNECTIONS_ACTIVE,
            self.count.load(Ordering::Acquire) as f64,
            Tags::new(),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::info;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(100, Arc::new(MetricsCollector::default()))
    }

    #[test]
    fn register_and_lookup() {
        let reg = registry();
        let id = reg.register(info("c1", "alice")).unwrap();
        let found = reg.lookup(&id).unwrap();
        assert_eq!(found.user_id.as_str(), "alice");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn lookup_missing_is_not_found() {
        let reg = registry();
        assert_matches!(
            reg.lookup(&ConnectionId::from("nope")),
            Err(EngineError::NotFound(id)) if id.as_str() == "nope"
        );
    }

    #[test]
    fn remove_is_idempotent() {
        let reg = registry();
        let id = reg.register(info("c1", "alice")).unwrap();
        assert!(reg.remove(&id).is_some());
        assert!(reg.remove(&id).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn duplicate_id_rejected() {
        let reg = registry();
        let _ = reg.register(info("c1", "alice")).unwrap();
        assert_matches!(
            reg.register(info("c1", "bob")),
            Err(EngineError::Internal(_))
        );
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.lookup(&"c1".into()).unwrap().user_id.as_str(), "alice");
    }

    #[test]
    fn capacity_enforced() {
        let reg = ConnectionRegistry::new(2, Arc::new(MetricsCollector::default()));
        let _ = reg.register(info("a", "u")).unwrap();
        let _ = reg.register(info("b", "u")).unwrap();
        assert_matches!(
            reg.register(info("c", "u")),
            Err(EngineError::CapacityExceeded { limit: 2 })
        );
        let _ = reg.remove(&"a".into());
        assert!(reg.register(info("c", "u")).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn remove_drops_deadline_with_entry() {
        let reg = registry();
        let deadline = Instant::now() + Duration::from_secs(5);
        let id = reg.register_with_timeout(info("c1", "u"), deadline).unwrap();
        assert_eq!(reg.timeout_at(&id), Some(deadline));
        let _ = reg.remove(&id);
        assert_eq!(reg.timeout_at(&id), None);
        assert!(reg.expired(Instant::now() + Duration::from_secs(60)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_respects_deadlines() {
        let reg = registry();
        let now = Instant::now();
        let _ = reg
            .register_with_timeout(info("soon", "u"), now + Duration::from_secs(1))
            .unwrap();
        let _ = reg
            .register_with_timeout(info("later", "u"), now + Duration::from_secs(10))
            .unwrap();
        let _ = reg.register(info("never", "u")).unwrap();

        assert!(reg.expired(now).is_empty());
        let due = reg.expired(now + Duration::from_secs(2));
        assert_eq!(due, vec![ConnectionId::from("soon")]);
        assert_eq!(reg.expired(now + Duration::from_secs(3600)).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn extend_clear_and_expire() {
        let reg = registry();
        let now = Instant::now();
        let id = reg
            .register_with_timeout(info("c1", "u"), now + Duration::from_secs(1))
            .unwrap();

        assert!(reg.extend_timeout(&id, now + Duration::from_secs(30)));
        assert!(reg.expired(now + Duration::from_secs(5)).is_empty());

        assert!(reg.clear_timeout(&id));
        assert_eq!(reg.timeout_at(&id), None);

        assert!(reg.expire_now(&id));
        assert_eq!(reg.expired(Instant::now()), vec![id]);

        assert!(!reg.extend_timeout(&"ghost".into(), now));
    }

    #[test]
    fn per_user_and_identity_grouping() {
        let reg = registry();
        let _ = reg.register(info("a", "alice")).unwrap();
        let _ = reg.register(info("b", "alice")).unwrap();
        let _ = reg.register(info("c", "bob")).unwrap();
        let counts = reg.per_user_counts();
        assert_eq!(counts[&UserId::from("alice")], 2);
        assert_eq!(counts[&UserId::from("bob")], 1);

        let serving = reg.connections_for_identity(&IdentityKey::from("session-b"));
        assert_eq!(serving.len(), 1);
        assert_eq!(serving[0].connection_id.as_str(), "b");
        assert!(reg.serves_identity(&IdentityKey::from("session-b")));
        assert!(!reg.serves_identity(&IdentityKey::from("session-z")));
    }

    #[test]
    fn touch_updates_activity() {
        let reg = registry();
        let id = reg.register(info("c1", "u")).unwrap();
        let before = reg.lookup(&id).unwrap().last_activity_at();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(reg.touch(&id));
        assert!(reg.lookup(&id).unwrap().last_activity_at() > before);
        assert!(!reg.touch(&"ghost".into()));
    }

    #[test]
    fn drain_empties_registry() {
        let reg = registry();
        let _ = reg.register(info("a", "u")).unwrap();
        let _ = reg.register(info("b", "u")).unwrap();
        assert_eq!(reg.drain().len(), 2);
        assert!(reg.is_empty());
        // capacity accounting is released too
        let small = ConnectionRegistry::new(1, Arc::new(MetricsCollector::default()));
        let _ = small.register(info("x", "u")).unwrap();
        small.clear();
        assert!(small.register(info("y", "u")).is_ok());
    }

    #[test]
    fn active_gauge_tracks_count() {
        let metrics = Arc::new(MetricsCollector::default());
        let reg = ConnectionRegistry::new(10, metrics.clone());
        let _ = reg.register(info("a", "u")).unwrap();
        let _ = reg.register(info("b", "u")).unwrap();
        let _ = reg.remove(&"a".into());
        assert_eq!(
            metrics.get_metric_values(names::CONNECTIONS_ACTIVE, None),
            vec![1.0, 2.0, 1.0]
        );
    }

    #[test]
    fn concurrent_register_remove_is_consistent() {
        let reg = Arc::new(ConnectionRegistry::new(
            10_000,
            Arc::new(MetricsCollector::default()),
        ));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let id = format!("t{t}-{i}");
                        let _ = reg.register(info(&id, "u")).unwrap();
                        if i % 2 == 0 {
                            let _ = reg.remove(&ConnectionId::from(id.as_str()));
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.len(), 8 * 100);
        let listed = reg.ids();
        assert_eq!(listed.len(), 8 * 100);
        assert!(listed.iter().all(|id| id.ends_with('1')
            || id.ends_with('3')
            || id.ends_with('5')
            || id.ends_with('7')
            || id.ends_with('9')));
    }

    #[derive(Clone, Debug)]
    enum Op {
        Register(u8),
        Remove(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..16).prop_map(Op::Register),
            (0u8..16).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn list_all_matches_model(ops in proptest::collection::vec(op(), 0..64)) {
            let reg = registry();
            let mut model = std::collections::BTreeSet::new();
            for op in ops {
                match op {
                    Op::Register(n) => {
                        let id = format!("c{n}");
                        let ok = reg.register(info(&id, "u")).is_ok();
                        prop_assert_eq!(ok, model.insert(id));
                    }
                    Op::Remove(n) => {
                        let id = format!("c{n}");
                        let removed = reg.remove(&ConnectionId::from(id.as_str())).is_some();
                        prop_assert_eq!(removed, model.remove(&id));
                    }
                }
                let mut listed: Vec<String> = reg
                    .list_all()
                    .iter()
                    .map(|i| i.connection_id.to_string())
                    .collect();
                listed.sort();
                prop_assert_eq!(listed, model.iter().cloned().collect::<Vec<_>>());
            }
        }
    }
}
