// In-memory session registry: the single owner of all live draft sessions.
//
// Enforces the capacity cap with oldest-first eviction and orchestrates
// persistence and the expiry sweep. All reads go through `get`; all
// mutation goes through session methods obtained via `get_mut`, invoked
// from the dispatcher's single execution lane.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::db::Database;
use crate::rooms::RoomProvider;
use crate::session::state::DraftSession;

pub struct SessionRegistry {
    sessions: HashMap<String, DraftSession>,
    capacity: usize,
}

impl SessionRegistry {
    pub fn new(capacity: usize) -> Self {
        SessionRegistry {
            sessions: HashMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, session_id: &str) -> Option<&DraftSession> {
        self.sessions.get(session_id)
    }

    pub fn get_mut(&mut self, session_id: &str) -> Option<&mut DraftSession> {
        self.sessions.get_mut(session_id)
    }

    pub fn all(&self) -> impl Iterator<Item = &DraftSession> {
        self.sessions.values()
    }

    /// Insert a new session, evicting the oldest one first if the registry
    /// is at capacity. Returns the evicted session id, if any.
    ///
    /// Eviction is strict FIFO by creation time, not by activity: a session
    /// with recent activity is still evicted once enough newer sessions
    /// exist. The evicted session's rooms are released before it is
    /// dropped. Structural changes (the insert and any eviction) are
    /// persisted immediately; in-place field mutations are picked up by the
    /// periodic persist instead.
    pub async fn add(
        &mut self,
        session: DraftSession,
        rooms: &dyn RoomProvider,
        db: &Database,
    ) -> Result<Option<String>> {
        let mut evicted_id = None;
        while self.sessions.len() >= self.capacity {
            let Some(oldest_id) = self.oldest_session_id() else {
                break;
            };
            warn!(
                "registry at capacity ({}), evicting oldest session {oldest_id}",
                self.capacity
            );
            if let Some(evicted) = self.sessions.remove(&oldest_id) {
                release_rooms(&evicted, rooms).await;
                if let Err(e) = db.delete_session(&evicted.session_id) {
                    warn!("failed to delete evicted session {oldest_id}: {e:#}");
                }
            }
            evicted_id = Some(oldest_id);
        }

        db.save_session(&session)?;
        info!(
            "session {} added to registry ({} live)",
            session.session_id,
            self.sessions.len() + 1
        );
        self.sessions.insert(session.session_id.clone(), session);
        Ok(evicted_id)
    }

    /// Remove a session, releasing its rooms and deleting its stored row.
    pub async fn remove(
        &mut self,
        session_id: &str,
        rooms: &dyn RoomProvider,
        db: &Database,
    ) -> Result<Option<DraftSession>> {
        let Some(session) = self.sessions.remove(session_id) else {
            return Ok(None);
        };
        release_rooms(&session, rooms).await;
        db.delete_session(session_id)?;
        info!("session {session_id} removed from registry");
        Ok(Some(session))
    }

    /// Serialize every live session to durable storage.
    pub fn persist_all(&self, db: &Database) -> Result<()> {
        for session in self.sessions.values() {
            db.save_session(session)?;
        }
        Ok(())
    }

    /// Reconstruct the registry from durable storage at startup.
    ///
    /// Sessions already expired on load are deleted instead of re-entering
    /// the active set. Returns the registry and the number of dropped
    /// sessions.
    pub fn load(db: &Database, capacity: usize) -> Result<(Self, usize)> {
        let mut registry = SessionRegistry::new(capacity);
        let now = Utc::now();
        let mut dropped = 0;

        for session in db.load_all()? {
            if session.is_expired(now) {
                if let Err(e) = db.delete_session(&session.session_id) {
                    warn!(
                        "failed to delete expired session {} on load: {e:#}",
                        session.session_id
                    );
                }
                dropped += 1;
            } else {
                registry
                    .sessions
                    .insert(session.session_id.clone(), session);
            }
        }

        Ok((registry, dropped))
    }

    /// Remove every session whose expiry has passed, releasing resources.
    ///
    /// Failures on one session are logged and do not abort the rest of the
    /// sweep; the session leaves the active set regardless, so cleanup is
    /// attempted at least once but never blocks capacity.
    pub async fn sweep_expired(
        &mut self,
        now: DateTime<Utc>,
        rooms: &dyn RoomProvider,
        db: &Database,
    ) -> Vec<String> {
        let expired: Vec<String> = self
            .sessions
            .values()
            .filter(|session| session.is_expired(now))
            .map(|session| session.session_id.clone())
            .collect();

        for session_id in &expired {
            if let Some(session) = self.sessions.remove(session_id) {
                release_rooms(&session, rooms).await;
                if let Err(e) = db.delete_session(session_id) {
                    warn!("failed to delete expired session {session_id}: {e:#}");
                }
                info!("expired session {session_id} swept");
            }
        }
        expired
    }

    /// Id of the session with the earliest embedded creation timestamp,
    /// with the id as a deterministic tie-break.
    fn oldest_session_id(&self) -> Option<String> {
        self.sessions
            .values()
            .min_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.session_id.cmp(&b.session_id))
            })
            .map(|session| session.session_id.clone())
    }
}

/// Best-effort release of a session's provisioned rooms. A room that is
/// already gone counts as released; failures are logged and skipped.
pub async fn release_rooms(session: &DraftSession, rooms: &dyn RoomProvider) {
    for room_id in &session.channel_ids {
        if let Err(e) = rooms.delete(room_id).await {
            warn!(
                "failed to delete room {room_id} for session {}: {e:#}",
                session.session_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::testing::RecordingRooms;
    use crate::session::state::SessionType;
    use chrono::{Duration, TimeZone};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn test_db() -> Database {
        Database::open(":memory:").unwrap()
    }

    /// Session created `minutes` after a fixed origin.
    fn session_at(creator: &str, minutes: i64) -> DraftSession {
        let created_at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
            + Duration::minutes(minutes);
        DraftSession::new(
            creator,
            SessionType::Random,
            "vintage-cube",
            created_at,
            Duration::hours(7),
            &mut StdRng::seed_from_u64(minutes as u64),
        )
    }

    #[tokio::test]
    async fn add_and_get() {
        let db = test_db();
        let rooms = RecordingRooms::default();
        let mut registry = SessionRegistry::new(20);

        let session = session_at("alice", 0);
        let id = session.session_id.clone();
        registry.add(session, &rooms, &db).await.unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.get(&id).is_some());
        assert!(registry.get("missing").is_none());
        // Structural change persisted immediately.
        assert_eq!(db.session_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn twenty_first_session_evicts_exactly_the_oldest() {
        let db = test_db();
        let rooms = RecordingRooms::default();
        let mut registry = SessionRegistry::new(20);

        let mut ids = Vec::new();
        for i in 0..20 {
            let session = session_at(&format!("user{i}"), i);
            ids.push(session.session_id.clone());
            registry.add(session, &rooms, &db).await.unwrap();
        }
        assert_eq!(registry.len(), 20);

        let newcomer = session_at("late", 30);
        let newcomer_id = newcomer.session_id.clone();
        let evicted = registry.add(newcomer, &rooms, &db).await.unwrap();

        assert_eq!(evicted.as_deref(), Some(ids[0].as_str()));
        assert_eq!(registry.len(), 20);
        assert!(registry.get(&ids[0]).is_none());
        assert!(registry.get(&newcomer_id).is_some());
        // Every other session survived.
        for id in &ids[1..] {
            assert!(registry.get(id).is_some(), "{id} was wrongly evicted");
        }
        assert!(db.load_session(&ids[0]).unwrap().is_none());
    }

    #[tokio::test]
    async fn eviction_releases_the_evicted_sessions_rooms() {
        let db = test_db();
        let rooms = RecordingRooms::default();
        let mut registry = SessionRegistry::new(1);

        let mut old = session_at("alice", 0);
        old.channel_ids = vec!["room-a".to_string(), "room-b".to_string()];
        registry.add(old, &rooms, &db).await.unwrap();

        registry
            .add(session_at("bob", 5), &rooms, &db)
            .await
            .unwrap();

        assert_eq!(
            rooms.deleted_ids(),
            vec!["room-a".to_string(), "room-b".to_string()]
        );
    }

    #[tokio::test]
    async fn remove_releases_rooms_and_deletes_row() {
        let db = test_db();
        let rooms = RecordingRooms::default();
        let mut registry = SessionRegistry::new(20);

        let mut session = session_at("alice", 0);
        session.channel_ids = vec!["room-1".to_string()];
        let id = session.session_id.clone();
        registry.add(session, &rooms, &db).await.unwrap();

        let removed = registry.remove(&id, &rooms, &db).await.unwrap();
        assert!(removed.is_some());
        assert!(registry.is_empty());
        assert_eq!(rooms.deleted_ids(), vec!["room-1".to_string()]);
        assert!(db.load_session(&id).unwrap().is_none());

        // Removing an unknown id is not an error.
        assert!(registry.remove(&id, &rooms, &db).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_sessions() {
        let db = test_db();
        let rooms = RecordingRooms::default();
        let mut registry = SessionRegistry::new(20);

        let expired = session_at("alice", 0);
        let expired_id = expired.session_id.clone();
        let fresh = session_at("bob", 10);
        let fresh_id = fresh.session_id.clone();
        let now = fresh.created_at + Duration::hours(7) - Duration::minutes(1);

        registry.add(expired, &rooms, &db).await.unwrap();
        registry.add(fresh, &rooms, &db).await.unwrap();

        let swept = registry.sweep_expired(now, &rooms, &db).await;
        assert_eq!(swept, vec![expired_id.clone()]);
        assert!(registry.get(&expired_id).is_none());
        assert!(registry.get(&fresh_id).is_some());
        assert!(db.load_session(&expired_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_tolerates_room_release_failure() {
        let db = test_db();
        let rooms = RecordingRooms::default();
        rooms.set_fail_deletes(true);
        let mut registry = SessionRegistry::new(20);

        let mut first = session_at("alice", 0);
        first.channel_ids = vec!["room-1".to_string()];
        let first_id = first.session_id.clone();
        let mut second = session_at("bob", 1);
        second.channel_ids = vec!["room-2".to_string()];
        let second_id = second.session_id.clone();

        registry.add(first, &rooms, &db).await.unwrap();
        registry.add(second, &rooms, &db).await.unwrap();

        let now = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        let swept = registry.sweep_expired(now, &rooms, &db).await;

        // Both sessions swept despite every room deletion failing.
        assert_eq!(swept.len(), 2);
        assert!(registry.is_empty());
        assert!(db.load_session(&first_id).unwrap().is_none());
        assert!(db.load_session(&second_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn load_restores_live_and_drops_expired() {
        let db = test_db();
        let rooms = RecordingRooms::default();

        {
            let mut registry = SessionRegistry::new(20);
            // Expired long ago relative to the real clock used by load().
            registry
                .add(session_at("alice", 0), &rooms, &db)
                .await
                .unwrap();
            // Fresh: expires seven hours from now.
            let live = DraftSession::new(
                "bob",
                SessionType::Random,
                "vintage-cube",
                Utc::now(),
                Duration::hours(7),
                &mut StdRng::seed_from_u64(99),
            );
            registry.add(live, &rooms, &db).await.unwrap();
        }

        let (restored, dropped) = SessionRegistry::load(&db, 20).unwrap();
        assert_eq!(dropped, 1);
        assert_eq!(restored.len(), 1);
        assert!(restored.all().all(|s| s.session_id.starts_with("bob-")));
        // The expired row is gone from storage too.
        assert_eq!(db.session_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn persist_all_writes_mutated_state() {
        let db = test_db();
        let rooms = RecordingRooms::default();
        let mut registry = SessionRegistry::new(20);

        let session = session_at("alice", 0);
        let id = session.session_id.clone();
        registry.add(session, &rooms, &db).await.unwrap();

        // Mutate in place; storage still has the old state.
        registry
            .get_mut(&id)
            .unwrap()
            .sign_up("p0", "Player 0")
            .unwrap();
        assert!(db.load_session(&id).unwrap().unwrap().sign_ups.is_empty());

        registry.persist_all(&db).unwrap();
        assert_eq!(db.load_session(&id).unwrap().unwrap().sign_ups.len(), 1);
    }
}
