//! Per-connection conversation memory.
//!
//! Bounded in three directions: turns per session (oldest pairs dropped first),
//! idle time (entries untouched for `ttl` are never handed out again), and number
//! of sessions (least-recently-used entry makes room for a new one).

use crate::types::{ConversationTurn, RelayError, Result, Role, SessionId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub turns: Vec<ConversationTurn>,
    pub last_access: Instant,
}

impl Session {
    fn new(id: SessionId, now: Instant) -> Self {
        Self {
            id,
            turns: Vec::new(),
            last_access: now,
        }
    }
}

pub struct SessionStore {
    sessions: Mutex<HashMap<SessionId, Session>>,
    capacity: usize,
    ttl: Duration,
    max_turns: usize,
}

impl SessionStore {
    /// `max_turns` is rounded down to an even number so pairs are never split.
    pub fn new(capacity: usize, ttl: Duration, max_turns: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            ttl,
            max_turns: max_turns - max_turns % 2,
        }
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Session>> {
        // A panic while holding the lock cannot leave a map entry half-written.
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, session: &Session, now: Instant) -> bool {
        now.duration_since(session.last_access) >= self.ttl
    }

    /// Returns the live entry for `id`, creating (or recreating, if expired) an
    /// empty one. Admission may evict the least-recently-used session.
    fn live_entry<'a>(
        &self,
        map: &'a mut HashMap<SessionId, Session>,
        id: SessionId,
        now: Instant,
    ) -> &'a mut Session {
        let expired = map.get(&id).is_some_and(|s| self.is_expired(s, now));
        if expired {
            tracing::debug!("Session {} expired; starting fresh", id.short());
            map.remove(&id);
        }
        if !map.contains_key(&id) {
            self.make_room(map, now);
        }
        let session = map.entry(id).or_insert_with(|| Session::new(id, now));
        session.last_access = now;
        session
    }

    fn make_room(&self, map: &mut HashMap<SessionId, Session>, now: Instant) {
        if map.len() < self.capacity {
            return;
        }
        map.retain(|_, s| !self.is_expired(s, now));
        while map.len() >= self.capacity {
            let lru = map
                .values()
                .min_by_key(|s| s.last_access)
                .map(|s| s.id);
            match lru {
                Some(victim) => {
                    tracing::info!("Session store full; evicting LRU session {}", victim.short());
                    map.remove(&victim);
                }
                None => break,
            }
        }
    }

    /// Snapshot of the session, created empty if absent or expired.
    pub fn get(&self, id: SessionId) -> Session {
        let now = Instant::now();
        let mut map = self.lock();
        self.live_entry(&mut map, id, now).clone()
    }

    pub fn history(&self, id: SessionId) -> Vec<ConversationTurn> {
        self.get(id).turns
    }

    /// Commits one completed exchange and trims to the turn bound.
    /// Returns the number of turns retained.
    pub fn append_pair(
        &self,
        id: SessionId,
        user: ConversationTurn,
        assistant: ConversationTurn,
    ) -> Result<usize> {
        if user.role != Role::User || assistant.role != Role::Assistant {
            return Err(RelayError::Session(format!(
                "turn pair out of order: {:?}/{:?}",
                user.role, assistant.role
            ))
            .into());
        }

        let now = Instant::now();
        let mut map = self.lock();
        let session = self.live_entry(&mut map, id, now);
        session.turns.push(user);
        session.turns.push(assistant);
        let excess = session.turns.len().saturating_sub(self.max_turns);
        if excess > 0 {
            session.turns.drain(..excess);
        }
        Ok(session.turns.len())
    }

    pub fn clear(&self, id: SessionId) {
        let now = Instant::now();
        let mut map = self.lock();
        self.live_entry(&mut map, id, now).turns.clear();
    }

    /// Removes the session outright. Returns whether it was present.
    pub fn evict(&self, id: SessionId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Drops every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut map = self.lock();
        let before = map.len();
        map.retain(|_, s| !self.is_expired(s, now));
        before - map.len()
    }

    /// Number of sessions that `get` would still return.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .values()
            .filter(|s| !self.is_expired(s, now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: SessionId) -> bool {
        let now = Instant::now();
        self.lock()
            .get(&id)
            .is_some_and(|s| !self.is_expired(s, now))
    }
}

/// Background sweep so idle sessions are released even if nobody touches them.
pub fn spawn_sweeper(store: Arc<SessionStore>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every.max(Duration::from_millis(10)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let removed = store.purge_expired();
            if removed > 0 {
                tracing::debug!("Session sweep removed {} expired sessions", removed);
            }
        }
    })
}
