//! Session-id to handle bookkeeping. Pure state, no policy: creation,
//! teardown, and pruning decisions belong to the orchestrator.

use std::collections::HashMap;

use tokio::time::{Duration, Instant};

/// Extract the logical-conversation prefix from a structured session id.
///
/// Session ids of the form `agent:conversation:epoch` (exactly three
/// colon-separated segments) identify the same logical conversation whenever
/// the first two segments match; the trailing segment changes across client
/// reconnects. Unstructured ids have no logical prefix.
pub fn logical_prefix(session_id: &str) -> Option<&str> {
    if session_id.match_indices(':').count() != 2 {
        return None;
    }
    let last_colon = session_id.rfind(':')?;
    let prefix = &session_id[..last_colon];
    if prefix.split(':').any(str::is_empty) || session_id[last_colon + 1..].is_empty() {
        return None;
    }
    Some(prefix)
}

#[derive(Debug)]
pub struct PooledSession<H> {
    pub handle: H,
    pub last_seen: Instant,
}

#[derive(Debug)]
pub struct SessionPool<H> {
    sessions: HashMap<String, PooledSession<H>>,
}

impl<H> Default for SessionPool<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> SessionPool<H> {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// Insert a freshly created session. The caller must have torn down any
    /// previous handle for this id first; at most one live handle may exist
    /// per session id.
    pub fn insert(&mut self, session_id: impl Into<String>, handle: H, now: Instant) {
        let session_id = session_id.into();
        debug_assert!(
            !self.sessions.contains_key(&session_id),
            "SessionPool: replacing a live handle for {session_id}"
        );
        self.sessions.insert(
            session_id,
            PooledSession {
                handle,
                last_seen: now,
            },
        );
    }

    pub fn get_mut(&mut self, session_id: &str) -> Option<&mut PooledSession<H>> {
        self.sessions.get_mut(session_id)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn remove(&mut self, session_id: &str) -> Option<H> {
        self.sessions.remove(session_id).map(|s| s.handle)
    }

    pub fn drain(&mut self) -> Vec<(String, H)> {
        self.sessions
            .drain()
            .map(|(id, session)| (id, session.handle))
            .collect()
    }

    pub fn touch(&mut self, session_id: &str, now: Instant) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.last_seen = now;
        }
    }

    /// Session ids whose `last_seen` exceeds the idle TTL.
    pub fn idle_ids(&self, now: Instant, idle_ttl: Duration) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|(_, session)| now.duration_since(session.last_seen) >= idle_ttl)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Other pooled sessions backing the same logical conversation as
    /// `session_id`. These must be torn down before a new physical session
    /// for the conversation is created.
    pub fn logical_siblings(&self, session_id: &str) -> Vec<String> {
        let Some(prefix) = logical_prefix(session_id) else {
            return Vec::new();
        };
        self.sessions
            .keys()
            .filter(|id| id.as_str() != session_id && logical_prefix(id) == Some(prefix))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::{Duration, Instant};

    use super::{logical_prefix, SessionPool};

    #[test]
    fn logical_prefix_requires_three_segments() {
        assert_eq!(logical_prefix("agent:conv:epoch1"), Some("agent:conv"));
        assert_eq!(logical_prefix("plain-session"), None);
        assert_eq!(logical_prefix("a:b"), None);
        assert_eq!(logical_prefix("a:b:c:d"), None);
        assert_eq!(logical_prefix("a::c"), None);
        assert_eq!(logical_prefix("a:b:"), None);
    }

    #[tokio::test]
    async fn siblings_share_logical_prefix_only() {
        let now = Instant::now();
        let mut pool = SessionPool::new();
        pool.insert("agent:conv:1", 1u32, now);
        pool.insert("agent:conv:2", 2u32, now);
        pool.insert("agent:other:1", 3u32, now);
        pool.insert("plain", 4u32, now);

        let siblings = pool.logical_siblings("agent:conv:3");
        assert_eq!(siblings.len(), 2);
        assert!(siblings.contains(&"agent:conv:1".to_string()));
        assert!(siblings.contains(&"agent:conv:2".to_string()));

        assert!(pool.logical_siblings("plain").is_empty());
        assert!(pool.logical_siblings("agent:conv:1").len() == 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_ids_respect_last_seen() {
        let mut pool = SessionPool::new();
        pool.insert("s1", (), Instant::now());
        pool.insert("s2", (), Instant::now());

        tokio::time::advance(Duration::from_secs(500)).await;
        pool.touch("s2", Instant::now());
        tokio::time::advance(Duration::from_secs(200)).await;

        let idle = pool.idle_ids(Instant::now(), Duration::from_secs(600));
        assert_eq!(idle, vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn drain_empties_pool() {
        let now = Instant::now();
        let mut pool = SessionPool::new();
        pool.insert("s1", 1u32, now);
        pool.insert("s2", 2u32, now);
        let drained = pool.drain();
        assert_eq!(drained.len(), 2);
        assert!(pool.is_empty());
    }
}
