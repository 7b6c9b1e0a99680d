use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

/// Which bridge a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Enter,
    Attach,
}

impl SessionMode {
    pub fn label(self) -> &'static str {
        match self {
            SessionMode::Enter => "enter",
            SessionMode::Attach => "attach",
        }
    }
}

#[derive(Debug, Clone)]
struct SessionEntry {
    container_id: String,
    mode: SessionMode,
    started_at: OffsetDateTime,
}

/// Live sessions, kept only for the stats endpoint.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<Uuid, SessionEntry>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub container_id: String,
    pub mode: SessionMode,
    pub started_at: i64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a session until the returned guard is dropped.
    pub fn register(&self, container_id: &str, mode: SessionMode) -> SessionGuard {
        let session_id = Uuid::new_v4();
        self.sessions.insert(
            session_id,
            SessionEntry {
                container_id: container_id.to_string(),
                mode,
                started_at: OffsetDateTime::now_utc(),
            },
        );
        SessionGuard {
            registry: self.clone(),
            session_id,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> = self
            .sessions
            .iter()
            .map(|entry| SessionSnapshot {
                session_id: *entry.key(),
                container_id: entry.container_id.clone(),
                mode: entry.mode,
                started_at: entry.started_at.unix_timestamp(),
            })
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.started_at);
        snapshots
    }
}

pub struct SessionGuard {
    registry: SessionRegistry,
    session_id: Uuid,
}

impl SessionGuard {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.sessions.remove(&self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_removes_session_on_drop() {
        let registry = SessionRegistry::new();
        let enter = registry.register("c1", SessionMode::Enter);
        let attach = registry.register("c2", SessionMode::Attach);
        assert_eq!(registry.len(), 2);

        let snapshot = registry.snapshot();
        assert!(snapshot
            .iter()
            .any(|s| s.session_id == enter.session_id() && s.mode == SessionMode::Enter));

        drop(enter);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].container_id, "c2");

        drop(attach);
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_serializes_mode_in_lowercase() {
        let registry = SessionRegistry::new();
        let _guard = registry.register("c1", SessionMode::Attach);
        let json = serde_json::to_value(registry.snapshot()).unwrap();
        assert_eq!(json[0]["mode"], "attach");
        assert_eq!(json[0]["container_id"], "c1");
    }
}
