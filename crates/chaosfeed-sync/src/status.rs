use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopKind {
    Events,
    Reactions,
    Discussions,
}

impl LoopKind {
    pub const ALL: [LoopKind; 3] = [LoopKind::Events, LoopKind::Reactions, LoopKind::Discussions];

    pub fn as_str(self) -> &'static str {
        match self {
            LoopKind::Events => "events_api",
            LoopKind::Reactions => "reactions",
            LoopKind::Discussions => "discussions",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopStatus {
    pub last_poll: Option<DateTime<Utc>>,
    pub status: String,
}

impl Default for LoopStatus {
    fn default() -> Self {
        Self {
            last_poll: None,
            status: "idle".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngesterStatus {
    pub events: LoopStatus,
    pub reactions: LoopStatus,
    pub discussions: LoopStatus,
}

impl IngesterStatus {
    pub fn get(&self, kind: LoopKind) -> &LoopStatus {
        match kind {
            LoopKind::Events => &self.events,
            LoopKind::Reactions => &self.reactions,
            LoopKind::Discussions => &self.discussions,
        }
    }

    fn get_mut(&mut self, kind: LoopKind) -> &mut LoopStatus {
        match kind {
            LoopKind::Events => &mut self.events,
            LoopKind::Reactions => &mut self.reactions,
            LoopKind::Discussions => &mut self.discussions,
        }
    }
}

/// Per-loop status behind its own lock, independent of the open-item cache.
#[derive(Debug, Default)]
pub struct StatusBoard {
    inner: RwLock<IngesterStatus>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the start of a cycle. Recorded before any work happens.
    pub async fn begin(&self, kind: LoopKind) {
        let mut status = self.inner.write().await;
        let entry = status.get_mut(kind);
        entry.last_poll = Some(Utc::now());
        entry.status = "running".to_string();
    }

    pub async fn ok(&self, kind: LoopKind) {
        self.set(kind, "ok").await;
    }

    pub async fn error(&self, kind: LoopKind, detail: impl std::fmt::Display) {
        self.set(kind, format!("error: {detail}")).await;
    }

    pub async fn disabled(&self, kind: LoopKind) {
        self.set(kind, "disabled").await;
    }

    async fn set(&self, kind: LoopKind, status: impl Into<String>) {
        self.inner.write().await.get_mut(kind).status = status.into();
    }

    pub async fn snapshot(&self) -> IngesterStatus {
        self.inner.read().await.clone()
    }
}
