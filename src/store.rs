//! Persistence seam
//!
//! The core never talks to a backend directly; it hydrates from and
//! flushes to these traits. The in-memory implementation backs tests and
//! single-process deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::directory::AgentProfile;
use crate::error::SwitchboardError;
use crate::tracker::SessionMetrics;
use crate::types::{AgentId, SessionId};

/// CRUD-by-id storage for worker profiles
#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn create(&self, profile: AgentProfile) -> Result<(), SwitchboardError>;
    async fn get(&self, id: AgentId) -> Result<Option<AgentProfile>, SwitchboardError>;
    async fn update(&self, profile: AgentProfile) -> Result<(), SwitchboardError>;
    async fn delete(&self, id: AgentId) -> Result<bool, SwitchboardError>;
    async fn list(&self) -> Result<Vec<AgentProfile>, SwitchboardError>;
}

/// CRUD-by-id storage for frozen session metrics
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn put(&self, metrics: SessionMetrics) -> Result<(), SwitchboardError>;
    async fn get(&self, id: SessionId) -> Result<Option<SessionMetrics>, SwitchboardError>;
    async fn delete(&self, id: SessionId) -> Result<bool, SwitchboardError>;
}

/// In-memory implementation of both stores
#[derive(Default)]
pub struct MemoryStore {
    agents: RwLock<HashMap<AgentId, AgentProfile>>,
    sessions: RwLock<HashMap<SessionId, SessionMetrics>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentStore for MemoryStore {
    async fn create(&self, profile: AgentProfile) -> Result<(), SwitchboardError> {
        self.agents.write().insert(profile.id, profile);
        Ok(())
    }

    async fn get(&self, id: AgentId) -> Result<Option<AgentProfile>, SwitchboardError> {
        Ok(self.agents.read().get(&id).cloned())
    }

    async fn update(&self, profile: AgentProfile) -> Result<(), SwitchboardError> {
        let mut agents = self.agents.write();
        if !agents.contains_key(&profile.id) {
            return Err(SwitchboardError::NotFound(format!("agent {}", profile.id)));
        }
        agents.insert(profile.id, profile);
        Ok(())
    }

    async fn delete(&self, id: AgentId) -> Result<bool, SwitchboardError> {
        Ok(self.agents.write().remove(&id).is_some())
    }

    async fn list(&self) -> Result<Vec<AgentProfile>, SwitchboardError> {
        Ok(self.agents.read().values().cloned().collect())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn put(&self, metrics: SessionMetrics) -> Result<(), SwitchboardError> {
        self.sessions.write().insert(metrics.session_id, metrics);
        Ok(())
    }

    async fn get(&self, id: SessionId) -> Result<Option<SessionMetrics>, SwitchboardError> {
        Ok(self.sessions.read().get(&id).cloned())
    }

    async fn delete(&self, id: SessionId) -> Result<bool, SwitchboardError> {
        Ok(self.sessions.write().remove(&id).is_some())
    }
}
