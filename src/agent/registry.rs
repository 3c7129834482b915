//! Agent registry — opaque string IDs mapped to per-agent server state.
//!
//! The registry owns what outlives any single turn or connection: the
//! driver handle and the transcript. Turn serialization state lives in the
//! coordinator, keyed by the same IDs.

use super::{AgentDriver, is_valid_agent_id};
use crate::session::Transcript;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid agent id")]
    InvalidId,
    #[error("agent already exists: {0}")]
    AlreadyExists(String),
}

/// Per-agent server state shared across handlers.
pub struct AgentHandle {
    pub id: String,
    pub driver: Arc<dyn AgentDriver>,
    pub transcript: Transcript,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("id", &self.id)
            .field("transcript", &self.transcript)
            .finish()
    }
}

/// Map of live agents. Creation uses one default driver factory; callers
/// that want heterogeneous drivers register handles directly.
pub struct AgentRegistry {
    default_driver: Arc<dyn AgentDriver>,
    agents: Mutex<HashMap<String, Arc<AgentHandle>>>,
}

impl AgentRegistry {
    pub fn new(default_driver: Arc<dyn AgentDriver>) -> Self {
        Self {
            default_driver,
            agents: Mutex::new(HashMap::new()),
        }
    }

    /// Create an agent with the given ID, or a generated one when absent.
    pub fn create(&self, agent_id: Option<String>) -> Result<Arc<AgentHandle>, RegistryError> {
        let id = match agent_id {
            Some(id) => {
                if !is_valid_agent_id(&id) {
                    return Err(RegistryError::InvalidId);
                }
                id
            }
            None => Uuid::new_v4().to_string(),
        };

        let handle = Arc::new(AgentHandle {
            id: id.clone(),
            driver: Arc::clone(&self.default_driver),
            transcript: Transcript::new(),
        });

        let mut agents = self.agents.lock();
        if agents.contains_key(&id) {
            return Err(RegistryError::AlreadyExists(id));
        }
        agents.insert(id.clone(), Arc::clone(&handle));
        drop(agents);

        info!(agent_id = %id, "agent created");
        Ok(handle)
    }

    /// Register a pre-built handle (used by embedders and tests that need a
    /// custom driver).
    pub fn insert(&self, handle: Arc<AgentHandle>) -> Result<(), RegistryError> {
        if !is_valid_agent_id(&handle.id) {
            return Err(RegistryError::InvalidId);
        }
        let mut agents = self.agents.lock();
        if agents.contains_key(&handle.id) {
            return Err(RegistryError::AlreadyExists(handle.id.clone()));
        }
        agents.insert(handle.id.clone(), handle);
        Ok(())
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentHandle>> {
        self.agents.lock().get(agent_id).cloned()
    }

    /// Remove an agent; returns whether it existed.
    pub fn remove(&self, agent_id: &str) -> bool {
        let removed = self.agents.lock().remove(agent_id).is_some();
        if removed {
            info!(agent_id, "agent destroyed");
        }
        removed
    }

    /// Sorted agent IDs, for `list_agents`.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.agents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.lock().is_empty()
    }
}
