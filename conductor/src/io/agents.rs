//! Active agent registry.
//!
//! Observability only: the scheduler never reads it. Task status in the
//! store decides what runs; this records who is working on what right now.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use chrono::Utc;
use tracing::{debug, warn};

use crate::core::types::{ActiveAgent, AgentRole};
use crate::io::store::TaskStore;

pub struct AgentRegistry {
    agents: Mutex<BTreeMap<String, ActiveAgent>>,
    store: Option<Arc<TaskStore>>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: Mutex::new(BTreeMap::new()),
            store: None,
        }
    }

    /// Also write registrations to the store's `active_agents` table so other
    /// processes can observe them.
    pub fn with_store(store: Arc<TaskStore>) -> Self {
        Self {
            agents: Mutex::new(BTreeMap::new()),
            store: Some(store),
        }
    }

    /// Register (or replace) the agent working on `task_id`.
    pub fn register(
        &self,
        task_id: &str,
        role: AgentRole,
        slot: usize,
        worktree: Option<String>,
    ) -> Result<ActiveAgent> {
        let agent = ActiveAgent {
            task_id: task_id.to_string(),
            role,
            slot,
            worktree,
            started_at: Utc::now(),
        };
        self.lock()?.insert(task_id.to_string(), agent.clone());
        if let Some(store) = &self.store
            && let Err(err) = store.register_agent(&agent)
        {
            warn!(task_id, err = %format!("{err:#}"), "agent write-through failed");
        }
        debug!(task_id, role = %role, slot, "agent registered");
        Ok(agent)
    }

    /// Returns the removed registration, if any.
    pub fn deregister(&self, task_id: &str) -> Result<Option<ActiveAgent>> {
        let removed = self.lock()?.remove(task_id);
        if let Some(store) = &self.store
            && let Err(err) = store.deregister_agent(task_id)
        {
            warn!(task_id, err = %format!("{err:#}"), "agent write-through failed");
        }
        debug!(task_id, found = removed.is_some(), "agent deregistered");
        Ok(removed)
    }

    pub fn get(&self, task_id: &str) -> Result<Option<ActiveAgent>> {
        Ok(self.lock()?.get(task_id).cloned())
    }

    /// Snapshot ordered by task id.
    pub fn list(&self) -> Result<Vec<ActiveAgent>> {
        Ok(self.lock()?.values().cloned().collect())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, ActiveAgent>>> {
        self.agents
            .lock()
            .map_err(|_| anyhow!("agent registry poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_deregister_are_explicit() {
        let registry = AgentRegistry::new();
        registry
            .register("T-2", AgentRole::Tester, 1, None)
            .expect("register");
        registry
            .register("T-1", AgentRole::Coder, 0, Some(".worktrees/T-1".to_string()))
            .expect("register");

        let ids: Vec<String> = registry
            .list()
            .expect("list")
            .into_iter()
            .map(|a| a.task_id)
            .collect();
        assert_eq!(ids, vec!["T-1", "T-2"]);

        let removed = registry.deregister("T-1").expect("deregister");
        assert_eq!(removed.map(|a| a.role), Some(AgentRole::Coder));
        assert!(registry.deregister("T-1").expect("again").is_none());
    }

    #[test]
    fn registrations_are_written_through_to_the_store() {
        let store = Arc::new(TaskStore::open_in_memory().expect("store"));
        let registry = AgentRegistry::with_store(Arc::clone(&store));
        registry
            .register("T-1", AgentRole::Reviewer, 3, None)
            .expect("register");
        let persisted = store.list_agents().expect("agents");
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].slot, 3);

        registry.deregister("T-1").expect("deregister");
        assert!(store.list_agents().expect("agents").is_empty());
    }
}
