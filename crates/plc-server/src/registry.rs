//! In-process agent registry: the stateful heart of the control plane.
//!
//! Every rule in this module is pure with respect to the registry's own
//! map — no I/O, no clock reads beyond `Instant::now()` — so the
//! adoption/registration/rename logic can be unit tested without a
//! running HTTP server.

use plc_agent::config::{AgentWireConfig, PlcConfig};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Agents not heard from in this long are reported offline.
pub const LIVENESS_WINDOW: Duration = Duration::from_secs(30);

/// One agent's server-side record.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    /// Current node id this agent answers to.
    pub node_id: String,
    /// Display name.
    pub name: String,
    /// Last IP address observed in a heartbeat.
    pub ip: String,
    /// Whether the operator wants this agent's devices running.
    pub active: bool,
    /// Configured devices.
    pub plcs: Vec<PlcConfig>,
    /// Previous node id, set on a rename so an adoption can find this
    /// record from the old agent's heartbeat.
    pub original_id: Option<String>,
    /// When this agent last sent a heartbeat. `None` for a manually
    /// added agent that hasn't checked in yet.
    pub last_seen: Option<Instant>,
}

impl AgentRecord {
    fn new(node_id: String, name: String) -> Self {
        Self {
            node_id,
            name,
            ip: String::new(),
            active: true,
            plcs: Vec::new(),
            original_id: None,
            last_seen: None,
        }
    }

    /// Whether this agent counts as online right now.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.last_seen.is_some_and(|t| t.elapsed() < LIVENESS_WINDOW)
    }

    fn to_wire_config(&self, server_url: &str) -> AgentWireConfig {
        AgentWireConfig {
            server_url: server_url.to_string(),
            node_id: self.node_id.clone(),
            name: Some(self.name.clone()),
            original_id: self.original_id.clone(),
            plcs: self.plcs.clone(),
        }
    }
}

/// What the heartbeat handler should put in its HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatDecision {
    /// `"registered"`, `"ok"`, or `"adopted"`.
    pub status: &'static str,
    /// `"start"` or `"stop"`.
    pub command: &'static str,
    /// Present only for the adoption path.
    pub new_node_id: Option<String>,
}

/// A rename would collide with an id that already exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameCollision;

/// The fleet server's agent registry.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentRecord>>,
}

impl AgentRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, AgentRecord>> {
        self.agents.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, AgentRecord>> {
        self.agents.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// §4.9: dispatch one heartbeat. Mutates the registry (last-seen,
    /// adoption bookkeeping, config adoption) and returns the response
    /// the agent should receive.
    pub fn handle_heartbeat(
        &self,
        node_id: &str,
        ip: &str,
        name: Option<&str>,
        heartbeat_plcs: Option<&[PlcConfig]>,
    ) -> HeartbeatDecision {
        let mut agents = self.write();

        if let Some(agent) = agents.get_mut(node_id) {
            agent.last_seen = Some(Instant::now());
            agent.ip = ip.to_string();
            if agent.plcs.is_empty() {
                if let Some(plcs) = heartbeat_plcs {
                    if !plcs.is_empty() {
                        agent.plcs = plcs.to_vec();
                    }
                }
            }
            let command = if agent.active { "start" } else { "stop" };
            return HeartbeatDecision { status: "ok", command, new_node_id: None };
        }

        if let Some(new_id) = agents
            .values()
            .find(|a| a.original_id.as_deref() == Some(node_id))
            .map(|a| a.node_id.clone())
        {
            return HeartbeatDecision {
                status: "adopted",
                command: "stop",
                new_node_id: Some(new_id),
            };
        }

        let mut record = AgentRecord::new(node_id.to_string(), format!("Pending ({node_id})"));
        record.ip = ip.to_string();
        record.last_seen = Some(Instant::now());
        if let Some(display_name) = name {
            if !display_name.is_empty() {
                record.name = display_name.to_string();
            }
        }
        agents.insert(node_id.to_string(), record);
        HeartbeatDecision { status: "registered", command: "start", new_node_id: None }
    }

    /// `GET /api/config/{node_id}`.
    #[must_use]
    pub fn fetch_config(&self, node_id: &str, server_url: &str) -> Option<AgentWireConfig> {
        self.read().get(node_id).map(|agent| agent.to_wire_config(server_url))
    }

    /// Manual registration via the operator API.
    pub fn add_agent(&self, node_id: String, name: String) {
        self.write().entry(node_id.clone()).or_insert_with(|| AgentRecord::new(node_id, name));
    }

    /// `POST /api/agents/{id}/toggle`. Returns the new `active` value,
    /// or `None` if the agent is unknown.
    pub fn toggle(&self, node_id: &str, is_active: bool) -> Option<bool> {
        let mut agents = self.write();
        let agent = agents.get_mut(node_id)?;
        agent.active = is_active;
        Some(agent.active)
    }

    /// `DELETE /api/agents/{id}`. Returns whether an agent was removed.
    pub fn delete(&self, node_id: &str) -> bool {
        self.write().remove(node_id).is_some()
    }

    /// §4.9 rename: the new id must not already exist. On success the
    /// record is re-keyed and `original_id` is set to the old id.
    ///
    /// # Errors
    ///
    /// Returns [`RenameCollision`] if `new_node_id` already exists.
    pub fn rename(
        &self,
        node_id: &str,
        new_node_id: &str,
        name: Option<&str>,
        plcs: Option<&[PlcConfig]>,
    ) -> Result<(), RenameCollision> {
        let mut agents = self.write();

        if node_id != new_node_id && agents.contains_key(new_node_id) {
            return Err(RenameCollision);
        }

        let Some(mut agent) = agents.remove(node_id) else {
            let mut record = AgentRecord::new(new_node_id.to_string(), name.unwrap_or(new_node_id).to_string());
            record.original_id = (node_id != new_node_id).then(|| node_id.to_string());
            if let Some(plcs) = plcs {
                record.plcs = plcs.to_vec();
            }
            agents.insert(new_node_id.to_string(), record);
            return Ok(());
        };

        if node_id != new_node_id {
            agent.original_id = Some(node_id.to_string());
        }
        agent.node_id = new_node_id.to_string();
        if let Some(name) = name {
            agent.name = name.to_string();
        }
        if let Some(plcs) = plcs {
            agent.plcs = plcs.to_vec();
        }
        agents.insert(new_node_id.to_string(), agent);
        Ok(())
    }

    /// `GET /api/agents`: every known agent, liveness computed on read.
    #[must_use]
    pub fn list(&self) -> Vec<AgentRecord> {
        let mut agents: Vec<AgentRecord> = self.read().values().cloned().collect();
        agents.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        agents
    }

    /// Total number of known agents (test/diagnostic use).
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the registry holds no agents at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_node_id_auto_registers_with_pending_name() {
        let registry = AgentRegistry::new();
        let decision = registry.handle_heartbeat("node-1", "10.0.0.5", None, None);
        assert_eq!(decision.status, "registered");
        assert_eq!(decision.command, "start");
        assert_eq!(registry.list()[0].name, "Pending (node-1)");
    }

    #[test]
    fn known_agent_adopts_heartbeat_config_when_it_has_none() {
        let registry = AgentRegistry::new();
        registry.handle_heartbeat("node-1", "10.0.0.5", None, None);
        let plcs = vec![PlcConfig { port: 5020, ..PlcConfig::default() }];
        let decision = registry.handle_heartbeat("node-1", "10.0.0.5", None, Some(&plcs));
        assert_eq!(decision.status, "ok");
        assert_eq!(registry.list()[0].plcs.len(), 1);
    }

    #[test]
    fn known_agent_with_devices_ignores_heartbeat_config() {
        let registry = AgentRegistry::new();
        let initial = vec![PlcConfig { port: 502, ..PlcConfig::default() }];
        registry.handle_heartbeat("node-1", "10.0.0.5", None, Some(&initial));
        let offered = vec![PlcConfig { port: 9999, ..PlcConfig::default() }];
        registry.handle_heartbeat("node-1", "10.0.0.5", None, Some(&offered));
        assert_eq!(registry.list()[0].plcs[0].port, 502);
    }

    #[test]
    fn inactive_agent_gets_stop_command() {
        let registry = AgentRegistry::new();
        registry.handle_heartbeat("node-1", "10.0.0.5", None, None);
        registry.toggle("node-1", false);
        let decision = registry.handle_heartbeat("node-1", "10.0.0.5", None, None);
        assert_eq!(decision.command, "stop");
    }

    #[test]
    fn rename_then_old_heartbeat_is_adopted() {
        let registry = AgentRegistry::new();
        registry.handle_heartbeat("node-x", "10.0.0.5", None, None);
        registry.rename("node-x", "node-y", None, None).unwrap();

        let decision = registry.handle_heartbeat("node-x", "10.0.0.5", None, None);
        assert_eq!(decision.status, "adopted");
        assert_eq!(decision.command, "stop");
        assert_eq!(decision.new_node_id.as_deref(), Some("node-y"));
    }

    #[test]
    fn rename_collision_is_rejected() {
        let registry = AgentRegistry::new();
        registry.handle_heartbeat("node-a", "10.0.0.1", None, None);
        registry.handle_heartbeat("node-b", "10.0.0.2", None, None);
        assert_eq!(registry.rename("node-a", "node-b", None, None), Err(RenameCollision));
    }

    #[test]
    fn delete_removes_agent() {
        let registry = AgentRegistry::new();
        registry.handle_heartbeat("node-1", "10.0.0.5", None, None);
        assert!(registry.delete("node-1"));
        assert!(registry.is_empty());
        assert!(!registry.delete("node-1"));
    }

    #[test]
    fn fetch_config_is_none_for_unknown_agent() {
        let registry = AgentRegistry::new();
        assert!(registry.fetch_config("ghost", "http://server:8000").is_none());
    }
}
