//! Wire-format agent configuration: the JSON shape that travels between
//! the agent and the server (`client_config.json` locally, the body of
//! `GET /api/config/{node_id}` and `POST /api/heartbeat` remotely).
//!
//! [`normalize`] turns a raw, possibly sloppy [`serde_json::Value`] from
//! the server into a strict [`AgentWireConfig`], matching the tolerance
//! the control loop is specified to have for operator-entered data.

use plc_common::{HoneypotError, HoneypotResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which wire protocol a configured PLC speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlcKind {
    /// Modbus/TCP.
    Modbus,
    /// Siemens S7comm.
    S7comm,
}

/// One logical sub-device behind a Modbus gateway listener, keyed by Unit ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModbusSubDevice {
    /// Modbus Unit ID this sub-device answers to.
    pub unit_id: u8,
    /// Model string reported in FC43/MEI-14 and `ReportServerId`.
    pub model: String,
}

/// One emulated PLC's configuration, as carried in `plcs[i]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlcConfig {
    /// Wire protocol this listener speaks.
    #[serde(rename = "type")]
    pub kind: PlcKind,
    /// Whether the device should be running.
    pub enabled: bool,
    /// TCP port to bind.
    pub port: u16,
    /// Model string (S7 family name, or the default Modbus device's model).
    pub model: String,
    /// Vendor string reported by Modbus FC43/MEI-14.
    pub vendor: Option<String>,
    /// Firmware revision string reported by Modbus FC43/MEI-14.
    pub revision: Option<String>,
    /// Gateway sub-devices, Modbus only. Absent means a single implicit
    /// device at Unit ID 1 using `model`/`vendor`/`revision` above.
    pub devices: Option<Vec<ModbusSubDevice>>,
    /// Process-simulation configuration for this device.
    pub simulation: Option<plc_simulation::DeviceConfig>,
}

impl Default for PlcKind {
    fn default() -> Self {
        Self::Modbus
    }
}

impl Default for PlcConfig {
    fn default() -> Self {
        Self {
            kind: PlcKind::default(),
            enabled: false,
            port: 502,
            model: String::new(),
            vendor: None,
            revision: None,
            devices: None,
            simulation: None,
        }
    }
}

/// Top-level agent configuration, `client_config.json` on disk and the
/// body exchanged with the server's config/heartbeat endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentWireConfig {
    /// Base URL of the fleet server, e.g. `http://honeypot-server:8000`.
    pub server_url: String,
    /// This agent's current node id.
    pub node_id: String,
    /// Display name, server-assigned or operator-set.
    pub name: Option<String>,
    /// Previous node id, set by the server on a rename so a still-running
    /// agent claiming the old id can be adopted on its next heartbeat.
    pub original_id: Option<String>,
    /// Configured PLC devices.
    pub plcs: Vec<PlcConfig>,
}

impl Default for AgentWireConfig {
    fn default() -> Self {
        Self {
            server_url: String::from("http://localhost:8000"),
            node_id: String::new(),
            name: None,
            original_id: None,
            plcs: Vec::new(),
        }
    }
}

impl AgentWireConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not parse as
    /// a valid `AgentWireConfig`.
    pub fn from_file(path: &std::path::Path) -> HoneypotResult<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| HoneypotError::Config(e.to_string()))
    }

    /// Persist configuration to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &std::path::Path) -> HoneypotResult<()> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| HoneypotError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Strip every object key beginning with `_` at every depth. The server's
/// config endpoint may echo internal bookkeeping fields (e.g. a database
/// row id); these are never part of the wire contract.
fn strip_underscore_keys(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|k, _| !k.starts_with('_'));
            for v in map.values_mut() {
                strip_underscore_keys(v);
            }
        }
        Value::Array(items) => {
            for v in items {
                strip_underscore_keys(v);
            }
        }
        _ => {}
    }
}

fn coerce_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().map_or(true, |i| i != 0),
        Value::String(s) => matches!(s.as_str(), "true" | "1" | "yes" | "on"),
        _ => false,
    }
}

fn coerce_port(value: &Value) -> u16 {
    let raw = match value {
        Value::Number(n) => n.as_i64().unwrap_or(502),
        Value::String(s) => s.parse().unwrap_or(502),
        _ => 502,
    };
    raw.clamp(1, i64::from(u16::MAX)) as u16
}

fn coerce_address(value: &Value) -> u16 {
    let raw = match value {
        Value::Number(n) => n.as_i64().unwrap_or(0),
        Value::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    };
    raw.clamp(0, i64::from(u16::MAX)) as u16
}

/// Coerce every entry's `address` field to an in-range `u16` in place, for
/// each register/coil array of a `plcs[i].simulation.modbus` object.
fn coerce_modbus_addresses(modbus: &mut Value) {
    let Value::Object(fields) = modbus else { return };
    for key in ["holding_registers", "input_registers", "coils", "discrete_inputs"] {
        let Some(Value::Array(entries)) = fields.get_mut(key) else { continue };
        for entry in entries {
            let Value::Object(entry_fields) = entry else { continue };
            if let Some(address) = entry_fields.get("address") {
                let coerced = coerce_address(address);
                entry_fields.insert("address".to_string(), Value::Number(coerced.into()));
            }
        }
    }
}

/// Coerce known loosely-typed fields (`enabled`, `port`, register/coil
/// `address`) on every `plcs[i]` entry in place, tolerating values the
/// operator dashboard or a hand-edited config might send as strings or
/// numbers instead of the exact wire type.
fn coerce_plc_fields(value: &mut Value) {
    let Value::Object(root) = value else { return };
    let Some(Value::Array(plcs)) = root.get_mut("plcs") else { return };
    for plc in plcs {
        let Value::Object(fields) = plc else { continue };
        if let Some(enabled) = fields.get("enabled") {
            let coerced = coerce_bool(enabled);
            fields.insert("enabled".to_string(), Value::Bool(coerced));
        }
        if let Some(port) = fields.get("port") {
            let coerced = coerce_port(port);
            fields.insert("port".to_string(), Value::Number(coerced.into()));
        }
        if let Some(Value::Object(simulation)) = fields.get_mut("simulation") {
            if let Some(modbus) = simulation.get_mut("modbus") {
                coerce_modbus_addresses(modbus);
            }
        }
    }
}

/// Normalize a raw server-returned configuration value into a strict
/// [`AgentWireConfig`]: strip internal keys, coerce loosely-typed fields,
/// then parse.
///
/// # Errors
///
/// Returns an error if, after normalization, the value still does not
/// match the expected shape.
pub fn normalize(mut raw: Value) -> HoneypotResult<AgentWireConfig> {
    strip_underscore_keys(&mut raw);
    coerce_plc_fields(&mut raw);
    serde_json::from_value(raw).map_err(|e| HoneypotError::Config(e.to_string()))
}

/// Whether two device lists differ under canonical (key-order independent)
/// JSON comparison. Drives the "stop and reinstall" decision in the sync
/// tick: anything other than a no-op config fetch restarts every device.
#[must_use]
pub fn plcs_differ(a: &[PlcConfig], b: &[PlcConfig]) -> bool {
    serde_json::to_value(a).ok() != serde_json::to_value(b).ok()
}
