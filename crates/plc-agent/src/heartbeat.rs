//! Heartbeat request/response wire types and the pure dispatch logic that
//! turns a response into a [`HeartbeatOutcome`], plus the thin HTTP client
//! functions the sync tick drives.

use crate::config::AgentWireConfig;
use plc_common::{HoneypotError, HoneypotResult};
use plc_logger::InteractionRecord;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Body of `POST /api/heartbeat`.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatRequest {
    /// This agent's current node id.
    pub node_id: String,
    /// The agent's observed outbound IP, best-effort.
    pub ip: String,
    /// Display name, sent so the server can label a first-time registration.
    pub name: Option<String>,
    /// The agent's current local configuration, sent so the server can
    /// adopt it if the server has no devices on record yet.
    pub config: Option<AgentWireConfig>,
}

/// Body returned by `POST /api/heartbeat`.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatResponse {
    /// `"registered"` | `"ok"` | `"adopted"`, informational.
    pub status: String,
    /// `"start"` | `"stop"`.
    pub command: Option<String>,
    /// Present when the server has renamed this agent since it last
    /// checked in.
    pub new_node_id: Option<String>,
}

/// What the sync tick should do after a heartbeat round-trips (or fails).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// The server renamed this agent; install `new_node_id`, stop all
    /// devices, reset backoff, and skip any command in this response.
    Adopted {
        /// The id the agent should adopt.
        new_node_id: String,
    },
    /// Devices should be running.
    Start,
    /// Devices should not be running.
    Stop,
    /// The heartbeat request itself failed; if devices are running they
    /// must be safety-stopped.
    UnreachableServer,
}

/// Apply §4.8's priority order: adoption beats any command in the same
/// response.
#[must_use]
pub fn dispatch(response: &HeartbeatResponse, current_node_id: &str) -> HeartbeatOutcome {
    if let Some(new_id) = &response.new_node_id {
        if new_id != current_node_id {
            return HeartbeatOutcome::Adopted { new_node_id: new_id.clone() };
        }
    }
    match response.command.as_deref() {
        Some("start") => HeartbeatOutcome::Start,
        _ => HeartbeatOutcome::Stop,
    }
}

/// Request timeout for every call this module makes to the server.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Build an HTTP client with the control-plane's 2 s request timeout.
///
/// # Errors
///
/// Returns an error if the underlying TLS backend fails to initialize.
pub fn build_client() -> HoneypotResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| HoneypotError::Transport(e.to_string()))
}

/// `POST /api/heartbeat`.
///
/// # Errors
///
/// Returns [`HoneypotError::Transport`] on any network failure, timeout,
/// or non-2xx/unparseable response.
pub async fn send_heartbeat(
    client: &reqwest::Client,
    server_url: &str,
    request: &HeartbeatRequest,
) -> HoneypotResult<HeartbeatResponse> {
    let url = format!("{}/api/heartbeat", server_url.trim_end_matches('/'));
    let response = client
        .post(&url)
        .json(request)
        .send()
        .await
        .map_err(|e| HoneypotError::Transport(e.to_string()))?;
    response
        .json::<HeartbeatResponse>()
        .await
        .map_err(|e| HoneypotError::Transport(e.to_string()))
}

/// `GET /api/config/{node_id}`.
///
/// # Errors
///
/// Returns [`HoneypotError::Transport`] on any network failure or
/// unparseable response.
pub async fn fetch_config(
    client: &reqwest::Client,
    server_url: &str,
    node_id: &str,
) -> HoneypotResult<serde_json::Value> {
    let url = format!("{}/api/config/{node_id}", server_url.trim_end_matches('/'));
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| HoneypotError::Transport(e.to_string()))?;
    response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| HoneypotError::Transport(e.to_string()))
}

/// Body of `POST /api/logs`.
#[derive(Debug, Clone, Serialize)]
struct LogUploadRequest<'a> {
    node_id: &'a str,
    logs: &'a [InteractionRecord],
}

#[derive(Debug, Clone, Deserialize)]
struct LogUploadResponse {
    #[allow(dead_code)]
    status: String,
    #[allow(dead_code)]
    count: usize,
}

/// `POST /api/logs`. Returns on success; the caller marks `records` as
/// uploaded only once this returns `Ok`.
///
/// # Errors
///
/// Returns [`HoneypotError::Transport`] on any network failure or
/// unparseable response.
pub async fn upload_logs(
    client: &reqwest::Client,
    server_url: &str,
    node_id: &str,
    records: &[InteractionRecord],
) -> HoneypotResult<()> {
    let url = format!("{}/api/logs", server_url.trim_end_matches('/'));
    let body = LogUploadRequest { node_id, logs: records };
    let response = client
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|e| HoneypotError::Transport(e.to_string()))?;
    response
        .json::<LogUploadResponse>()
        .await
        .map_err(|e| HoneypotError::Transport(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(command: Option<&str>, new_node_id: Option<&str>) -> HeartbeatResponse {
        HeartbeatResponse {
            status: "ok".to_string(),
            command: command.map(str::to_string),
            new_node_id: new_node_id.map(str::to_string),
        }
    }

    #[test]
    fn adoption_takes_priority_over_command() {
        let response = resp(Some("start"), Some("new-id"));
        assert_eq!(
            dispatch(&response, "old-id"),
            HeartbeatOutcome::Adopted { new_node_id: "new-id".to_string() }
        );
    }

    #[test]
    fn matching_new_node_id_is_not_an_adoption() {
        let response = resp(Some("start"), Some("same-id"));
        assert_eq!(dispatch(&response, "same-id"), HeartbeatOutcome::Start);
    }

    #[test]
    fn stop_command_maps_through() {
        let response = resp(Some("stop"), None);
        assert_eq!(dispatch(&response, "id"), HeartbeatOutcome::Stop);
    }

    #[test]
    fn missing_command_defaults_to_stop() {
        let response = resp(None, None);
        assert_eq!(dispatch(&response, "id"), HeartbeatOutcome::Stop);
    }
}
