//! REST handlers for the fleet control plane (§6).

use crate::registry::AgentRegistry;
use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use plc_agent::config::PlcConfig;
use plc_profiles::ProfileStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Operator-visible error body. Never a bare 500 (spec.md §7).
#[derive(Serialize)]
pub struct ApiError {
    status: &'static str,
    message: String,
    #[serde(skip)]
    code: StatusCode,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self { status: "error", message: message.into(), code: StatusCode::NOT_FOUND }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self { status: "error", message: message.into(), code: StatusCode::CONFLICT }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let code = self.code;
        (code, Json(self)).into_response()
    }
}

/// `GET /health`.
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

#[derive(Deserialize)]
pub struct HeartbeatBody {
    node_id: String,
    ip: String,
    name: Option<String>,
    config: Option<serde_json::Value>,
}

#[derive(Serialize)]
pub struct HeartbeatReply {
    status: &'static str,
    command: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_node_id: Option<String>,
}

/// `POST /api/heartbeat`.
pub async fn heartbeat(
    Extension(registry): Extension<Arc<AgentRegistry>>,
    Json(body): Json<HeartbeatBody>,
) -> Json<HeartbeatReply> {
    let plcs = body
        .config
        .as_ref()
        .and_then(|c| c.get("plcs"))
        .and_then(|v| serde_json::from_value::<Vec<PlcConfig>>(v.clone()).ok());

    let decision = registry.handle_heartbeat(
        &body.node_id,
        &body.ip,
        body.name.as_deref(),
        plcs.as_deref(),
    );

    Json(HeartbeatReply {
        status: decision.status,
        command: decision.command,
        new_node_id: decision.new_node_id,
    })
}

/// `GET /api/config/{node_id}`.
pub async fn get_config(
    Extension(registry): Extension<Arc<AgentRegistry>>,
    Extension(server_url): Extension<Arc<str>>,
    Path(node_id): Path<String>,
) -> Result<Json<plc_agent::config::AgentWireConfig>, ApiError> {
    registry
        .fetch_config(&node_id, &server_url)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("unknown agent: {node_id}")))
}

#[derive(Deserialize)]
pub struct LogUploadBody {
    node_id: String,
    logs: Vec<serde_json::Value>,
}

#[derive(Serialize)]
pub struct LogUploadReply {
    status: &'static str,
    count: usize,
}

/// `POST /api/logs`. Server-side log persistence is intentionally
/// unspecified (spec.md §9); this intake accepts and acknowledges
/// batches so the agent can retire them from its local queue.
pub async fn upload_logs(Json(body): Json<LogUploadBody>) -> Json<LogUploadReply> {
    info!(node_id = %body.node_id, count = body.logs.len(), "received interaction log batch");
    Json(LogUploadReply { status: "received", count: body.logs.len() })
}

#[derive(Serialize)]
pub struct AgentSummary {
    node_id: String,
    name: String,
    ip: String,
    active: bool,
    online: bool,
    plcs: Vec<PlcConfig>,
}

/// `GET /api/agents`.
pub async fn list_agents(Extension(registry): Extension<Arc<AgentRegistry>>) -> Json<Vec<AgentSummary>> {
    let agents = registry
        .list()
        .into_iter()
        .map(|agent| AgentSummary {
            online: agent.is_online(),
            node_id: agent.node_id,
            name: agent.name,
            ip: agent.ip,
            active: agent.active,
            plcs: agent.plcs,
        })
        .collect();
    Json(agents)
}

#[derive(Deserialize)]
pub struct AddAgentBody {
    node_id: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Serialize)]
pub struct StatusReply {
    status: &'static str,
}

/// `POST /api/agents`: manual registration from the operator dashboard.
pub async fn add_agent(
    Extension(registry): Extension<Arc<AgentRegistry>>,
    Json(body): Json<AddAgentBody>,
) -> Json<StatusReply> {
    let name = body.name.unwrap_or_else(|| body.node_id.clone());
    registry.add_agent(body.node_id, name);
    Json(StatusReply { status: "added" })
}

#[derive(Deserialize)]
pub struct ToggleBody {
    is_active: bool,
}

#[derive(Serialize)]
pub struct ToggleReply {
    status: &'static str,
    is_active: bool,
}

/// `POST /api/agents/{id}/toggle`.
pub async fn toggle_agent(
    Extension(registry): Extension<Arc<AgentRegistry>>,
    Path(node_id): Path<String>,
    Json(body): Json<ToggleBody>,
) -> Result<Json<ToggleReply>, ApiError> {
    registry
        .toggle(&node_id, body.is_active)
        .map(|is_active| Json(ToggleReply { status: "ok", is_active }))
        .ok_or_else(|| ApiError::not_found(format!("unknown agent: {node_id}")))
}

/// `DELETE /api/agents/{id}`.
pub async fn delete_agent(
    Extension(registry): Extension<Arc<AgentRegistry>>,
    Path(node_id): Path<String>,
) -> Result<Json<StatusReply>, ApiError> {
    if registry.delete(&node_id) {
        Ok(Json(StatusReply { status: "deleted" }))
    } else {
        Err(ApiError::not_found(format!("unknown agent: {node_id}")))
    }
}

#[derive(Deserialize)]
pub struct UpdateAgentConfigBody {
    node_id: String,
    new_node_id: Option<String>,
    name: Option<String>,
    config: Option<serde_json::Value>,
}

#[derive(Serialize)]
pub struct UpdateAgentConfigReply {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_node_id: Option<String>,
}

/// `POST /api/update_agent_config`: operator-driven rename/config edit.
pub async fn update_agent_config(
    Extension(registry): Extension<Arc<AgentRegistry>>,
    Json(body): Json<UpdateAgentConfigBody>,
) -> Result<Json<UpdateAgentConfigReply>, ApiError> {
    let new_id = body.new_node_id.clone().unwrap_or_else(|| body.node_id.clone());
    let plcs = body
        .config
        .as_ref()
        .and_then(|c| c.get("plcs"))
        .and_then(|v| serde_json::from_value::<Vec<PlcConfig>>(v.clone()).ok());

    if registry.rename(&body.node_id, &new_id, body.name.as_deref(), plcs.as_deref()).is_err() {
        return Err(ApiError::conflict(format!("node_id already exists: {new_id}")));
    }

    let new_node_id = (new_id != body.node_id).then_some(new_id);
    Ok(Json(UpdateAgentConfigReply { status: "ok", new_node_id }))
}

/// `GET /api/profiles`.
pub async fn list_profiles(Extension(profiles): Extension<Arc<ProfileStore>>) -> Json<Vec<plc_profiles::ProfileInfo>> {
    Json(profiles.list())
}

/// `GET /api/profiles/{name}`.
pub async fn get_profile(
    Extension(profiles): Extension<Arc<ProfileStore>>,
    Path(name): Path<String>,
) -> Result<Json<plc_profiles::Profile>, ApiError> {
    profiles
        .info(&name)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("unknown profile: {name}")))
}
