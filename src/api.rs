use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::TransportMode;
use crate::coordinator::Coordinator;
use crate::dispatcher::{CommandDispatcher, WriteError};
use crate::normalize::FieldValue;

/// One configured device as exposed over the REST API.
pub struct DeviceHandle {
    pub name: String,
    pub transport: TransportMode,
    pub coordinator: Arc<Coordinator>,
    pub dispatcher: Arc<CommandDispatcher>,
}

/// Shared application state
pub struct AppState {
    pub devices: Vec<DeviceHandle>,
}

impl AppState {
    fn device(&self, name: &str) -> Option<&DeviceHandle> {
        self.devices.iter().find(|d| d.name == name)
    }
}

/// GET /api/ response
#[derive(Serialize)]
struct ApiStatus {
    message: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    devices: usize,
    version: String,
}

#[derive(Serialize)]
struct DeviceSummary {
    name: String,
    device_type: String,
    transport: TransportMode,
    fields: usize,
    /// Configured vehicle directory, for mapping the generic
    /// "Vehicle N" select labels to real names.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    vehicles: BTreeMap<u32, String>,
}

#[derive(Serialize)]
struct FieldSummary {
    key: &'static str,
    label: &'static str,
    kind: crate::catalog::FieldKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit: Option<&'static str>,
    writable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<f64>,
    diagnostic: bool,
}

/// POST /api/devices/{name}/command request body
#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub field: String,
    pub value: String,
}

#[derive(Serialize)]
struct CommandResponse {
    message: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/", get(api_status))
        .route("/api/health", get(health))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/:name/fields", get(list_fields))
        .route("/api/devices/:name/snapshot", get(get_snapshot))
        .route("/api/devices/:name/command", post(send_command))
        .with_state(state)
}

/// GET /api/ — API running check
async fn api_status() -> Json<ApiStatus> {
    Json(ApiStatus {
        message: "API running.".to_string(),
    })
}

/// GET /api/health
async fn health(State(app): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        devices: app.devices.len(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /api/devices — all configured devices
async fn list_devices(State(app): State<Arc<AppState>>) -> Json<Vec<DeviceSummary>> {
    Json(
        app.devices
            .iter()
            .map(|d| DeviceSummary {
                name: d.name.clone(),
                device_type: d.coordinator.binding().device_type.wire_name().to_string(),
                transport: d.transport,
                fields: d.coordinator.fields().len(),
                vehicles: d.coordinator.binding().vehicles.clone(),
            })
            .collect(),
    )
}

/// GET /api/devices/{name}/fields — field metadata for this device type
async fn list_fields(
    State(app): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Vec<FieldSummary>>, StatusCode> {
    let device = app.device(&name).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(
        device
            .coordinator
            .fields()
            .iter()
            .map(|d| FieldSummary {
                key: d.key,
                label: d.label,
                kind: d.kind,
                unit: d.unit,
                writable: d.is_writable(),
                min: d.min,
                max: d.max,
                step: d.step,
                diagnostic: d.diagnostic,
            })
            .collect(),
    ))
}

/// GET /api/devices/{name}/snapshot — current normalized values
async fn get_snapshot(
    State(app): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<BTreeMap<String, FieldValue>>, StatusCode> {
    let device = app.device(&name).ok_or(StatusCode::NOT_FOUND)?;
    let snapshot = device.coordinator.snapshot();
    // Sorted keys keep the output stable for humans and scripts.
    Ok(Json(snapshot.iter().map(|(k, v)| (k.clone(), v.clone())).collect()))
}

/// POST /api/devices/{name}/command — display-level write
async fn send_command(
    State(app): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<CommandRequest>,
) -> impl IntoResponse {
    let Some(device) = app.device(&name) else {
        return (StatusCode::NOT_FOUND, Json(CommandResponse { message: "unknown device".to_string() }));
    };
    match device.dispatcher.set_value(&request.field, &request.value).await {
        Ok(()) => (
            StatusCode::OK,
            Json(CommandResponse {
                message: format!("{} set to {}", request.field, request.value),
            }),
        ),
        Err(e) => (write_error_status(&e), Json(CommandResponse { message: e.to_string() })),
    }
}

fn write_error_status(error: &WriteError) -> StatusCode {
    match error {
        WriteError::UnknownField(_) => StatusCode::NOT_FOUND,
        WriteError::NotWritable(_)
        | WriteError::UnmappableValue { .. }
        | WriteError::OutOfRange { .. }
        | WriteError::Unresolved(_) => StatusCode::UNPROCESSABLE_ENTITY,
        WriteError::Api(_) | WriteError::Publish(_) => StatusCode::BAD_GATEWAY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_error_status_mapping() {
        assert_eq!(
            write_error_status(&WriteError::UnknownField("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            write_error_status(&WriteError::NotWritable("power".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            write_error_status(&WriteError::OutOfRange { value: 40.0, min: 6.0, max: 16.0 }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            write_error_status(&WriteError::Publish("boom".into())),
            StatusCode::BAD_GATEWAY
        );
    }
}
