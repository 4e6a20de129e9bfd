use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use ultrametre_core::{BridgeError, BridgePhase, DeviceCommand};

use crate::state::AppState;

// ============================================
// Response Types
// ============================================

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub running: bool,
    pub phase: BridgePhase,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

impl ActionResponse {
    fn ok() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    fn failed(error: &BridgeError) -> Self {
        Self {
            ok: false,
            error: Some(error.to_string()),
            attempts: error.attempts(),
            ..Self::default()
        }
    }
}

/// HTTP status for a failed action
pub fn status_for(error: &BridgeError) -> StatusCode {
    match error {
        BridgeError::PortClosed => StatusCode::BAD_REQUEST,
        BridgeError::NoResponse { .. } => StatusCode::GATEWAY_TIMEOUT,
        BridgeError::ReplyInFlight => StatusCode::CONFLICT,
        BridgeError::Open { .. }
        | BridgeError::Write(_)
        | BridgeError::Watch(_)
        | BridgeError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond(result: Result<ActionResponse, BridgeError>) -> Response {
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => (status_for(&e), Json(ActionResponse::failed(&e))).into_response(),
    }
}

// ============================================
// Handlers
// ============================================

pub async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let phase = state.bridge.phase();
    Json(StatusResponse {
        running: phase == BridgePhase::Running,
        phase,
    })
}

pub async fn start_handler(State(state): State<Arc<AppState>>) -> Response {
    respond(state.bridge.start().await.map(|()| ActionResponse::ok()))
}

pub async fn stop_handler(State(state): State<Arc<AppState>>) -> Response {
    respond(state.bridge.stop().await.map(|()| ActionResponse::ok()))
}

pub async fn fetch_data_handler(State(state): State<Arc<AppState>>) -> Response {
    respond(
        state
            .bridge
            .fetch_telemetry_summary()
            .await
            .map(|reply| ActionResponse {
                ok: true,
                value: Some(reply.value),
                attempts: Some(reply.attempts),
                ..ActionResponse::default()
            }),
    )
}

pub async fn clear_handler(State(state): State<Arc<AppState>>) -> Response {
    respond(
        state
            .bridge
            .clear_device_state()
            .await
            .map(|()| ActionResponse::ok()),
    )
}

/// Fire the device action. Called by the payment flow once a transfer settles.
pub async fn trigger_handler(State(state): State<Arc<AppState>>) -> Response {
    respond(
        state
            .bridge
            .trigger_action(DeviceCommand::Trigger)
            .await
            .map(|()| ActionResponse::ok()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(status_for(&BridgeError::PortClosed), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&BridgeError::NoResponse { attempts: 3 }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(status_for(&BridgeError::ReplyInFlight), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&BridgeError::open("COM5", "busy")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for(&BridgeError::Task("stop: task was cancelled".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_failed_response_shape() {
        let body = serde_json::to_value(ActionResponse::failed(&BridgeError::NoResponse {
            attempts: 3,
        }))
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({"ok": false, "error": "No response from device", "attempts": 3})
        );

        let body = serde_json::to_value(ActionResponse::ok()).unwrap();
        assert_eq!(body, serde_json::json!({"ok": true}));
    }
}
