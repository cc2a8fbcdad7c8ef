use crate::device::control::ControlOutcome;
use crate::device::{DeviceError, DeviceHub};
use crate::model::{StatusSnapshot, TelemetryReport};
use axum::{
    extract::{rejection::JsonRejection, State},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio::sync::watch;

const MSG_CHECK_STATUS_FAILED: &str = "Failed to check status - no response";
const MSG_LIST_STATES_FAILED: &str = "Failed to get states list - no response";

struct ServerState {
    hub: DeviceHub,
}

/// Operator API. Every response is HTTP 200 with a `status` field, except
/// `/status`, which returns the bare snapshot.
pub fn router(hub: DeviceHub) -> Router {
    let state = Arc::new(ServerState { hub });
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .route("/start", post(start_collection))
        .route("/stop", post(stop_collection))
        .route("/check-status", post(check_status))
        .route("/list-states", post(list_states))
        .route("/clear-connection", post(clear_connection))
        .route("/data", post(receive_data))
        .with_state(state)
}

pub async fn start(
    addr: SocketAddr,
    hub: DeviceHub,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "http api listening");
    axum::serve(listener, router(hub))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    Ok(())
}

fn error_body(message: impl Into<String>) -> Json<Value> {
    Json(json!({ "status": "error", "message": message.into() }))
}

fn device_error(err: DeviceError) -> Json<Value> {
    error_body(err.to_string())
}

fn control_response(result: Result<ControlOutcome, DeviceError>) -> Json<Value> {
    match result {
        Ok(ControlOutcome::Success { message: Some(message) }) => {
            Json(json!({ "status": "success", "message": message }))
        }
        Ok(ControlOutcome::Success { message: None }) => Json(json!({ "status": "success" })),
        Ok(ControlOutcome::Pending { message }) => {
            Json(json!({ "status": "pending", "message": message }))
        }
        Err(err) => device_error(err),
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }))
}

async fn status(State(state): State<Arc<ServerState>>) -> Json<StatusSnapshot> {
    Json(state.hub.snapshot())
}

async fn start_collection(State(state): State<Arc<ServerState>>) -> Json<Value> {
    control_response(state.hub.start_collection().await)
}

async fn stop_collection(State(state): State<Arc<ServerState>>) -> Json<Value> {
    control_response(state.hub.stop_collection().await)
}

async fn check_status(State(state): State<Arc<ServerState>>) -> Json<Value> {
    match state.hub.check_status().await {
        Ok(Some(check)) => Json(json!({
            "status": "success",
            "device_status": check.device_status,
            "is_collecting": check.is_collecting,
            "is_processing": check.is_processing,
            "current_state": check.current_state,
            "server_thinks_collecting": check.server_thinks_collecting,
        })),
        Ok(None) => error_body(MSG_CHECK_STATUS_FAILED),
        Err(err) => device_error(err),
    }
}

async fn list_states(State(state): State<Arc<ServerState>>) -> Json<Value> {
    match state.hub.list_states().await {
        Ok(Some(states)) => Json(json!({ "status": "success", "states_info": states })),
        Ok(None) => error_body(MSG_LIST_STATES_FAILED),
        Err(err) => device_error(err),
    }
}

async fn clear_connection(State(state): State<Arc<ServerState>>) -> Json<Value> {
    state.hub.clear_connections();
    Json(json!({ "status": "success" }))
}

async fn receive_data(
    State(state): State<Arc<ServerState>>,
    payload: Result<Json<TelemetryReport>, JsonRejection>,
) -> Json<Value> {
    match payload {
        Ok(Json(report)) => {
            state.hub.record_telemetry(&report);
            Json(json!({ "status": "success" }))
        }
        Err(rejection) => {
            tracing::warn!(error = %rejection.body_text(), "rejected telemetry payload");
            error_body(rejection.body_text())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::{connect, test_hub};
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tower::ServiceExt;

    async fn call(app: Router, method: &str, uri: &str, body: Option<&str>) -> Value {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(raw) => {
                req = req.header(header::CONTENT_TYPE, "application/json");
                Body::from(raw.to_string())
            }
            None => Body::empty(),
        };
        let res = app.oneshot(req.body(body).unwrap()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn start_without_device_is_an_error() {
        let app = router(test_hub());
        let body = call(app, "POST", "/start", None).await;
        assert_eq!(
            body,
            json!({ "status": "error", "message": "No device connected" })
        );
    }

    #[tokio::test]
    async fn every_device_route_reports_missing_device() {
        let hub = test_hub();
        for uri in ["/stop", "/check-status", "/list-states"] {
            let body = call(router(hub.clone()), "POST", uri, None).await;
            assert_eq!(body["status"], "error", "{uri}");
            assert_eq!(body["message"], "No device connected", "{uri}");
        }
    }

    #[tokio::test]
    async fn status_without_device() {
        let body = call(router(test_hub()), "GET", "/status", None).await;
        assert_eq!(body["connected"], false);
        assert_eq!(body["collecting"], false);
        assert_eq!(body["current_state"], "DISCONNECTED");
        assert_eq!(body["time_since_update"], -1.0);
        assert!(body["last_data"].is_null());
        assert!(body["device_status"].is_null());
    }

    #[tokio::test]
    async fn status_follows_device_reports() {
        let hub = test_hub();
        let (mut device, _task) = connect(&hub, 46000);

        device.send("HELLO").await;
        assert_eq!(device.read_line().await, "WELCOME");
        device.send("STATUS_INFO:Current State: IDLE,Processing: NO").await;
        assert_eq!(device.read_line().await, "OK: Status received");

        let body = call(router(hub), "GET", "/status", None).await;
        assert_eq!(body["connected"], true);
        assert_eq!(body["collecting"], false);
        assert_eq!(body["current_state"], "IDLE");
        assert_eq!(body["command_in_progress"], false);
    }

    #[tokio::test]
    async fn stop_when_idle_needs_no_command() {
        let hub = test_hub();
        let (_device, _task) = connect(&hub, 46001);
        let body = call(router(hub), "POST", "/stop", None).await;
        assert_eq!(
            body,
            json!({ "status": "success", "message": "Already stopped" })
        );
    }

    #[tokio::test]
    async fn check_status_round_trip() {
        let hub = test_hub();
        let (mut device, _task) = connect(&hub, 46002);
        let device_side = tokio::spawn(async move {
            assert_eq!(device.read_line().await, "STATUS");
            device.send("OK: Current State: COLLECTING, Processing: NO").await;
            device
        });

        let body = call(router(hub), "POST", "/check-status", None).await;
        let _device = device_side.await.unwrap();
        assert_eq!(body["status"], "success");
        assert_eq!(body["current_state"], "COLLECTING");
        assert_eq!(body["is_collecting"], true);
        assert_eq!(body["is_processing"], false);
        assert_eq!(body["server_thinks_collecting"], true);
    }

    #[tokio::test]
    async fn list_states_without_reply_fails() {
        let hub = test_hub();
        let (_device, _task) = connect(&hub, 46003);
        let body = call(router(hub), "POST", "/list-states", None).await;
        assert_eq!(
            body,
            json!({ "status": "error", "message": MSG_LIST_STATES_FAILED })
        );
    }

    #[tokio::test]
    async fn data_is_recorded_and_visible_in_status() {
        let hub = test_hub();
        let (_device, _task) = connect(&hub, 46004);

        let body = call(
            router(hub.clone()),
            "POST",
            "/data",
            Some(r#"{"heartRate": 75, "oxygenLevel": 97.5, "actionClass": 0, "confidence": 0.9, "isCollecting": true}"#),
        )
        .await;
        assert_eq!(body, json!({ "status": "success" }));

        let status = call(router(hub), "GET", "/status", None).await;
        assert_eq!(status["server_tracking_state"], true);
        assert_eq!(status["collecting"], false);
        assert_eq!(status["last_data"]["heartRate"], 75.0);
        assert_eq!(status["last_data"]["activityName"], "Resting after exercise");
    }

    #[tokio::test]
    async fn malformed_data_is_an_error_body() {
        let body = call(router(test_hub()), "POST", "/data", Some("{not json")).await;
        assert_eq!(body["status"], "error");
        assert!(body["message"].is_string());
    }

    #[tokio::test]
    async fn clear_connection_drops_devices() {
        let hub = test_hub();
        let (_device, _task) = connect(&hub, 46005);

        let body = call(router(hub.clone()), "POST", "/clear-connection", None).await;
        assert_eq!(body, json!({ "status": "success" }));
        assert!(!hub.is_connected());
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let body = call(router(test_hub()), "GET", "/health", None).await;
        assert_eq!(body["status"], "healthy");
        assert!(body["timestamp"].is_u64());
    }
}
