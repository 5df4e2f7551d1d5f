use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::{
    engine::{Engine, StartScanError, StartScanRequest},
    registry::StopError,
};

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/control/scans", post(start_scan).get(list_scans))
        .route("/control/scans/{scan_id}/stop", post(stop_scan))
        .with_state(engine)
}

pub async fn serve(engine: Arc<Engine>) -> eyre::Result<()> {
    let port = engine.config.control.port;
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Scanner control plane listening on port {port}");

    axum::serve(listener, router(engine.clone()))
        .with_graceful_shutdown(shutdown_signal(engine))
        .await?;
    Ok(())
}

async fn shutdown_signal(engine: Arc<Engine>) {
    let _ = tokio::signal::ctrl_c().await;
    warn!("Stop signal received; shutting down");
    engine.cancel_active();
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct StartScanBody {
    subnets: Option<Vec<String>>,
    subnet: Option<String>,
    subnet_cidr: Option<String>,
    scan_id: Option<String>,
    max_active: Option<usize>,
}

/// `subnets` (a list) wins over the `subnetCidr`/`subnet` singletons; blank
/// entries are dropped either way.
fn collect_subnets(body: &StartScanBody) -> Vec<String> {
    if let Some(list) = &body.subnets {
        return list
            .iter()
            .map(|entry| entry.trim().to_string())
            .filter(|entry| !entry.is_empty())
            .collect();
    }
    body.subnet_cidr
        .as_ref()
        .or(body.subnet.as_ref())
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| vec![entry.to_string()])
        .unwrap_or_default()
}

async fn start_scan(
    State(engine): State<Arc<Engine>>,
    body: Result<Json<StartScanBody>, JsonRejection>,
) -> Response {
    // a missing or malformed body is treated as empty, matching the rest of
    // the input-validation responses
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let subnets = collect_subnets(&body);
    if subnets.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "subnets required");
    }

    match engine.start_scan(StartScanRequest {
        subnets,
        scan_id: body.scan_id,
        max_active: body.max_active,
    }) {
        Ok(record) => (StatusCode::ACCEPTED, Json(record)).into_response(),
        Err(StartScanError::NoSubnets) => {
            error_response(StatusCode::BAD_REQUEST, "subnets required")
        }
        Err(StartScanError::InvalidSubnets(invalid)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid subnets", "invalidSubnets": invalid })),
        )
            .into_response(),
        Err(StartScanError::AlreadyRunning) => {
            error_response(StatusCode::CONFLICT, "scan already running")
        }
    }
}

async fn list_scans(State(engine): State<Arc<Engine>>) -> Response {
    Json(json!({ "items": engine.list_scans() })).into_response()
}

async fn stop_scan(State(engine): State<Arc<Engine>>, Path(scan_id): Path<String>) -> Response {
    match engine.stop_scan(&scan_id) {
        Ok(()) => Json(json!({ "status": "stopping" })).into_response(),
        Err(StopError::NotFound) => error_response(StatusCode::NOT_FOUND, "not found"),
        Err(StopError::NotStoppable) => error_response(StatusCode::CONFLICT, "scan not running"),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use axum::body::Body;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::{config::Config, database::Database, registry::ScanStatus};

    async fn test_engine() -> Arc<Engine> {
        let mut config: Config = toml::from_str("").unwrap();
        // a path that can't exist, so every subnet yields zero endpoints and
        // the scan drains immediately without touching the network
        config.scan.masscan_path = "/nonexistent/copescan-test-masscan".to_string();
        let database = Database::connect_lazy("mongodb://127.0.0.1:27017")
            .await
            .unwrap();
        Engine::new(config, database)
    }

    async fn request(
        engine: &Arc<Engine>,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let builder = axum::http::Request::builder().method(method).uri(uri);
        let request = match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(value.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap();

        let response = router(engine.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn wait_for_terminal(engine: &Arc<Engine>, scan_id: &str) -> ScanStatus {
        for _ in 0..200 {
            let record = engine.get_scan(scan_id).unwrap();
            if record.status.is_terminal() {
                return record.status;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("scan {scan_id} never reached a terminal status");
    }

    #[tokio::test]
    async fn test_missing_body_is_rejected() {
        let engine = test_engine().await;
        let (status, body) = request(&engine, "POST", "/control/scans", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "subnets required");
    }

    #[tokio::test]
    async fn test_empty_subnet_list_is_rejected() {
        let engine = test_engine().await;
        let (status, body) =
            request(&engine, "POST", "/control/scans", Some(json!({"subnets": []}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "subnets required");
    }

    #[tokio::test]
    async fn test_invalid_subnets_are_listed() {
        let engine = test_engine().await;
        let (status, body) = request(
            &engine,
            "POST",
            "/control/scans",
            Some(json!({"subnets": ["10.0.0.0/24", "garbage", "::/0"]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid subnets");
        assert_eq!(body["invalidSubnets"], json!(["garbage"]));
        assert!(engine.list_scans().is_empty());
    }

    #[tokio::test]
    async fn test_stop_unknown_scan_is_404() {
        let engine = test_engine().await;
        let (status, body) =
            request(&engine, "POST", "/control/scans/nope/stop", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not found");
    }

    #[tokio::test]
    async fn test_happy_path_scan_completes() {
        let engine = test_engine().await;
        let (status, body) = request(
            &engine,
            "POST",
            "/control/scans",
            Some(json!({"subnets": ["192.0.2.0/30"], "scanId": "scan-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["scanId"], "scan-1");
        assert_eq!(body["status"], "queued");
        assert_eq!(body["subnets"], json!(["192.0.2.0/30"]));
        assert_eq!(body["totalSubnets"], 1);
        assert_eq!(body["hostCount"], 4);
        assert!(body["estimatedSeconds"].is_null());

        assert_eq!(wait_for_terminal(&engine, "scan-1").await, ScanStatus::Completed);
        let record = engine.get_scan("scan-1").unwrap();
        assert_eq!(record.subnets_done, 1);
        assert_eq!(record.hosts_done, 4);

        let (status, body) = request(&engine, "GET", "/control/scans", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["items"][0]["scanId"], "scan-1");
        assert_eq!(body["items"][0]["status"], "completed");
    }

    #[tokio::test]
    async fn test_overlapping_subnets_collapse_in_record() {
        let engine = test_engine().await;
        let (status, body) = request(
            &engine,
            "POST",
            "/control/scans",
            Some(json!({"subnets": ["10.0.0.0/24", "10.0.0.0/25"], "scanId": "scan-2"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["subnets"], json!(["10.0.0.0/24"]));
        assert_eq!(body["totalSubnets"], 1);
        assert_eq!(body["hostCount"], 256);
        wait_for_terminal(&engine, "scan-2").await;
    }

    #[tokio::test]
    async fn test_chunking_keeps_user_visible_subnets() {
        let mut config: Config = toml::from_str("").unwrap();
        config.scan.masscan_path = "/nonexistent/copescan-test-masscan".to_string();
        config.scan.chunk_prefix_v4 = Some(24);
        let database = Database::connect_lazy("mongodb://127.0.0.1:27017")
            .await
            .unwrap();
        let engine = Engine::new(config, database);

        let (status, body) = request(
            &engine,
            "POST",
            "/control/scans",
            Some(json!({"subnetCidr": "10.0.0.0/22", "scanId": "scan-3"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["subnets"], json!(["10.0.0.0/22"]));
        assert_eq!(body["totalSubnets"], 4);
        assert_eq!(body["hostCount"], 1024);

        wait_for_terminal(&engine, "scan-3").await;
        let record = engine.get_scan("scan-3").unwrap();
        assert_eq!(record.subnets_done, 4);
        assert_eq!(record.hosts_done, 1024);
    }

    #[tokio::test]
    async fn test_second_scan_while_active_is_409() {
        let engine = test_engine().await;
        // admit directly so the second POST races nothing
        let first = engine
            .clone()
            .start_scan(crate::engine::StartScanRequest {
                subnets: vec!["198.51.100.0/28".to_string()],
                scan_id: Some("scan-4".to_string()),
                max_active: Some(1),
            })
            .unwrap();

        let (status, body) = request(
            &engine,
            "POST",
            "/control/scans",
            Some(json!({"subnet": "203.0.113.0/28"})),
        )
        .await;
        // the first scan may have drained already on a fast machine; accept
        // either outcome but require the right error when rejected
        if status == StatusCode::CONFLICT {
            assert_eq!(body["error"], "scan already running");
        }
        wait_for_terminal(&engine, &first.scan_id).await;
    }

    #[tokio::test]
    async fn test_stop_after_drain_is_409() {
        let engine = test_engine().await;
        request(
            &engine,
            "POST",
            "/control/scans",
            Some(json!({"subnet": "192.0.2.0/31", "scanId": "scan-5"})),
        )
        .await;
        wait_for_terminal(&engine, "scan-5").await;

        let (status, body) =
            request(&engine, "POST", "/control/scans/scan-5/stop", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "scan not running");

        // the active slot is free again
        let (status, _) = request(
            &engine,
            "POST",
            "/control/scans",
            Some(json!({"subnet": "192.0.2.0/31", "scanId": "scan-6"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        wait_for_terminal(&engine, "scan-6").await;
    }
}
