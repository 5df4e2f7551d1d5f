use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bson::{Bson, Document, doc};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    config::Config,
    database::{Database, ServerQuery},
    probe::protocol,
};

const ALLOWED_SORT_FIELDS: [&str; 3] = ["lastOnline", "lastOnlinePlayers", "lastOnlineVersion"];

const STATUS_CACHE_TTL: Duration = Duration::from_secs(60);
const STATUS_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);
const MAX_STATUS_PROBES: usize = 8;

/// State for the read-only catalog service: the store handle, a client for
/// proxying scan requests to the control plane, and a short-lived cache of
/// live online checks.
pub struct ApiState {
    database: Database,
    control_url: String,
    protocol_version: i32,
    http: reqwest::Client,
    status_cache: Mutex<HashMap<String, (bool, Instant)>>,
}

impl ApiState {
    pub fn new(config: &Config, database: Database) -> Self {
        Self {
            database,
            control_url: config.api.control_url.trim_end_matches('/').to_string(),
            protocol_version: config.probe.protocol_version,
            http: reqwest::Client::new(),
            status_cache: Mutex::new(HashMap::new()),
        }
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/servers", get(list_servers))
        .route("/servers/{host}", get(server_detail))
        .route("/scans", get(proxy_list_scans).post(proxy_start_scan))
        .route("/scans/{scan_id}/stop", post(proxy_stop_scan))
        .with_state(state)
}

pub async fn serve(config: Config) -> eyre::Result<()> {
    let database = Database::connect(&config.mongodb_uri).await?;
    let state = Arc::new(ApiState::new(&config, database));

    let port = config.api.port;
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Catalog API listening on port {port}");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ListParams {
    q: Option<String>,
    limit: Option<String>,
    offset: Option<String>,
    sort: Option<String>,
    order: Option<String>,
    min_players: Option<String>,
    max_players: Option<String>,
    version: Option<String>,
}

async fn list_servers(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<ListParams>,
) -> Response {
    let sort_field = params
        .sort
        .unwrap_or_else(|| "lastOnlinePlayers".to_string());
    if !ALLOWED_SORT_FIELDS.contains(&sort_field.as_str()) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid sort field");
    }
    let descending = match params.order.as_deref().unwrap_or("desc") {
        "desc" => true,
        "asc" => false,
        _ => return error_response(StatusCode::BAD_REQUEST, "Invalid sort order"),
    };

    let limit = parse_int(params.limit.as_deref(), 100).clamp(1, 1000);
    let offset = parse_int(params.offset.as_deref(), 0).max(0);

    let mut filter = Document::new();
    if let Some(q) = params.q.as_deref().filter(|q| !q.is_empty()) {
        let pattern = regex::escape(q);
        filter.insert(
            "$or",
            vec![
                doc! { "host": { "$regex": &pattern, "$options": "i" } },
                doc! { "hostname": { "$regex": &pattern, "$options": "i" } },
            ],
        );
    }
    let min_players = params.min_players.as_deref().map(|v| parse_int(Some(v), 0));
    let max_players = params.max_players.as_deref().map(|v| parse_int(Some(v), 0));
    if min_players.is_some() || max_players.is_some() {
        let mut range = Document::new();
        if let Some(min) = min_players {
            range.insert("$gte", min);
        }
        if let Some(max) = max_players {
            range.insert("$lte", max);
        }
        filter.insert("lastOnlinePlayers", range);
    }
    if let Some(version) = params.version.as_deref().filter(|v| !v.is_empty()) {
        filter.insert(
            "lastOnlineVersion",
            doc! { "$regex": regex::escape(version), "$options": "i" },
        );
    }

    let query = ServerQuery {
        filter,
        projection: summary_projection(),
        sort_field,
        descending,
        limit,
        offset: offset as u64,
    };
    let (total, documents) = match state.database.list_servers(&query).await {
        Ok(result) => result,
        Err(err) => {
            error!("Server list query failed: {err}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
        }
    };

    let mut items: Vec<Value> = documents
        .iter()
        .map(|document| serde_json::to_value(document).unwrap_or(Value::Null))
        .collect();

    // live reachability flags, bounded and cached so a big page doesn't
    // turn into a ping storm
    let state = &state;
    futures_util::stream::iter(items.iter_mut())
        .for_each_concurrent(MAX_STATUS_PROBES, |item| async move {
            let Some(host) = item.get("host").and_then(Value::as_str).map(str::to_string)
            else {
                return;
            };
            let online = check_online(state, &host).await;
            if let Some(map) = item.as_object_mut() {
                map.insert("isOnline".to_string(), json!(online));
            }
        })
        .await;

    Json(json!({ "total": total, "items": items })).into_response()
}

fn summary_projection() -> Document {
    let mut projection = doc! { "_id": 0 };
    for field in [
        "host",
        "hostname",
        "lastOnline",
        "lastOnlinePlayers",
        "lastOnlinePlayersMax",
        "lastOnlineVersion",
        "lastOnlineDescription",
        "lastOnlinePing",
    ] {
        projection.insert(field, Bson::Int32(1));
    }
    projection
}

async fn server_detail(State(state): State<Arc<ApiState>>, Path(host): Path<String>) -> Response {
    match state.database.get_server(&host).await {
        Ok(Some(document)) => {
            Json(serde_json::to_value(&document).unwrap_or(Value::Null)).into_response()
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Not found"),
        Err(err) => {
            error!("Server detail query failed: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

async fn check_online(state: &ApiState, host: &str) -> bool {
    if let Some((online, checked_at)) = state.status_cache.lock().get(host).copied() {
        if checked_at.elapsed() < STATUS_CACHE_TTL {
            return online;
        }
    }

    let addr = match host.parse() {
        Ok(addr) => Some(addr),
        Err(_) => {
            // a hostname, possibly without a port
            let target = if host.contains(':') {
                host.to_string()
            } else {
                format!("{host}:25565")
            };
            match tokio::net::lookup_host(target).await {
                Ok(mut addrs) => addrs.next(),
                Err(_) => None,
            }
        }
    };
    let online = match addr {
        Some(addr) => protocol::ping(addr, state.protocol_version, STATUS_PROBE_TIMEOUT)
            .await
            .is_ok(),
        None => false,
    };

    state
        .status_cache
        .lock()
        .insert(host.to_string(), (online, Instant::now()));
    online
}

async fn proxy_list_scans(State(state): State<Arc<ApiState>>) -> Response {
    forward(state.http.get(format!("{}/control/scans", state.control_url))).await
}

async fn proxy_start_scan(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let payload = body.map(|Json(value)| value).unwrap_or(Value::Null);
    let mut payload = match payload {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    // give the caller a scan id to poll with even if they didn't pick one
    payload
        .entry("scanId".to_string())
        .or_insert_with(|| json!(Uuid::new_v4().to_string()));

    forward(
        state
            .http
            .post(format!("{}/control/scans", state.control_url))
            .json(&Value::Object(payload)),
    )
    .await
}

async fn proxy_stop_scan(State(state): State<Arc<ApiState>>, Path(scan_id): Path<String>) -> Response {
    forward(state.http.post(format!(
        "{}/control/scans/{scan_id}/stop",
        state.control_url
    )))
    .await
}

/// Relay a control-plane response, status and JSON body both. Anything that
/// doesn't come back as JSON means the control plane isn't there.
async fn forward(request: reqwest::RequestBuilder) -> Response {
    match request.send().await {
        Ok(response) => {
            let status = StatusCode::from_u16(response.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            match response.json::<Value>().await {
                Ok(body) => (status, Json(body)).into_response(),
                Err(_) => control_unavailable(),
            }
        }
        Err(_) => control_unavailable(),
    }
}

fn control_unavailable() -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({ "error": "Scanner control unavailable" })),
    )
        .into_response()
}

fn parse_int(raw: Option<&str>, default: i64) -> i64 {
    raw.and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod test {
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;

    async fn test_state() -> Arc<ApiState> {
        let mut config: Config = toml::from_str("").unwrap();
        // a port nothing listens on, so proxy routes fail fast
        config.api.control_url = "http://127.0.0.1:9".to_string();
        let database = Database::connect_lazy("mongodb://127.0.0.1:27017")
            .await
            .unwrap();
        Arc::new(ApiState::new(&config, database))
    }

    async fn get_json(state: &Arc<ApiState>, uri: &str) -> (StatusCode, Value) {
        let request = axum::http::Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_health() {
        let state = test_state().await;
        let (status, body) = get_json(&state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_invalid_sort_field_is_rejected() {
        let state = test_state().await;
        let (status, body) = get_json(&state, "/servers?sort=favicon").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid sort field");
    }

    #[tokio::test]
    async fn test_invalid_sort_order_is_rejected() {
        let state = test_state().await;
        let (status, body) = get_json(&state, "/servers?order=sideways").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid sort order");
    }

    #[tokio::test]
    async fn test_scans_proxy_without_control_plane_is_502() {
        let state = test_state().await;
        let (status, body) = get_json(&state, "/scans").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "Scanner control unavailable");
    }

    #[test]
    fn test_parse_int_defaults() {
        assert_eq!(parse_int(None, 100), 100);
        assert_eq!(parse_int(Some("25"), 100), 25);
        assert_eq!(parse_int(Some("junk"), 100), 100);
        assert_eq!(parse_int(Some(" 7 "), 100), 7);
    }

    #[test]
    fn test_summary_projection_excludes_id() {
        let projection = summary_projection();
        assert_eq!(projection.get_i32("_id").unwrap(), 0);
        assert_eq!(projection.get_i32("host").unwrap(), 1);
        assert!(projection.get("favicon").is_none());
    }
}
