use std::{
    fmt::Write as _,
    io::ErrorKind,
    net::SocketAddr,
    path::Path as FsPath,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::{net::TcpListener, sync::Mutex};
use tower_http::services::ServeDir;
use tracing::{info, warn};

use coldroom_common::CollectorConfig;

use crate::{
    dashboard::build_dashboard,
    export::export_csv,
    ingest::{accept_batch, parse_batch},
    pages::room_page,
    stats::{chart_source, reading_view, stats_24h, Aggregation, ReadingView},
    store::{AppStore, CollectorData, RoomInput, StoreError},
};

const CONFIG_FILE: &str = "collector.json";
const DEFAULT_READINGS_LIMIT: usize = 50;
const MAX_READINGS_LIMIT: usize = 1_000;
const RETENTION_SWEEP: Duration = Duration::from_secs(60 * 60);

#[derive(Clone)]
struct AppState {
    data: Arc<Mutex<CollectorData>>,
    store: AppStore,
    config: Arc<CollectorConfig>,
    timezone: Tz,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    status: &'static str,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ReadingsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    format: Option<String>,
    date_from: Option<String>,
    date_to: Option<String>,
    aggregation: Option<String>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = load_config().await;
    let timezone = config.display_timezone.parse::<Tz>().unwrap_or_else(|_| {
        warn!(
            "unknown display timezone '{}', falling back to Asia/Kolkata",
            config.display_timezone
        );
        chrono_tz::Asia::Kolkata
    });

    let store = AppStore::new(&config.data_dir);
    let data = store
        .load()
        .await
        .with_context(|| format!("failed to load collector data from {}", config.data_dir))?;
    info!(
        "loaded {} rooms and {} readings from {}",
        data.rooms().len(),
        data.reading_count(),
        config.data_dir
    );
    if config.api_key_sha256.is_empty() {
        warn!("no API key configured, /api/data accepts any client");
    }

    let port = config.http_port;
    let retention_days = config.retention_days;
    let app_state = AppState {
        data: Arc::new(Mutex::new(data)),
        store,
        config: Arc::new(config),
        timezone,
    };
    spawn_retention(app_state.clone(), retention_days);

    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let app = Router::new()
        .route("/api/data", post(handle_post_data))
        .route("/api/dashboard", get(handle_dashboard))
        .route("/api/rooms", get(handle_list_rooms).post(handle_create_room))
        .route(
            "/api/rooms/{id}",
            put(handle_update_room).delete(handle_delete_room),
        )
        .route("/api/rooms/{id}/readings", get(handle_get_readings))
        .route("/api/rooms/{id}/stats", get(handle_get_stats))
        .route("/api/rooms/{id}/chart", get(handle_get_chart))
        .route("/api/errors", get(handle_get_errors))
        .route("/api/errors/{id}/resolve", post(handle_resolve_error))
        .route("/rooms/{id}", get(handle_room_page))
        .route("/rooms/{id}/export", get(handle_export))
        .fallback_service(ServeDir::new(web_root))
        .with_state(app_state);

    let addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind collector server at {addr}"))?;

    info!("collector listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Defaults, then `collector.json` in the data directory, then environment overrides.
async fn load_config() -> CollectorConfig {
    let mut config = CollectorConfig::default();
    if let Ok(dir) = std::env::var("COLLECTOR_DATA_DIR") {
        config.data_dir = dir;
    }

    let path = FsPath::new(&config.data_dir).join(CONFIG_FILE);
    match tokio::fs::read(&path).await {
        Ok(raw) => match serde_json::from_slice::<CollectorConfig>(&raw) {
            Ok(mut stored) => {
                stored.data_dir = config.data_dir.clone();
                config = stored;
            }
            Err(err) => warn!("ignoring invalid {}: {err}", path.display()),
        },
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!("failed to read {}: {err}", path.display()),
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.sanitize();
    config
}

fn apply_env_overrides(config: &mut CollectorConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(port) = lookup("COLLECTOR_HTTP_PORT").and_then(|value| value.parse::<u16>().ok()) {
        config.http_port = port;
    }
    if let Some(key) = lookup("COLLECTOR_API_KEY").filter(|key| !key.is_empty()) {
        config.api_key_sha256 = sha256_hex(key.as_bytes());
    }
    if let Some(timezone) = lookup("COLLECTOR_TIMEZONE").filter(|tz| !tz.is_empty()) {
        config.display_timezone = timezone;
    }
    if let Some(days) = lookup("COLLECTOR_RETENTION_DAYS").and_then(|value| value.parse::<u32>().ok()) {
        config.retention_days = days;
    }
}

/// Prunes expired readings right away and then once an hour.
fn spawn_retention(state: AppState, retention_days: u32) {
    if retention_days == 0 {
        info!("reading retention disabled");
        return;
    }

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RETENTION_SWEEP);
        loop {
            interval.tick().await;
            prune_expired(&state, retention_days).await;
        }
    });
}

async fn prune_expired(state: &AppState, retention_days: u32) -> usize {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    let mut data = state.data.lock().await;
    let pruned = data.prune_before(cutoff);
    if pruned > 0 {
        info!("pruned {pruned} readings older than {retention_days} days");
        if let Err(err) = state.store.rewrite_readings(&data).await {
            warn!("failed to rewrite reading log after pruning: {err:#}");
        }
    }
    pruned
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

fn api_key_authorized(expected_sha256: &str, provided: Option<&str>) -> bool {
    if expected_sha256.is_empty() {
        return true;
    }
    provided.is_some_and(|key| sha256_hex(key.as_bytes()) == expected_sha256)
}

fn parse_date(value: Option<&str>) -> Result<Option<NaiveDate>, String> {
    match value.map(str::trim).filter(|value| !value.is_empty()) {
        None => Ok(None),
        Some(value) => NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| format!("Invalid date '{value}'. Use YYYY-MM-DD")),
    }
}

async fn handle_post_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let provided = headers.get("x-api-key").and_then(|value| value.to_str().ok());
    if !api_key_authorized(&state.config.api_key_sha256, provided) {
        return ingest_error_response(StatusCode::UNAUTHORIZED, "Unauthorized API Key");
    }

    let batch = match parse_batch(&body) {
        Ok(batch) => batch,
        Err(err) => {
            warn!("rejected report: {err}");
            return ingest_error_response(StatusCode::BAD_REQUEST, &err.to_string());
        }
    };

    let mut data = state.data.lock().await;
    let summary = match accept_batch(&mut data, &state.store, &batch, Utc::now()).await {
        Ok(summary) => summary,
        Err(err) => {
            tracing::error!("report from {} not stored: {err:#}", batch.esp32_mac);
            return ingest_error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
        }
    };

    info!("device {}: {}", batch.esp32_mac, summary.message());
    Json(IngestResponse {
        status: "success",
        message: summary.message(),
    })
    .into_response()
}

async fn handle_list_rooms(State(state): State<AppState>) -> impl IntoResponse {
    let data = state.data.lock().await;
    Json(data.rooms().to_vec())
}

async fn handle_dashboard(State(state): State<AppState>) -> impl IntoResponse {
    let data = state.data.lock().await;
    Json(build_dashboard(
        &data,
        Utc::now(),
        state.timezone,
        state.config.active_window_secs,
    ))
}

/// Applies `change` to a copy of the data and publishes the copy only once the
/// registry is on disk.
async fn commit<T>(
    state: &AppState,
    rewrite_readings: bool,
    change: impl FnOnce(&mut CollectorData) -> Result<T, StoreError>,
) -> Result<T, Response> {
    let mut data = state.data.lock().await;
    let mut next = data.clone();
    let value = change(&mut next).map_err(|err| store_error_response(&err))?;

    if let Err(err) = state.store.save_registry(&next).await {
        warn!("failed to persist registry: {err:#}");
        return Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist change"));
    }
    // Lines of rooms missing from the registry are skipped on load.
    if rewrite_readings {
        if let Err(err) = state.store.rewrite_readings(&next).await {
            warn!("failed to rewrite reading log: {err:#}");
        }
    }

    *data = next;
    Ok(value)
}

async fn handle_create_room(
    State(state): State<AppState>,
    Json(input): Json<RoomInput>,
) -> impl IntoResponse {
    match commit(&state, false, |data| data.add_room(input)).await {
        Ok(room) => {
            info!("created room {} '{}'", room.id, room.name);
            (StatusCode::CREATED, Json(room)).into_response()
        }
        Err(response) => response,
    }
}

async fn handle_update_room(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(input): Json<RoomInput>,
) -> impl IntoResponse {
    match commit(&state, false, |data| data.update_room(id, input)).await {
        Ok(room) => Json(room).into_response(),
        Err(response) => response,
    }
}

async fn handle_delete_room(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> impl IntoResponse {
    match commit(&state, true, |data| data.delete_room(id)).await {
        Ok(room) => {
            info!("deleted room {} '{}'", room.id, room.name);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(response) => response,
    }
}

async fn handle_get_readings(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Query(query): Query<ReadingsQuery>,
) -> impl IntoResponse {
    let data = state.data.lock().await;
    if data.room(id).is_none() {
        return store_error_response(&StoreError::RoomNotFound(id));
    }

    let limit = query
        .limit
        .unwrap_or(DEFAULT_READINGS_LIMIT)
        .clamp(1, MAX_READINGS_LIMIT);
    let now = Utc::now();
    let readings: Vec<ReadingView> = data
        .readings_for_room(id)
        .into_iter()
        .take(limit)
        .map(|record| reading_view(record, now, state.timezone, state.config.active_window_secs))
        .collect();

    Json(readings).into_response()
}

async fn handle_get_stats(State(state): State<AppState>, Path(id): Path<u64>) -> impl IntoResponse {
    let data = state.data.lock().await;
    if data.room(id).is_none() {
        return store_error_response(&StoreError::RoomNotFound(id));
    }

    Json(stats_24h(&data.readings_for_room(id), Utc::now())).into_response()
}

async fn handle_get_chart(State(state): State<AppState>, Path(id): Path<u64>) -> impl IntoResponse {
    let data = state.data.lock().await;
    let Some(room) = data.room(id) else {
        return store_error_response(&StoreError::RoomNotFound(id));
    };

    let records: Vec<_> = data
        .readings_for_room(id)
        .into_iter()
        .take(state.config.chart_limit)
        .collect();
    match coldroom_common::render_chart(Some(&chart_source(room, &records, state.timezone))) {
        Ok(config) => Json(config).into_response(),
        Err(err) => {
            tracing::error!("chart for room {id} failed: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

async fn handle_room_page(State(state): State<AppState>, Path(id): Path<u64>) -> impl IntoResponse {
    let data = state.data.lock().await;
    let Some(room) = data.room(id) else {
        return store_error_response(&StoreError::RoomNotFound(id));
    };

    let records = data.readings_for_room(id);
    let stats = stats_24h(&records, Utc::now());
    let limited: Vec<_> = records.into_iter().take(state.config.chart_limit).collect();
    let source = (!limited.is_empty()).then(|| chart_source(room, &limited, state.timezone));

    match room_page(room, &stats, source.as_ref()) {
        Ok(page) => Html(page).into_response(),
        Err(err) => {
            tracing::error!("room page {id} failed to render: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to render page")
        }
    }
}

async fn handle_export(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Query(query): Query<ExportQuery>,
) -> impl IntoResponse {
    if let Some(format) = query.format.as_deref() {
        if !format.eq_ignore_ascii_case("csv") {
            return error_response(StatusCode::BAD_REQUEST, "Only CSV export is supported");
        }
    }
    let aggregation = match query.aggregation.as_deref().map(str::parse::<Aggregation>) {
        None => Aggregation::Full,
        Some(Ok(aggregation)) => aggregation,
        Some(Err(message)) => return error_response(StatusCode::BAD_REQUEST, &message),
    };
    let (date_from, date_to) = match (
        parse_date(query.date_from.as_deref()),
        parse_date(query.date_to.as_deref()),
    ) {
        (Ok(from), Ok(to)) => (from, to),
        (Err(message), _) | (_, Err(message)) => {
            return error_response(StatusCode::BAD_REQUEST, &message)
        }
    };

    let data = state.data.lock().await;
    let Some(room) = data.room(id) else {
        return store_error_response(&StoreError::RoomNotFound(id));
    };

    let records = data.readings_for_room(id);
    let export = match export_csv(room, &records, date_from, date_to, aggregation) {
        Ok(export) => export,
        Err(err) => {
            tracing::error!("export for room {id} failed: {err}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to build export");
        }
    };
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", export.filename),
            ),
        ],
        export.body,
    )
        .into_response()
}

async fn handle_get_errors(State(state): State<AppState>) -> impl IntoResponse {
    let data = state.data.lock().await;
    Json(
        data.unresolved_errors()
            .into_iter()
            .cloned()
            .collect::<Vec<_>>(),
    )
}

async fn handle_resolve_error(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> impl IntoResponse {
    match commit(&state, false, |data| data.resolve_error(id)).await {
        Ok(()) => Json(serde_json::json!({ "status": "success" })).into_response(),
        Err(response) => response,
    }
}

fn store_error_response(err: &StoreError) -> Response {
    let status = match err {
        StoreError::RoomNotFound(_) | StoreError::DeviceErrorNotFound(_) => StatusCode::NOT_FOUND,
        StoreError::DuplicateSensor(_) => StatusCode::CONFLICT,
        StoreError::EmptyName => StatusCode::BAD_REQUEST,
    };
    error_response(status, &err.to_string())
}

/// Device-facing errors share the `status`/`message` shape of a successful report.
fn ingest_error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(IngestResponse {
            status: "error",
            message: message.to_string(),
        }),
    )
        .into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
