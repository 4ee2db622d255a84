//! Local HTTP management API (axum)
//!
//! Exposes status, mode/setpoint control, config read/write, session
//! history, a raw D-Bus cache dump, and a server-sent-events status
//! stream for the bundled web UI.

use crate::driver::ChargerEngine;
use axum::response::Redirect;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{
    Json, Router,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, get_service, post},
};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tower_http::services::ServeDir;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Clone)]
pub struct AppState {
    pub driver: Arc<Mutex<ChargerEngine>>,
}

#[derive(Deserialize)]
pub struct ModeBody {
    pub mode: u8,
}

#[derive(Deserialize)]
pub struct StartStopBody {
    pub value: u8,
}

#[derive(Deserialize)]
pub struct SetCurrentBody {
    pub amps: f32,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let drv = state.driver.lock().await;
    let mut root = serde_json::json!({
        "mode": drv.current_mode_code(),
        "start_stop": drv.start_stop_code(),
        "set_current": drv.get_intended_set_current(),
        "station_max_current": drv.get_station_max_current(),
        "device_instance": drv.config().device_instance,
    });

    if let Some(v) = drv.get_db_value("/ProductName") {
        root["product_name"] = v;
    }
    if let Some(v) = drv.get_db_value("/Serial") {
        root["serial"] = v;
    }
    if let Some(v) = drv.get_db_value("/FirmwareVersion") {
        root["firmware"] = v;
    }
    if let Some(v) = drv.get_db_value("/Status") {
        root["status"] = v;
    }
    if let Some(v) = drv.get_db_value("/Ac/PhaseCount") {
        root["active_phases"] = v;
    }
    if let Some(v) = drv.get_db_value("/Ac/Power") {
        root["ac_power"] = v;
    }
    if let Some(v) = drv.get_db_value("/Ac/Current") {
        root["ac_current"] = v;
    }
    if let Some(v) = drv.get_db_value("/Ac/L1/Voltage") {
        root["l1_voltage"] = v;
    }
    if let Some(v) = drv.get_db_value("/Ac/L2/Voltage") {
        root["l2_voltage"] = v;
    }
    if let Some(v) = drv.get_db_value("/Ac/L3/Voltage") {
        root["l3_voltage"] = v;
    }
    if let Some(v) = drv.get_db_value("/Ac/L1/Current") {
        root["l1_current"] = v;
    }
    if let Some(v) = drv.get_db_value("/Ac/L2/Current") {
        root["l2_current"] = v;
    }
    if let Some(v) = drv.get_db_value("/Ac/L3/Current") {
        root["l3_current"] = v;
    }
    if let Some(v) = drv.get_db_value("/Ac/L1/Power") {
        root["l1_power"] = v;
    }
    if let Some(v) = drv.get_db_value("/Ac/L2/Power") {
        root["l2_power"] = v;
    }
    if let Some(v) = drv.get_db_value("/Ac/L3/Power") {
        root["l3_power"] = v;
    }

    let mut session = serde_json::json!({});
    if let Some(v) = drv.get_db_value("/ChargingTime") {
        session["charging_time_sec"] = v;
    }
    if let Some(v) = drv.get_db_value("/Ac/Energy/Forward") {
        session["energy_delivered_kwh"] = v;
    }
    let sessions_state = drv.sessions_snapshot();
    if let Some(obj) = sessions_state.as_object() {
        if let Some(cur) = obj.get("current_session").and_then(|v| v.as_object()) {
            if let Some(ts) = cur.get("start_time") {
                session["start_ts"] = ts.clone();
            }
            if let Some(v) = cur.get("energy_delivered_kwh") {
                session["energy_delivered_kwh"] = v.clone();
            }
        }
        if let Some(last) = obj.get("last_session").and_then(|v| v.as_object()) {
            if session.get("start_ts").is_none() {
                if let Some(ts) = last.get("start_time") {
                    session["start_ts"] = ts.clone();
                }
            }
            if let Some(ts) = last.get("end_time") {
                session["end_ts"] = ts.clone();
            }
            if session.get("energy_delivered_kwh").is_none() {
                if let Some(v) = last.get("energy_delivered_kwh") {
                    session["energy_delivered_kwh"] = v.clone();
                }
            }
            if let Some(v) = last.get("cost") {
                session["cost"] = v.clone();
            }
        }
    }

    let pricing = &drv.config().pricing;
    if !pricing.currency_symbol.is_empty() {
        root["pricing_currency"] = serde_json::json!(pricing.currency_symbol.clone());
    }
    if pricing.source.to_lowercase() == "static" {
        root["energy_rate"] = serde_json::json!(pricing.static_rate_eur_per_kwh);
    }
    if let Some(v) = drv.get_db_value("/Ac/Energy/Total") {
        root["total_energy_kwh"] = v;
    }

    root["session"] = session;

    Json(root)
}

async fn set_mode(State(state): State<AppState>, Json(body): Json<ModeBody>) -> impl IntoResponse {
    let mut drv = state.driver.lock().await;
    drv.set_mode(body.mode).await;
    (StatusCode::OK, Json(serde_json::json!({"ok":true})))
}

async fn set_startstop(
    State(state): State<AppState>,
    Json(body): Json<StartStopBody>,
) -> impl IntoResponse {
    let mut drv = state.driver.lock().await;
    drv.set_start_stop(body.value).await;
    (StatusCode::OK, Json(serde_json::json!({"ok":true})))
}

async fn set_current(
    State(state): State<AppState>,
    Json(body): Json<SetCurrentBody>,
) -> impl IntoResponse {
    let mut drv = state.driver.lock().await;
    drv.set_intended_current(body.amps).await;
    (StatusCode::OK, Json(serde_json::json!({"ok":true})))
}

async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    let drv = state.driver.lock().await;
    let json = serde_json::to_value(drv.config().clone())
        .unwrap_or(serde_json::json!({"error":"serialization"}));
    Json(json)
}

async fn put_config(
    State(state): State<AppState>,
    Json(new_cfg_value): Json<serde_json::Value>,
) -> impl IntoResponse {
    let new_cfg: crate::config::Config = match serde_json::from_value(new_cfg_value) {
        Ok(c) => c,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": e.to_string()})),
            );
        }
    };
    if let Err(e) = new_cfg.validate() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": e.to_string()})),
        );
    }
    let mut drv = state.driver.lock().await;
    if let Err(e) = drv.update_config(new_cfg) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        );
    }
    (StatusCode::OK, Json(serde_json::json!({"ok":true})))
}

async fn get_config_schema() -> impl IntoResponse {
    let schema = schemars::schema_for!(crate::config::Config);
    Json(serde_json::to_value(&schema).unwrap_or(serde_json::json!({"error":"schema"})))
}

#[derive(Debug, Deserialize)]
pub struct TailParams {
    pub lines: Option<usize>,
}

async fn logs_tail(
    State(state): State<AppState>,
    Query(params): Query<TailParams>,
) -> impl IntoResponse {
    let (path, max_lines) = {
        let drv = state.driver.lock().await;
        (
            drv.config().logging.file.clone(),
            params.lines.unwrap_or(200).min(10_000),
        )
    };
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => {
            let mut lines: Vec<&str> = contents.lines().collect();
            if lines.len() > max_lines {
                lines = lines.split_off(lines.len() - max_lines);
            }
            let body = lines.join("\n");
            let mut resp = Response::new(body.into());
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            resp
        }
        Err(_) => (StatusCode::NOT_FOUND, "Log file not available").into_response(),
    }
}

async fn logs_head(
    State(state): State<AppState>,
    Query(params): Query<TailParams>,
) -> impl IntoResponse {
    let (path, max_lines) = {
        let drv = state.driver.lock().await;
        (
            drv.config().logging.file.clone(),
            params.lines.unwrap_or(200).min(10_000),
        )
    };
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => {
            let mut lines: Vec<&str> = contents.lines().collect();
            if lines.len() > max_lines {
                lines.truncate(max_lines);
            }
            let body = lines.join("\n");
            let mut resp = Response::new(body.into());
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            resp
        }
        Err(_) => (StatusCode::NOT_FOUND, "Log file not available").into_response(),
    }
}

async fn logs_download(State(state): State<AppState>) -> impl IntoResponse {
    let path = {
        let drv = state.driver.lock().await;
        drv.config().logging.file.clone()
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let mut resp = Response::new(bytes.into());
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("application/octet-stream"),
            );
            resp
        }
        Err(_) => (StatusCode::NOT_FOUND, "Log file not available").into_response(),
    }
}

async fn sessions(State(state): State<AppState>) -> impl IntoResponse {
    let drv = state.driver.lock().await;
    Json(drv.sessions_snapshot())
}

async fn dbus_dump(State(state): State<AppState>) -> impl IntoResponse {
    let drv = state.driver.lock().await;
    Json(drv.get_dbus_cache_snapshot())
}

async fn events(State(state): State<AppState>) -> impl IntoResponse {
    let rx = {
        let drv = state.driver.lock().await;
        drv.subscribe_status()
    };
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(payload) => Some(Ok::<Event, std::convert::Infallible>(
            Event::default().event("status").data(payload),
        )),
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { Redirect::to("/ui/index.html") }))
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/mode", post(set_mode))
        .route("/api/startstop", post(set_startstop))
        .route("/api/set_current", post(set_current))
        .route("/api/config", get(get_config).put(put_config))
        .route("/api/config/schema", get(get_config_schema))
        .route("/api/logs/tail", get(logs_tail))
        .route("/api/logs/head", get(logs_head))
        .route("/api/logs/download", get(logs_download))
        .route("/api/sessions", get(sessions))
        .route("/api/dbus", get(dbus_dump))
        .route("/api/events", get(events))
        .nest_service(
            "/ui",
            get_service(ServeDir::new("./webui").append_index_html_on_directories(true))
                .handle_error(|_| async { StatusCode::INTERNAL_SERVER_ERROR }),
        )
        .nest_service(
            "/app",
            get_service(ServeDir::new("./webui").append_index_html_on_directories(true))
                .handle_error(|_| async { StatusCode::INTERNAL_SERVER_ERROR }),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(driver: Arc<Mutex<ChargerEngine>>, host: &str, port: u16) -> anyhow::Result<()> {
    let state = AppState { driver };
    let router = build_router(state);

    let logger = crate::logging::get_logger("web");
    {
        let msg = format!(
            "Starting web server; requested host={}, port={}",
            host, port
        );
        logger.info(&msg);
    }

    let (addr, parsed_ok): (SocketAddr, bool) = match host.parse::<IpAddr>() {
        Ok(ip) => (SocketAddr::new(ip, port), true),
        Err(_) => (([127, 0, 0, 1], port).into(), false),
    };
    if !parsed_ok {
        let warn_msg = format!("Invalid host '{}'; falling back to 127.0.0.1", host);
        logger.warn(&warn_msg);
    }
    {
        let bind_msg = format!("Binding web server to {}:{}", addr.ip(), addr.port());
        logger.info(&bind_msg);
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    {
        let listen_msg = format!(
            "Web server listening at http://{}:{} (UI /ui, API /api)",
            local_addr.ip(),
            local_addr.port()
        );
        logger.info(&listen_msg);
    }

    axum::serve(listener, router).await?;
    Ok(())
}
