//! Request handlers for the HTTP+JSON wire surface (§6).

use axum::extract::{Path, Query as AxumQuery, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use flowprobe_core::error::ErrorKind;
use flowprobe_core::query::condition::{compile, StdHostResolver};
use flowprobe_core::query::{execute_query, sort_and_truncate, Query, QueryResult};

use crate::state::SharedState;
use crate::wire::{decode_flow_key, CaptureConfigDto, ConfigUpdateRequest, FlowRowDto, QueryRequest, StatusDto};

#[derive(Debug, Serialize)]
pub(crate) struct Envelope<T: Serialize> {
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> Envelope<T> {
    fn ok(status: StatusCode, data: T) -> (StatusCode, Json<Self>) {
        (status, Json(Envelope { status_code: status.as_u16(), error: None, data: Some(data) }))
    }

    fn err(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Self>) {
        (status, Json(Envelope { status_code: status.as_u16(), error: Some(message.into()), data: None }))
    }
}

fn status_for_error_kind(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Corrupt => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Timeout => StatusCode::REQUEST_TIMEOUT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct IfacesQuery {
    pub ifaces: Option<String>,
}

fn selected_ifaces(known: Vec<String>, filter: &Option<String>) -> Vec<String> {
    match filter {
        None => known,
        Some(list) => {
            let wanted: Vec<&str> = list.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
            known.into_iter().filter(|k| wanted.contains(&k.as_str())).collect()
        }
    }
}

/// `POST /_query` — compiles and runs a query, subject to the query-concurrency semaphore (§6).
#[utoipa::path(post, path = "/_query", responses((status = 200, description = "query result")))]
pub(crate) async fn handle_query(
    State(state): State<SharedState>,
    Json(req): Json<QueryRequest>,
) -> (StatusCode, Json<Envelope<QueryResult>>) {
    let Ok(_permit) = state.query_semaphore.try_acquire() else {
        warn!("query rejected: concurrency limit reached");
        return Envelope::err(StatusCode::TOO_MANY_REQUESTS, "query concurrency limit reached");
    };

    let query: Query = match req.into_query() {
        Ok(q) => q,
        Err(e) => return Envelope::err(status_for_error_kind(e.kind), e.to_string()),
    };

    let resolver = StdHostResolver;
    let compiled = match compile(&query.condition, &resolver, query.resolve_dns) {
        Ok(c) => c,
        Err(e) => return Envelope::err(status_for_error_kind(e.kind), e.to_string()),
    };

    let db_root = state.db_root.clone();
    let result = {
        let manager = state.manager.lock().expect("capture manager mutex poisoned");
        execute_query(&db_root, &query, &compiled, Some(&manager), Some(&state.watchdog))
    };

    match result {
        Ok(result) => Envelope::ok(StatusCode::OK, sort_and_truncate(result, &query)),
        Err(e) => Envelope::err(status_for_error_kind(e.kind), e.to_string()),
    }
}

/// `GET /status` and `GET /status/:iface` (§6), with optional `?ifaces=a,b,c` selection.
#[utoipa::path(get, path = "/status", responses((status = 200, description = "capture status per interface")))]
pub(crate) async fn handle_status(
    State(state): State<SharedState>,
    AxumQuery(q): AxumQuery<IfacesQuery>,
) -> (StatusCode, Json<Envelope<Vec<StatusDto>>>) {
    let manager = state.manager.lock().expect("capture manager mutex poisoned");
    let known = manager.interfaces();
    let names = selected_ifaces(known, &q.ifaces);
    if names.is_empty() {
        return (StatusCode::NO_CONTENT, Json(Envelope { status_code: 204, error: None, data: None }));
    }
    let rows: Vec<StatusDto> = names
        .iter()
        .filter_map(|n| manager.status(n).ok())
        .map(|s| StatusDto::from(&s))
        .collect();
    Envelope::ok(StatusCode::OK, rows)
}

#[utoipa::path(get, path = "/status/{iface}", responses((status = 200, description = "capture status for one interface")))]
pub(crate) async fn handle_status_one(
    State(state): State<SharedState>,
    Path(iface): Path<String>,
) -> (StatusCode, Json<Envelope<StatusDto>>) {
    let manager = state.manager.lock().expect("capture manager mutex poisoned");
    match manager.status(&iface) {
        Ok(status) => Envelope::ok(StatusCode::OK, StatusDto::from(&status)),
        Err(e) => Envelope::err(status_for_error_kind(e.kind), e.to_string()),
    }
}

/// `GET /config` and `GET /config/:iface` (§6): the running per-interface capture configuration.
#[utoipa::path(get, path = "/config", responses((status = 200, description = "capture config per interface")))]
pub(crate) async fn handle_config(
    State(state): State<SharedState>,
    AxumQuery(q): AxumQuery<IfacesQuery>,
) -> (StatusCode, Json<Envelope<Vec<(String, CaptureConfigDto)>>>) {
    let manager = state.manager.lock().expect("capture manager mutex poisoned");
    let known = manager.interfaces();
    let names = selected_ifaces(known, &q.ifaces);
    if names.is_empty() {
        return (StatusCode::NO_CONTENT, Json(Envelope { status_code: 204, error: None, data: None }));
    }
    let rows: Vec<(String, CaptureConfigDto)> = names
        .iter()
        .filter_map(|n| manager.status(n).ok().map(|s| (n.clone(), CaptureConfigDto::from(&s.config))))
        .collect();
    Envelope::ok(StatusCode::OK, rows)
}

#[utoipa::path(get, path = "/config/{iface}", responses((status = 200, description = "capture config for one interface")))]
pub(crate) async fn handle_config_one(
    State(state): State<SharedState>,
    Path(iface): Path<String>,
) -> (StatusCode, Json<Envelope<CaptureConfigDto>>) {
    let manager = state.manager.lock().expect("capture manager mutex poisoned");
    match manager.status(&iface) {
        Ok(status) => Envelope::ok(StatusCode::OK, CaptureConfigDto::from(&status.config)),
        Err(e) => Envelope::err(status_for_error_kind(e.kind), e.to_string()),
    }
}

/// `PUT /config` (§6): applies a capture configuration to the named interfaces, adding any that
/// don't exist yet. The packet source for a newly added interface is the crate's mock seam
/// (§1 non-goals: this crate consumes frames from a platform-supplied source, never captures
/// them itself), exactly as `flowprobed` wires it at startup.
#[utoipa::path(put, path = "/config", responses((status = 200, description = "config applied")))]
pub(crate) async fn handle_config_put(
    State(state): State<SharedState>,
    Json(req): Json<ConfigUpdateRequest>,
) -> (StatusCode, Json<Envelope<()>>) {
    let mut manager = state.manager.lock().expect("capture manager mutex poisoned");
    let config: flowprobe_core::capture::CaptureConfig = req.config.into();
    for iface in &req.ifaces {
        if manager.update(iface, config.clone()).is_err() {
            use flowprobe_core::capture::MockPacketSource;
            if let Err(e) = manager.add(iface.clone(), config.clone(), Box::new(MockPacketSource::empty())) {
                return Envelope::err(status_for_error_kind(e.kind), e.to_string());
            }
        }
    }
    info!("config applied to {} interface(s)", req.ifaces.len());
    Envelope::ok(StatusCode::OK, ())
}

/// `POST /config/_reload` (§6): re-reads the on-disk configuration file, if one was given at
/// startup.
#[utoipa::path(post, path = "/config/_reload", responses((status = 200, description = "config reloaded")))]
pub(crate) async fn handle_config_reload(State(state): State<SharedState>) -> (StatusCode, Json<Envelope<()>>) {
    let Some(path) = state.config_path.clone() else {
        return Envelope::err(StatusCode::BAD_REQUEST, "no --config file was given at startup");
    };
    match flowprobe_core::config::Config::load(&path) {
        Ok(reloaded) => {
            *state.config.lock().expect("config mutex poisoned") = reloaded;
            info!("configuration reloaded from {}", path.display());
            Envelope::ok(StatusCode::OK, ())
        }
        Err(e) => Envelope::err(status_for_error_kind(e.kind), e.to_string()),
    }
}

/// `GET /flows` and `GET /flows/:iface` (§6): a point-in-time snapshot of live, in-memory flows.
#[utoipa::path(get, path = "/flows", responses((status = 200, description = "live flow snapshot")))]
pub(crate) async fn handle_flows(
    State(state): State<SharedState>,
    AxumQuery(q): AxumQuery<IfacesQuery>,
) -> (StatusCode, Json<Envelope<Vec<FlowRowDto>>>) {
    let manager = state.manager.lock().expect("capture manager mutex poisoned");
    let known = manager.interfaces();
    let names = selected_ifaces(known, &q.ifaces);
    if names.is_empty() {
        return (StatusCode::NO_CONTENT, Json(Envelope { status_code: 204, error: None, data: None }));
    }
    Envelope::ok(StatusCode::OK, flows_for(&manager, &names))
}

#[utoipa::path(get, path = "/flows/{iface}", responses((status = 200, description = "live flow snapshot for one interface")))]
pub(crate) async fn handle_flows_one(
    State(state): State<SharedState>,
    Path(iface): Path<String>,
) -> (StatusCode, Json<Envelope<Vec<FlowRowDto>>>) {
    let manager = state.manager.lock().expect("capture manager mutex poisoned");
    Envelope::ok(StatusCode::OK, flows_for(&manager, std::slice::from_ref(&iface)))
}

fn flows_for(manager: &flowprobe_core::capture::CaptureManager, ifaces: &[String]) -> Vec<FlowRowDto> {
    let snapshots = manager.snapshot_flows(ifaces);
    let mut rows = Vec::new();
    for (iface, map) in snapshots {
        for (bytes, is_v4, counters) in map.iter(None) {
            let (sip, dip, dport, proto) = decode_flow_key(bytes, is_v4);
            rows.push(FlowRowDto { iface: iface.clone(), sip, dip, dport, proto, counters });
        }
    }
    rows
}

#[utoipa::path(get, path = "/api/v1/health", responses((status = 200, description = "service is up")))]
pub(crate) async fn handle_health() -> &'static str {
    "ok"
}
