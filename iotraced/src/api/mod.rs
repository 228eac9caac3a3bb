//! Control surface: device registry management, session lifecycle, metrics,
//! and a live event feed. Routes mirror the daemon's internal state rather
//! than a process-tracer's alert history, but the axum wiring (shared
//! `AppState`, SSE via a broadcast channel, a plain Prometheus text
//! endpoint) follows the same shape the rest of this codebase uses for its
//! HTTP control plane.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Json,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::BroadcastStream;

use crate::metrics::Metrics;
use crate::registry::DeviceRegistry;
use crate::session::TraceManager;

pub struct AppState {
    pub devices: Arc<DeviceRegistry>,
    pub metrics: Arc<Metrics>,
    pub sessions: RwLock<std::collections::HashMap<String, Arc<TraceManager>>>,
    pub ring_size_mb: usize,
    pub events: broadcast::Sender<String>,
}

impl AppState {
    pub fn new(devices: Arc<DeviceRegistry>, metrics: Arc<Metrics>, ring_size_mb: usize) -> Self {
        let (events, _rx) = broadcast::channel(1024);
        Self {
            devices,
            metrics,
            sessions: RwLock::new(std::collections::HashMap::new()),
            ring_size_mb,
            events,
        }
    }

    /// Called by the daemon's drain loop for every framed event, feeding the
    /// SSE stream. No-op if nobody is currently subscribed.
    pub fn publish_event(&self, framed_json: String) {
        let _ = self.events.send(framed_json);
    }
}

pub fn all_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/version", get(version_handler))
        .route("/size", get(size_handler))
        .route("/devices", get(list_devices).post(add_device))
        .route("/devices/{dev_id}", axum::routing::delete(remove_device))
        .route("/trace/wait", post(trace_wait))
        .route("/trace/interrupt/{label}", post(trace_interrupt))
        .route("/metrics", get(prometheus_metrics))
        .route("/events", get(stream_events))
        .with_state(state)
}

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
    protocol_major: u8,
    protocol_minor: u8,
}

async fn version_handler() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
        protocol_major: iotrace_common::PROTOCOL_VERSION_MAJOR,
        protocol_minor: iotrace_common::PROTOCOL_VERSION_MINOR,
    })
}

#[derive(Serialize)]
struct SizeResponse {
    ring_size_mb: usize,
    max_traced_devices: usize,
}

async fn size_handler(State(state): State<Arc<AppState>>) -> Json<SizeResponse> {
    Json(SizeResponse {
        ring_size_mb: state.ring_size_mb,
        max_traced_devices: iotrace_common::MAX_TRACED_DEVICES,
    })
}

async fn list_devices(State(state): State<Arc<AppState>>) -> Json<Vec<DeviceView>> {
    Json(
        state
            .devices
            .list()
            .into_iter()
            .map(DeviceView::from)
            .collect(),
    )
}

#[derive(Serialize)]
struct DeviceView {
    dev_id: u64,
    path: String,
    major: u32,
    minor: u32,
}

impl From<crate::registry::TracedDevice> for DeviceView {
    fn from(d: crate::registry::TracedDevice) -> Self {
        Self {
            dev_id: d.dev_id,
            path: d.path,
            major: d.major,
            minor: d.minor,
        }
    }
}

#[derive(Deserialize)]
struct AddDeviceRequest {
    path: String,
    major: u32,
    minor: u32,
}

async fn add_device(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddDeviceRequest>,
) -> Result<Json<DeviceView>, ApiError> {
    let device = state.devices.add(&req.path, req.major, req.minor)?;
    Ok(Json(DeviceView::from(device)))
}

async fn remove_device(
    State(state): State<Arc<AppState>>,
    Path(dev_id): Path<u64>,
) -> Result<StatusCode, ApiError> {
    state.devices.remove(dev_id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct TraceWaitRequest {
    label: String,
    max_duration_secs: Option<u64>,
}

/// Start a session (if not already running) and block until it expires.
/// Sessions with no `max_duration_secs` return immediately with the
/// just-created summary; callers drive their own polling via repeated
/// `/trace/wait` calls or an interrupt.
async fn trace_wait(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TraceWaitRequest>,
) -> Json<crate::session::TraceSummary> {
    let duration = req.max_duration_secs.map(Duration::from_secs);
    let manager = {
        let mut sessions = state.sessions.write().await;
        sessions
            .entry(req.label.clone())
            .or_insert_with(|| Arc::new(TraceManager::new(req.label.clone(), duration)))
            .clone()
    };

    if let Some(d) = duration {
        tokio::time::sleep(d).await;
    }
    Json(manager.summary())
}

async fn trace_interrupt(
    State(state): State<Arc<AppState>>,
    Path(label): Path<String>,
) -> Result<Json<crate::session::TraceSummary>, ApiError> {
    let sessions = state.sessions.read().await;
    let manager = sessions
        .get(&label)
        .ok_or_else(|| crate::error::IoTraceError::UnknownSession(label.clone()))?;
    Ok(Json(manager.summary()))
}

async fn prometheus_metrics(State(state): State<Arc<AppState>>) -> String {
    let m = &state.metrics;
    format!(
        "# HELP iotrace_events_total Total events drained from all rings.\n\
         # TYPE iotrace_events_total counter\n\
         iotrace_events_total {}\n\
         # HELP iotrace_events_per_sec Rolling events/sec as of the last rollup.\n\
         # TYPE iotrace_events_per_sec gauge\n\
         iotrace_events_per_sec {}\n\
         # HELP iotrace_lost_events_total Records dropped to ring overflow.\n\
         # TYPE iotrace_lost_events_total counter\n\
         iotrace_lost_events_total {}\n\
         # HELP iotrace_active_devices Devices currently traced.\n\
         # TYPE iotrace_active_devices gauge\n\
         iotrace_active_devices {}\n\
         # HELP iotrace_active_sessions Trace sessions currently open.\n\
         # TYPE iotrace_active_sessions gauge\n\
         iotrace_active_sessions {}\n\
         # HELP iotrace_uptime_seconds Daemon uptime.\n\
         # TYPE iotrace_uptime_seconds counter\n\
         iotrace_uptime_seconds {}\n",
        m.events_total(),
        m.events_per_sec(),
        m.lost_events_total(),
        m.active_devices(),
        m.active_sessions(),
        m.uptime_seconds(),
    )
}

async fn stream_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(json) => Some(Ok(Event::default().data(json))),
        Err(_lagged) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

struct ApiError(crate::error::IoTraceError);

impl From<crate::error::IoTraceError> for ApiError {
    fn from(err: crate::error::IoTraceError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        use crate::error::IoTraceError::*;
        let status = match &self.0 {
            DeviceNotFound(_) | UnknownSession(_) => StatusCode::NOT_FOUND,
            DeviceRegistryFull { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState::new(
            Arc::new(DeviceRegistry::new()),
            Arc::new(Metrics::new()),
            4,
        ))
    }

    #[tokio::test]
    async fn add_then_list_device() {
        let state = test_state();
        let resp = add_device(
            State(state.clone()),
            Json(AddDeviceRequest {
                path: "/dev/sda".into(),
                major: 8,
                minor: 0,
            }),
        )
        .await
        .unwrap();
        assert_eq!(resp.0.path, "/dev/sda");

        let Json(devices) = list_devices(State(state)).await;
        assert_eq!(devices.len(), 1);
    }

    #[tokio::test]
    async fn remove_unknown_device_is_not_found() {
        let state = test_state();
        let err = remove_device(State(state), Path(0xdead)).await.unwrap_err();
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn trace_wait_without_duration_returns_immediately() {
        let state = test_state();
        let Json(summary) = trace_wait(
            State(state),
            Json(TraceWaitRequest {
                label: "sess-a".into(),
                max_duration_secs: None,
            }),
        )
        .await;
        assert_eq!(summary.label, "sess-a");
        assert!(!summary.expired);
    }

    #[tokio::test]
    async fn interrupt_unknown_session_errors() {
        let state = test_state();
        let err = trace_interrupt(State(state), Path("nope".into()))
            .await
            .unwrap_err();
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn prometheus_output_contains_expected_metric_names() {
        let metrics = Metrics::new();
        metrics.record_record_type(iotrace_common::RecordType::Io);
        let rendered = format!("iotrace_events_total {}", metrics.events_total());
        assert!(rendered.contains("iotrace_events_total"));
    }
}
