//! HTTP endpoints.
//!
//! | Route | Response |
//! |-------|----------|
//! | `GET /devices/:name[?ordered=true]` | streamed `text/plain` script results |
//! | `GET /details/:name` | JSON device snapshot |
//! | `GET /registered_devices` | JSON list of device names |
//! | `GET /discovery` | Prometheus HTTP service-discovery targets |
//!
//! Request-fatal failures map to status codes: unknown device 404, rejected
//! host key 403, failed authentication 401, unreachable device 502, and
//! unreadable registry, script list or secret 500.

use std::collections::BTreeMap;
use std::sync::Arc;

use poem::error::ResponseError;
use poem::http::{Method, StatusCode};
use poem::middleware::{Cors, Tracing};
use poem::web::{Data, Json, Path, Query};
use poem::{Body, Endpoint, EndpointExt, Response, Route, get, handler};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::error::{OrchestrationError, SessionError};
use super::orchestrator::Orchestrator;
use super::sink::SinkOrder;
use super::types::{DeviceSnapshot, DiscoveryTargetGroup, RegisteredDevices};

/// Front-end origins allowed to call the API.
pub const ALLOWED_ORIGINS: [&str; 3] = [
    "http://localhost:3000",
    "http://localhost:5173",
    "http://localhost:8080",
];

/// Shared state of the HTTP layer.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Port this server listens on, advertised by `/discovery`.
    pub port: u16,
}

impl ResponseError for OrchestrationError {
    fn status(&self) -> StatusCode {
        match self {
            OrchestrationError::UnknownDevice(_) => StatusCode::NOT_FOUND,
            OrchestrationError::Registry(_)
            | OrchestrationError::Scripts(_)
            | OrchestrationError::Secret(_)
            | OrchestrationError::Inspection { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            OrchestrationError::Session(SessionError::HostKeyRejected { .. }) => {
                StatusCode::FORBIDDEN
            }
            OrchestrationError::Session(SessionError::Auth { .. }) => StatusCode::UNAUTHORIZED,
            OrchestrationError::Session(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RunQuery {
    #[serde(default)]
    ordered: bool,
}

#[handler]
async fn run_scripts(
    Path(name): Path<String>,
    Query(query): Query<RunQuery>,
    state: Data<&AppState>,
) -> poem::Result<Response> {
    let order = if query.ordered {
        SinkOrder::ScriptList
    } else {
        SinkOrder::Completion
    };
    let run = state
        .orchestrator
        .run_device(&name, order, CancellationToken::new())
        .await?;

    Ok(Response::builder()
        .content_type("text/plain; charset=utf-8")
        .body(Body::from_async_read(run.body)))
}

#[handler]
async fn device_details(
    Path(name): Path<String>,
    state: Data<&AppState>,
) -> poem::Result<Json<DeviceSnapshot>> {
    let cancel = CancellationToken::new();
    // Stops the probes if the client goes away mid-request
    let _cancel_on_drop = cancel.clone().drop_guard();
    let snapshot = state.orchestrator.inspect(&name, cancel).await?;
    Ok(Json(snapshot))
}

#[handler]
async fn registered_devices(state: Data<&AppState>) -> poem::Result<Json<RegisteredDevices>> {
    let registry = state
        .orchestrator
        .registry()
        .await
        .map_err(OrchestrationError::from)?;
    Ok(Json(RegisteredDevices {
        registered_devices: registry.names(),
    }))
}

#[handler]
async fn discovery(state: Data<&AppState>) -> poem::Result<Json<Vec<DiscoveryTargetGroup>>> {
    let registry = state
        .orchestrator
        .registry()
        .await
        .map_err(OrchestrationError::from)?;
    let target = format!("localhost:{}", state.port);

    let groups = registry
        .names()
        .into_iter()
        .map(|name| DiscoveryTargetGroup {
            targets: vec![target.clone()],
            labels: BTreeMap::from([("path".to_string(), format!("/devices/{}", name))]),
        })
        .collect();
    Ok(Json(groups))
}

fn cors() -> Cors {
    Cors::new()
        .allow_origins(ALLOWED_ORIGINS)
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(["Content-Type", "Authorization"])
}

/// Build the HTTP application.
pub fn app(state: AppState) -> impl Endpoint {
    Route::new()
        .at("/devices/:name", get(run_scripts))
        .at("/details/:name", get(device_details))
        .at("/registered_devices", get(registered_devices))
        .at("/discovery", get(discovery))
        .data(state)
        .with(cors())
        .with(Tracing)
}
