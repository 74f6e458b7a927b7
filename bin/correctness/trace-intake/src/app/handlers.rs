use axum::{
    extract::{Query, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tracewire::{
    api_v3::GetServicesResponse,
    query::{Envelope, StructuredError, Trace},
};
use tracing::{debug, info, warn};

use super::BackendState;

// Smallest valid ICO file: a single 1x1 32-bit image.
const FAVICON: &[u8] = &[
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x20, 0x00, 0x30, 0x00, 0x00, 0x00, 0x16,
    0x00, 0x00, 0x00, 0x28, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x01, 0x00, 0x20, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

#[derive(Deserialize)]
pub struct TraceSearch {
    service: Option<String>,
    tag: Option<String>,
}

#[derive(Deserialize)]
pub struct SamplingQuery {
    service: Option<String>,
}

fn envelope_error<T>(status: StatusCode, msg: String) -> (StatusCode, Json<Envelope<T>>) {
    let mut envelope = Envelope::from_data(Vec::new());
    envelope.errors = Some(vec![StructuredError {
        code: i32::from(status.as_u16()),
        msg,
        trace_id: None,
    }]);
    (status, Json(envelope))
}

pub async fn handle_root() -> Html<&'static str> {
    debug!("Received request for UI root.");

    Html("<!doctype html><html><head><title>Trace Intake</title></head><body></body></html>")
}

pub async fn handle_favicon() -> impl IntoResponse {
    debug!("Received request for favicon.");

    ([(CONTENT_TYPE, "image/x-icon")], FAVICON)
}

pub async fn handle_services(State(state): State<BackendState>, headers: HeaderMap) -> Json<Envelope<String>> {
    match headers.get(state.correlation_header()).map(|v| v.to_str()) {
        Some(Ok(tag)) => {
            let trace_id = state.record_trace("/api/services", tag);
            info!(%trace_id, %tag, "Recorded trace for correlated request.");
        }
        Some(Err(_)) => warn!("Ignoring correlation header with a non-ASCII value."),
        None => debug!("Received services request."),
    }

    Json(Envelope::from_data(state.services()))
}

pub async fn handle_traces(
    State(state): State<BackendState>, Query(search): Query<TraceSearch>,
) -> (StatusCode, Json<Envelope<Trace>>) {
    let Some(service) = search.service else {
        return envelope_error(StatusCode::BAD_REQUEST, "parameter 'service' is required".to_string());
    };

    let tag = match search.tag.as_deref().map(|tag| tag.split_once(':')) {
        None => None,
        Some(Some(pair)) => Some(pair),
        Some(None) => {
            return envelope_error(
                StatusCode::BAD_REQUEST,
                "malformed 'tag' parameter, expected 'key:value'".to_string(),
            )
        }
    };

    let traces = state.search(&service, tag);
    debug!(%service, ?tag, traces = traces.len(), "Served trace search.");

    (StatusCode::OK, Json(Envelope::from_data(traces)))
}

pub async fn handle_services_v3(State(state): State<BackendState>) -> Json<GetServicesResponse> {
    debug!("Received API v3 services request.");

    Json(GetServicesResponse {
        services: state.services(),
    })
}

pub async fn handle_sampling(State(state): State<BackendState>, Query(query): Query<SamplingQuery>) -> Response {
    match query.service {
        Some(service) => {
            debug!(%service, "Served sampling strategy.");
            Json(state.sampling_strategy()).into_response()
        }
        None => (StatusCode::BAD_REQUEST, "'service' parameter must be provided").into_response(),
    }
}
