use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use gateway_core::ids::RequestId;
use gateway_core::pipeline::PipelineRequest;

use crate::AppState;

/// `GET /debug/har/render?url=…&dimension=…` (§6): internal HAR capture
/// surface, gated on `X-Internal-Auth` matching the configured shared
/// secret. Selects the requested dimension by forwarding its `render_ua`
/// and asks the pipeline for a HAR-carrying render.
pub async fn debug_har_render(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: axum::http::HeaderMap,
) -> Response {
    let provided = headers.get("x-internal-auth").and_then(|v| v.to_str().ok());
    let expected = state.internal_auth_key.as_deref();
    match (expected, provided) {
        (Some(expected), Some(provided)) if expected == provided => {}
        _ => return StatusCode::UNAUTHORIZED.into_response(),
    }

    let raw_url = params.get("url").cloned().unwrap_or_default();
    let dimension_name = params.get("dimension").cloned();

    let user_agent = dimension_name
        .as_deref()
        .and_then(|name| {
            url::Url::parse(&raw_url).ok().and_then(|u| {
                u.host_str().and_then(|h| state.hosts.resolve_host(h)).and_then(|host| {
                    host.dimension_by_name(name).map(|d| d.render_ua.clone())
                })
            })
        })
        .unwrap_or_default();

    let req = PipelineRequest {
        raw_url,
        user_agent,
        render_key: headers.get("x-render-key").and_then(|v| v.to_str().ok()).map(str::to_string),
        request_id: RequestId::new().to_string(),
        har: true,
    };

    let resp = state.pipeline.handle(req).await;
    let mut out = axum::response::Response::builder().status(resp.status);
    if let Some(ct) = resp.content_type {
        out = out.header(axum::http::header::CONTENT_TYPE, ct);
    }
    let mut response = out
        .body(axum::body::Body::from(resp.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    response.headers_mut().extend(resp.headers.into_header_map());
    response
}
