use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};

use gateway_core::ids::RequestId;
use gateway_core::pipeline::PipelineRequest;

use crate::AppState;

/// `GET /render?url=<encoded>` (§6): the primary entry point. The render
/// key travels in `X-Render-Key`, HAR capture is opted into via `X-HAR:
/// true`; everything else is delegated to the pipeline state machine.
pub async fn render(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: axum::http::HeaderMap,
) -> Response {
    let raw_url = params.get("url").cloned().unwrap_or_default();
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let render_key = headers.get("x-render-key").and_then(|v| v.to_str().ok()).map(str::to_string);
    let har = headers.get("x-har").and_then(|v| v.to_str().ok()).map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false);
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| RequestId::new().to_string());

    let req = PipelineRequest { raw_url, user_agent, render_key, request_id, har };
    let resp = state.pipeline.handle(req).await;

    let mut out = Response::builder().status(resp.status);
    if let Some(ct) = resp.content_type {
        out = out.header(axum::http::header::CONTENT_TYPE, ct);
    }
    let mut response = out.body(axum::body::Body::from(resp.body)).unwrap_or_else(|_| {
        axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response()
    });
    response.headers_mut().extend(resp.headers.into_header_map());
    response
}
