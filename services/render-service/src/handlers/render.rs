use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;

use gateway_core::dispatch::{RenderJob, Renderer};

use crate::AppState;

/// `POST /render` (§4.7, §6): the render RPC surface the EG's
/// [`gateway_core::dispatch::RendererDispatcher`] calls after reserving a
/// tab. The tab itself was already reserved by the caller through the
/// coordination store; this endpoint only runs the job against the local
/// browser-tab pool and hands back the structured result.
pub async fn render(State(state): State<AppState>, Json(job): Json<RenderJob>) -> Response {
    match state.pool.render(job).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => e.into_response(),
    }
}
