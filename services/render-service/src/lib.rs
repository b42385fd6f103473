//! The Render Service process: the browser-tab pool and its render RPC
//! surface (§4.7, §6). Owns no cache or rule state -- it receives a fully
//! resolved job from the EG and hands back a [`gateway_core::dispatch::RenderResult`].

pub mod browser_driver;
pub mod browser_pool;
pub mod config;
pub mod handlers;
pub mod index_status;
pub mod script_clean;

use std::sync::Arc;

use gateway_core::dispatch::Renderer;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<dyn Renderer>,
}
