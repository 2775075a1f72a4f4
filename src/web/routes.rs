use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use super::handlers;
use crate::webrtc::SignalingAdapter;

/// Create the signaling router for one view
///
/// Serves `POST /offer_<n>` and the standalone viewer at `GET /view_<n>`;
/// browsers may call the signaling route cross-origin.
pub fn create_router(adapter: Arc<SignalingAdapter>) -> Router {
    let viewer_path = format!("/{}", adapter.view().config().viewer_name());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(&format!("/{}", adapter.handler_name()), post(handlers::offer))
        .route(&viewer_path, get(handlers::viewer))
        .layer(cors)
        .with_state(adapter)
}
