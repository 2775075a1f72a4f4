use axum::extract::State;
use axum::response::Html;
use std::sync::Arc;

use super::viewer::single_page_html;
use crate::error::{Result, ViewError};
use crate::webrtc::{decode_session, encode_session, SignalingAdapter};

/// Exchange an encoded offer for an encoded answer
///
/// The offer is the first non-empty line of the body.
pub async fn offer(State(adapter): State<Arc<SignalingAdapter>>, body: String) -> Result<String> {
    let line = body
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| ViewError::BadRequest("empty offer".into()))?;

    let offer = decode_session(line)?;
    let answer = adapter.handle_offer(offer).await?;
    encode_session(&answer)
}

/// Standalone viewer page for the adapter's view
pub async fn viewer(State(adapter): State<Arc<SignalingAdapter>>) -> Html<String> {
    Html(single_page_html(adapter.view()))
}
