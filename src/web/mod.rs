//! HTTP signaling endpoint and browser viewer

mod handlers;
mod routes;
pub mod viewer;

pub use routes::create_router;
pub use viewer::{single_page_html, ViewerPage};
