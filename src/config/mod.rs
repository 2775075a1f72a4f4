//! View configuration

mod schema;

pub use schema::ViewConfig;
