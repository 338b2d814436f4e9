//! HTTP and WebSocket surface.

mod routes;
mod ws;

pub use routes::{build_router, AppState};
