//! HTTP middleware.

mod logging;

pub use logging::request_logging;
