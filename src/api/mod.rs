//! HTTP ingress for the bridge.

pub mod handlers;

pub use handlers::{router, AppState};
