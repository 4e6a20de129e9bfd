//! HTTP transport for the ultrametre bridge.
//!
//! A thin axum layer over [`ultrametre_core::Bridge`]: JSON control endpoints
//! under `/bridge/*`, a server-sent event stream, and static UI assets.

pub mod handlers;
pub mod server;
pub mod sse;
pub mod state;

pub use state::{api_routes, AppState};
