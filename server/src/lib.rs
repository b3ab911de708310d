//! trex server: axum HTTP + WebSocket gateway over trex-core sessions.

mod auth;
mod connection;
mod web_server;

pub use auth::{NoAuth, PrincipalResolver};
pub use web_server::run_gateway;
