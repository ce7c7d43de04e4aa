//! Realtime delivery layer for chat and notifications.
//!
//! Connections are held by a per-process [`registry::ConnectionRegistry`];
//! events produced on any instance reach every instance through the
//! [`fanout::FanoutBridge`], and per-user status is derived by the
//! [`presence`] state machine.

pub mod config;
pub mod error;
pub mod fanout;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod presence;
pub mod rate_limit;
pub mod registry;
pub mod routes;
pub mod services;
pub mod sse;
pub mod state;
pub mod store;
pub mod topic;
pub mod websocket;
