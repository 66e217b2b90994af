//! Client-side cache, poll and reconcile engine for on-ledger Clash matches.

pub mod api_error;
pub mod clock;
pub mod config;
pub mod engine_error;
pub mod http;
pub mod middleware;
pub mod models;
pub mod service;
pub mod store;
pub mod telemetry;
