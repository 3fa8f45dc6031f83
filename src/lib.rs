//! yourVPN backend: fund-metered, on-demand VPN endpoints.
//!
//! Library crate shared by the `yvpn` binary and the integration tests in `tests/`.

pub mod api;
pub mod cli;
pub mod clock;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod lifecycle;
pub mod metrics;
pub mod models;
pub mod provider;
pub mod store;
