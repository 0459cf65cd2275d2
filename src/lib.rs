pub mod api;
pub mod config;
pub mod inference;
pub mod metrics;
pub mod protocol;
pub mod rate_limit;
pub mod session;
pub mod snapshot;
