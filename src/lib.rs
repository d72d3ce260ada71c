pub mod auth_cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod health;
pub mod limiter;
pub mod metrics;
pub mod middleware;
pub mod notification;
pub mod pushkin;
pub mod registry;
pub mod telemetry;
