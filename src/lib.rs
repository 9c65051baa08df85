pub mod billing;
pub mod config;
pub mod error;
pub mod job_queue;
pub mod routes;

pub use config::{billing_config_from_env, server_config_from_env, BillingConfig, ServerConfig};
