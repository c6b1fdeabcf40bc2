#![forbid(unsafe_code)]

pub mod activity;
pub mod api;
pub mod cache;
pub mod config;
pub mod errors;
pub mod liveness;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod substrate;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
