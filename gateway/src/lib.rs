pub mod aggregate;
pub mod batching;
pub mod commands;
pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod fanout;
pub mod link;
pub mod metrics;
pub mod model;
pub mod persistence;
pub mod registry;
pub mod service;
pub mod session;
pub mod telemetry;
pub mod thresholds;
pub mod topic;

pub use errors::{Error, Result};
pub use service::StationCore;
