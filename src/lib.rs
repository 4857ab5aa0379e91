pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod picks;
pub mod sampler;
pub mod scheduler;
