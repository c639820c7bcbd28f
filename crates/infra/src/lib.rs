pub mod config;
pub mod connectors;
pub mod consumer;
pub mod db;
pub mod jobs;
pub mod logging;
pub mod repositories;
pub mod triggers;
pub mod wiring;
