pub mod app;
pub mod cli;
pub mod config;
pub mod console;
pub mod error;
pub mod telemetry;
