//! VDS session orchestrator.
//!
//! Drives analysis sessions through a fixed plan of steps, pausing at
//! approval checkpoints according to the session's autonomy level and
//! recording every outcome durably.

pub mod api;
pub mod audit;
pub mod capability;
pub mod config;
pub mod errors;
pub mod executor;
pub mod gate;
pub mod plan;
pub mod server;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod workflow;
pub mod ws;
