//! Edge irrigation node: weather-adjusted zone controller.
//!
//! The controller decides, per circuit and per day, whether to irrigate and
//! for how long, based on a configured per-circuit water target adjusted by
//! recent weather deviations from reference conditions. Execution is
//! fail-safe: valves close on every exit path, durable state survives
//! unclean shutdowns, and concurrent manual commands are serialized through
//! a typed worker registry.
//!
//! External surfaces (MQTT, REST, dashboard) are separate processes built
//! on [`controller::Controller`]'s command and status API.

pub mod auto;
pub mod circuit;
pub mod conditions;
pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod planner;
pub mod relay;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod types;
pub mod weather;
pub mod workers;
