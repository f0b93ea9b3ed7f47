pub mod config;
pub mod registry;
pub mod routes;
pub mod telemetry;
