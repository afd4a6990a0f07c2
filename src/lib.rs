#![deny(clippy::unwrap_used)]

pub mod fleet;

pub use fleet::{FleetConfig, Orchestrator};
