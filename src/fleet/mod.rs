//! Switch fleet orchestration.
//!
//! This module is organized into the following submodules:
//!
//! - `config`: Tunable resolution with environment variable support
//! - `error`: Error types and dial-error classification for retry logic
//! - `types`: Device records, script jobs, task results and snapshots
//! - `deadline`: Deadline and cancellation bound shared by every remote operation
//! - `auth`: Authentication strategies for the SSH transport
//! - `trust`: Host key verification policies
//! - `secrets`: Credential resolution from registry secret references
//! - `session`: The `RemoteSession` seam and its SSH implementation
//! - `client`: SSH dial, retry and exec plumbing
//! - `registry` / `scripts`: Loading the device registry and script list
//! - `transfer` / `command`: File transfer and command sub-channel operations
//! - `task`: The per-script upload -> execute -> cleanup state machine
//! - `dispatcher`: Bounded fan-out of script tasks over one session
//! - `sink`: Serialization of task results into one response stream
//! - `inspector`: Sequential diagnostic probe of a device
//! - `orchestrator`: Ties a device, a session and a script batch together
//! - `routes`: HTTP endpoints

pub mod auth;
pub(crate) mod client;
pub mod command;
pub mod config;
pub mod deadline;
pub mod dispatcher;
pub mod error;
pub mod inspector;
pub mod orchestrator;
pub mod registry;
pub mod routes;
pub mod scripts;
pub mod secrets;
pub mod session;
pub mod sink;
pub mod task;
pub mod transfer;
pub mod trust;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::FleetConfig;
pub use orchestrator::Orchestrator;
