//! cutover - release packaging, verification, and atomic deployment
//!
//! Packages versioned releases into signed, checksummed artifacts,
//! validates target machines before install/upgrade, and performs atomic
//! cutover with health-check-gated automatic reversion.

pub mod builder;
pub mod config;
pub mod engine;
pub mod manifest;
pub mod migrate;
pub mod preflight;
pub mod signing;
pub mod store;

pub use builder::{BuildReport, BuildSpec, Builder};
pub use config::Config;
pub use engine::{CutoverEngine, DeployError, DeployKind, DeployReport, DeployState, EngineOptions};
pub use manifest::{Channel, ReleaseManifest};
pub use preflight::{MachineState, PreflightReport};
pub use store::{ReleaseStore, SharedState};
