//! Core library for the caravel remote execution tool.
//!
//! The crate exposes a platform abstraction for provisioning ephemeral
//! compute units, a session transport for moving bytes to and from them, an
//! orchestrator that drives the full run lifecycle (create → power on →
//! wait → upload → exec → download → destroy), and the session server that
//! runs inside the provisioned container.

pub mod cli;
pub mod config;
pub mod keys;
pub mod platform;
pub mod run;
pub mod server;
pub mod staging;
pub mod transport;

pub use config::{ConfigError, PlatformApiConfig, RunConfig};
pub use keys::{KeyError, KeyPair};
pub use platform::{
    ComputeUnit, CreateRequest, CreateRequestBuilder, Endpoint, LifecycleState, PlatformClient,
    PlatformError, ServiceInfo,
};
pub use run::{RunError, RunOrchestrator};
pub use server::{ServerConfig, ServerError};
pub use staging::{StagingArea, StagingError};
pub use transport::{ExecSinks, SessionTransport, TransportError};
