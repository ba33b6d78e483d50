//! Capability interface for the container-hosting platform.
//!
//! The orchestrator only ever talks to the platform through
//! [`PlatformClient`]; the production adapter lives in [`crate::platform::http`]
//! and tests substitute in-memory fakes.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

pub mod http;

/// TCP port the session server listens on inside the container.
pub const SHELL_PORT: u16 = 2222;
/// TCP port the liveness endpoint listens on inside the container.
pub const LIVENESS_PORT: u16 = 8080;

/// Parameters required to create a new compute unit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateRequest {
    /// Display name for the application.
    pub name: String,
    /// Fully qualified container image reference.
    pub image: String,
    /// Commercial plan identifier (for example `free`).
    pub plan: String,
    /// TCP ports the container must expose.
    pub ports: Vec<PortSpec>,
    /// Environment variables injected into the container.
    pub env: Vec<EnvVar>,
}

impl CreateRequest {
    /// Starts a builder for a [`CreateRequest`].
    #[must_use]
    pub fn builder() -> CreateRequestBuilder {
        CreateRequestBuilder::default()
    }

    /// Validates the request, returning a descriptive error when a required
    /// field is missing.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Validation`] when any required field is empty.
    pub fn validate(&self) -> Result<(), PlatformError> {
        if self.name.is_empty() {
            return Err(PlatformError::Validation("name".to_owned()));
        }
        if self.image.is_empty() {
            return Err(PlatformError::Validation("image".to_owned()));
        }
        if self.plan.is_empty() {
            return Err(PlatformError::Validation("plan".to_owned()));
        }
        if self.ports.is_empty() {
            return Err(PlatformError::Validation("ports".to_owned()));
        }
        Ok(())
    }
}

/// Builder for [`CreateRequest`] that defers trimming and validation to
/// construction.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CreateRequestBuilder {
    name: String,
    image: String,
    plan: String,
    ports: Vec<PortSpec>,
    env: Vec<EnvVar>,
}

impl CreateRequestBuilder {
    /// Sets the application name.
    #[must_use]
    pub fn name(mut self, value: impl Into<String>) -> Self {
        self.name = value.into();
        self
    }

    /// Sets the container image reference.
    #[must_use]
    pub fn image(mut self, value: impl Into<String>) -> Self {
        self.image = value.into();
        self
    }

    /// Sets the plan identifier.
    #[must_use]
    pub fn plan(mut self, value: impl Into<String>) -> Self {
        self.plan = value.into();
        self
    }

    /// Adds a TCP port the container must expose.
    #[must_use]
    pub fn tcp_port(mut self, number: u16) -> Self {
        self.ports.push(PortSpec {
            protocol: String::from("tcp"),
            number,
        });
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push(EnvVar {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Builds and validates the [`CreateRequest`], trimming string inputs.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Validation`] when any required field is empty.
    pub fn build(self) -> Result<CreateRequest, PlatformError> {
        let request = CreateRequest {
            name: self.name.trim().to_owned(),
            image: self.image.trim().to_owned(),
            plan: self.plan.trim().to_owned(),
            ports: self.ports,
            env: self.env,
        };
        request.validate()?;
        Ok(request)
    }
}

/// One TCP/UDP port requested at creation time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PortSpec {
    /// Transport protocol, `tcp` or `udp`.
    pub protocol: String,
    /// Container side port number.
    pub number: u16,
}

/// One environment variable passed to the container.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EnvVar {
    /// Variable name.
    pub key: String,
    /// Variable value.
    pub value: String,
}

/// Handle returned by the platform once a compute unit has been created.
///
/// The orchestrator owns the handle exclusively for the duration of one run
/// and issues exactly one delete for it on every exit path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ComputeUnit {
    /// Platform identifier for the application record.
    pub app_id: String,
    /// Platform identifier for the service backing the application.
    pub service_id: String,
}

/// Lifecycle state reported by the platform for a service.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifecycleState {
    /// The service does not exist (yet, or any more).
    Absent,
    /// Creation accepted but the container is not scheduled yet.
    Creating,
    /// The container is starting up.
    Booting,
    /// The container is running and reachable.
    Running,
    /// The container is shutting down.
    Stopping,
    /// The container has exited permanently.
    Terminated,
}

impl LifecycleState {
    /// Parses a platform status string; unknown strings map to [`Self::Absent`]
    /// so the readiness poll treats them as not-ready.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "creating" => Self::Creating,
            "booting" => Self::Booting,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            "terminated" => Self::Terminated,
            _ => Self::Absent,
        }
    }
}

/// Translation from a container-internal port to a publicly reachable
/// address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PortMapping {
    /// Container side port.
    pub container_port: u16,
    /// Publicly reachable port.
    pub service_port: u16,
    /// Publicly reachable host name or address.
    pub host: String,
}

/// Snapshot of a service as reported by the platform.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceInfo {
    /// Current lifecycle state.
    pub state: LifecycleState,
    /// Published port mappings; empty until the container is scheduled.
    pub port_mappings: Vec<PortMapping>,
}

impl ServiceInfo {
    /// Returns the public endpoint for the mapping whose container port
    /// equals `container_port`, if present.
    #[must_use]
    pub fn endpoint_for(&self, container_port: u16) -> Option<Endpoint> {
        self.port_mappings
            .iter()
            .find(|mapping| mapping.container_port == container_port)
            .map(|mapping| Endpoint {
                host: mapping.host.clone(),
                port: mapping.service_port,
            })
    }
}

/// Publicly reachable address of a provisioned shell service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Errors raised by platform clients.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PlatformError {
    /// Raised when a request is missing a required field.
    #[error("missing or empty field: {0}")]
    Validation(String),
    /// Raised when the platform reports a resource as gone.
    #[error("{resource} {id} not found")]
    NotFound {
        /// Resource kind, `app` or `service`.
        resource: String,
        /// Platform identifier used for the lookup.
        id: String,
    },
    /// Raised when the platform rejects an API call.
    #[error("platform api error (status {status}): {message}")]
    Api {
        /// HTTP status code returned by the API.
        status: u16,
        /// Error body or status text.
        message: String,
    },
    /// Raised when the API cannot be reached or a response cannot be read.
    #[error("platform transport error: {0}")]
    Transport(String),
    /// Raised when a response body does not match the expected shape.
    #[error("unexpected platform response: {0}")]
    Decode(String),
}

/// Future returned by platform operations.
pub type PlatformFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, PlatformError>> + Send + 'a>>;

/// Minimal interface implemented by container-hosting platform clients.
pub trait PlatformClient: Send + Sync {
    /// Creates a new compute unit and returns its handle.
    fn create_app<'a>(&'a self, request: &'a CreateRequest) -> PlatformFuture<'a, ComputeUnit>;

    /// Reads an application record, confirming it still exists.
    fn read_app<'a>(&'a self, app_id: &'a str) -> PlatformFuture<'a, ComputeUnit>;

    /// Deletes an application and all resources behind it.
    fn delete_app<'a>(&'a self, app_id: &'a str) -> PlatformFuture<'a, ()>;

    /// Reads the current state and port mappings of a service.
    fn read_service<'a>(&'a self, service_id: &'a str) -> PlatformFuture<'a, ServiceInfo>;

    /// Requests power-on for a service.
    fn power_on<'a>(&'a self, service_id: &'a str) -> PlatformFuture<'a, ()>;
}
