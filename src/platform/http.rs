//! Production [`PlatformClient`] speaking the hosting platform's JSON API.
//!
//! The API is a small REST surface: applications own one service each, and
//! the service carries lifecycle state plus published port mappings. All
//! calls authenticate with the API token/secret pair via HTTP basic auth.

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::PlatformApiConfig;
use crate::platform::{
    ComputeUnit, CreateRequest, LifecycleState, PlatformClient, PlatformError, PlatformFuture,
    PortMapping, ServiceInfo,
};

const USER_AGENT: &str = concat!("caravel/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Serialize)]
struct CreateAppBody<'a> {
    name: &'a str,
    image: &'a str,
    plan: &'a str,
    instances: u32,
    ports: Vec<PortBody<'a>>,
    environment: Vec<EnvBody<'a>>,
}

#[derive(Debug, Serialize)]
struct PortBody<'a> {
    protocol: &'a str,
    number: u16,
}

#[derive(Debug, Serialize)]
struct EnvBody<'a> {
    key: &'a str,
    value: &'a str,
}

#[derive(Debug, Deserialize)]
struct AppEnvelope {
    id: String,
    service: ServiceRef,
}

#[derive(Debug, Deserialize)]
struct ServiceRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ServiceEnvelope {
    status: String,
    #[serde(default)]
    port_mappings: Vec<PortMappingBody>,
}

#[derive(Debug, Deserialize)]
struct PortMappingBody {
    container_port: u16,
    service_port: u16,
    host: String,
}

/// HTTP adapter for the hosting platform API.
#[derive(Clone, Debug)]
pub struct HttpPlatformClient {
    http: Client,
    endpoint: String,
    token: String,
    secret: String,
}

impl HttpPlatformClient {
    /// Constructs a client from validated API configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Validation`] when the configuration fails
    /// validation and [`PlatformError::Transport`] when the underlying HTTP
    /// client cannot be built.
    pub fn new(config: &PlatformApiConfig) -> Result<Self, PlatformError> {
        config
            .validate()
            .map_err(|err| PlatformError::Validation(err.to_string()))?;
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| PlatformError::Transport(err.to_string()))?;
        Ok(Self {
            http,
            endpoint: config.api_endpoint.trim_end_matches('/').to_owned(),
            token: config.api_token.clone(),
            secret: config.api_secret.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.endpoint))
            .basic_auth(&self.token, Some(&self.secret))
    }

    async fn check(
        response: Response,
        resource: &str,
        id: &str,
    ) -> Result<Response, PlatformError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(PlatformError::NotFound {
                resource: resource.to_owned(),
                id: id.to_owned(),
            });
        }
        let message = response.text().await.unwrap_or_default();
        Err(PlatformError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn decode<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, PlatformError> {
        response
            .json::<T>()
            .await
            .map_err(|err| PlatformError::Decode(err.to_string()))
    }

    async fn read_app_inner(&self, app_id: &str) -> Result<ComputeUnit, PlatformError> {
        let response = self
            .request(Method::GET, &format!("/apps/{app_id}"))
            .send()
            .await
            .map_err(|err| PlatformError::Transport(err.to_string()))?;
        let envelope: AppEnvelope = Self::decode(Self::check(response, "app", app_id).await?).await?;
        Ok(ComputeUnit {
            app_id: envelope.id,
            service_id: envelope.service.id,
        })
    }
}

impl PlatformClient for HttpPlatformClient {
    fn create_app<'a>(&'a self, request: &'a CreateRequest) -> PlatformFuture<'a, ComputeUnit> {
        Box::pin(async move {
            request.validate()?;
            let body = CreateAppBody {
                name: &request.name,
                image: &request.image,
                plan: &request.plan,
                instances: 1,
                ports: request
                    .ports
                    .iter()
                    .map(|port| PortBody {
                        protocol: &port.protocol,
                        number: port.number,
                    })
                    .collect(),
                environment: request
                    .env
                    .iter()
                    .map(|var| EnvBody {
                        key: &var.key,
                        value: &var.value,
                    })
                    .collect(),
            };
            let response = self
                .request(Method::POST, "/apps")
                .json(&body)
                .send()
                .await
                .map_err(|err| PlatformError::Transport(err.to_string()))?;
            let envelope: AppEnvelope =
                Self::decode(Self::check(response, "app", &request.name).await?).await?;
            Ok(ComputeUnit {
                app_id: envelope.id,
                service_id: envelope.service.id,
            })
        })
    }

    fn read_app<'a>(&'a self, app_id: &'a str) -> PlatformFuture<'a, ComputeUnit> {
        Box::pin(self.read_app_inner(app_id))
    }

    fn delete_app<'a>(&'a self, app_id: &'a str) -> PlatformFuture<'a, ()> {
        Box::pin(async move {
            let response = self
                .request(Method::DELETE, &format!("/apps/{app_id}"))
                .send()
                .await
                .map_err(|err| PlatformError::Transport(err.to_string()))?;
            Self::check(response, "app", app_id).await?;
            Ok(())
        })
    }

    fn read_service<'a>(&'a self, service_id: &'a str) -> PlatformFuture<'a, ServiceInfo> {
        Box::pin(async move {
            let response = self
                .request(Method::GET, &format!("/services/{service_id}"))
                .send()
                .await
                .map_err(|err| PlatformError::Transport(err.to_string()))?;
            let envelope: ServiceEnvelope =
                Self::decode(Self::check(response, "service", service_id).await?).await?;
            Ok(ServiceInfo {
                state: LifecycleState::parse(&envelope.status),
                port_mappings: envelope
                    .port_mappings
                    .into_iter()
                    .map(|mapping| PortMapping {
                        container_port: mapping.container_port,
                        service_port: mapping.service_port,
                        host: mapping.host,
                    })
                    .collect(),
            })
        })
    }

    fn power_on<'a>(&'a self, service_id: &'a str) -> PlatformFuture<'a, ()> {
        Box::pin(async move {
            let response = self
                .request(Method::POST, &format!("/services/{service_id}/power"))
                .send()
                .await
                .map_err(|err| PlatformError::Transport(err.to_string()))?;
            Self::check(response, "service", service_id).await?;
            Ok(())
        })
    }
}
