//! JSON control-plane gateway driver.
//!
//! Speaks a small REST protocol:
//! `POST /v1/resources/{kind}` creates and answers `{"id": ...}`,
//! `PUT`, `DELETE` and `GET` on `/v1/resources/{kind}/{id}` update, delete
//! and describe. Creates carry the logical name as an idempotency key.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, header};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use super::{CloudProvider, NAME_ATTRIBUTE, Operation, ProviderResult};
use crate::config::{Attributes, HttpDriverConfig};
use crate::error::ProviderError;
use crate::model::ResourceKind;

/// Fallback when a 429 carries no usable `retry-after`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

/// Header carrying the provider region.
const REGION_HEADER: &str = "x-converge-region";

/// Header carrying the provider zone.
const ZONE_HEADER: &str = "x-converge-zone";

/// Header carrying the create idempotency key.
const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// HTTP gateway provider.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Base URL without trailing slash.
    endpoint: String,
    /// Opaque credential blob sent as a bearer token.
    credentials: Option<String>,
    region: Option<String>,
    zone: Option<String>,
}

#[derive(Debug, Serialize)]
struct ResourceRequest<'a> {
    attributes: &'a Attributes,
}

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DescribeResponse {
    #[serde(default)]
    attributes: Attributes,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    message: String,
}

impl HttpProvider {
    /// Creates a new gateway client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(
        config: &HttpDriverConfig,
        credentials: Option<&str>,
        region: Option<&str>,
        zone: Option<&str>,
    ) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            credentials: credentials.map(ToString::to_string),
            region: region.map(ToString::to_string),
            zone: zone.map(ToString::to_string),
        })
    }

    fn collection_url(&self, kind: ResourceKind) -> String {
        format!("{}/v1/resources/{kind}", self.endpoint)
    }

    fn resource_url(&self, kind: ResourceKind, provider_id: &str) -> String {
        format!("{}/v1/resources/{kind}/{provider_id}", self.endpoint)
    }

    /// Builds a request with the common headers.
    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        trace!("{} {}", method, url);
        let mut builder = self
            .client
            .request(method, url)
            .header(header::ACCEPT, "application/json");
        if let Some(credentials) = &self.credentials {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {credentials}"));
        }
        if let Some(region) = &self.region {
            builder = builder.header(REGION_HEADER, region);
        }
        if let Some(zone) = &self.zone {
            builder = builder.header(ZONE_HEADER, zone);
        }
        builder
    }

    /// Sends a request and maps transport and status failures.
    async fn send(&self, builder: RequestBuilder, provider_id: Option<&str>) -> ProviderResult<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::network(format!("Request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse().ok());
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map_or(body, |e| e.message);

        Err(map_status(status, retry_after, message, provider_id))
    }
}

/// Maps a failed HTTP status onto the provider error taxonomy.
fn map_status(
    status: StatusCode,
    retry_after: Option<u64>,
    message: String,
    provider_id: Option<&str>,
) -> ProviderError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited {
            retry_after_secs: retry_after
                .filter(|s| *s > 0)
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::AuthenticationFailed { message }
        }
        StatusCode::NOT_FOUND => ProviderError::NotFound {
            provider_id: provider_id.unwrap_or_default().to_string(),
        },
        StatusCode::NOT_IMPLEMENTED => ProviderError::Unsupported {
            driver: String::from("http"),
            kind: message,
        },
        s if s.is_server_error() => ProviderError::Unavailable {
            message: format!("{s}: {message}"),
        },
        s => ProviderError::rejected(s.as_u16(), message),
    }
}

#[async_trait]
impl CloudProvider for HttpProvider {
    async fn create_resource(
        &self,
        kind: ResourceKind,
        attributes: &Attributes,
    ) -> ProviderResult<String> {
        let mut builder = self
            .request(Method::POST, &self.collection_url(kind))
            .json(&ResourceRequest { attributes });
        if let Some(name) = attributes.get(NAME_ATTRIBUTE).and_then(serde_json::Value::as_str) {
            builder = builder.header(IDEMPOTENCY_HEADER, format!("{kind}/{name}"));
        }

        let response = self.send(builder, None).await?;
        let created: CreatedResponse = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse {
                message: format!("Failed to parse create response: {e}"),
            }
        })?;

        debug!("Gateway created {} {}", kind, created.id);
        Ok(created.id)
    }

    async fn update_resource(
        &self,
        provider_id: &str,
        kind: ResourceKind,
        attributes: &Attributes,
    ) -> ProviderResult<()> {
        let builder = self
            .request(Method::PUT, &self.resource_url(kind, provider_id))
            .json(&ResourceRequest { attributes });
        self.send(builder, Some(provider_id)).await?;
        Ok(())
    }

    async fn delete_resource(&self, provider_id: &str, kind: ResourceKind) -> ProviderResult<()> {
        let builder = self.request(Method::DELETE, &self.resource_url(kind, provider_id));
        self.send(builder, Some(provider_id)).await?;
        Ok(())
    }

    async fn describe_resource(
        &self,
        provider_id: &str,
        kind: ResourceKind,
    ) -> ProviderResult<Attributes> {
        let builder = self.request(Method::GET, &self.resource_url(kind, provider_id));
        let response = self.send(builder, Some(provider_id)).await?;
        let described: DescribeResponse = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse {
                message: format!("Failed to parse describe response: {e}"),
            }
        })?;
        Ok(described.attributes)
    }

    fn supports_safe_retry(&self, _kind: ResourceKind, _operation: Operation) -> bool {
        // Creates are keyed on the logical name; PUT and DELETE are idempotent.
        true
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
