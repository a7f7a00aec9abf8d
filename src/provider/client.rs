//! REST control-plane provider.
//!
//! This module provides the HTTP client for a provisioning control plane:
//! `POST /v1/resources` creates, `PATCH /v1/resources/{id}` updates and
//! `DELETE /v1/resources/{id}` deletes. Response statuses are mapped onto
//! [`ProviderError`] codes, and rate limiting and server errors are marked
//! retryable.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, header};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::ProviderConfig;
use crate::error::{ConfigError, ProviderError, Result, StackError};

use super::{CreateRequest, Provider, ProviderResult, UpdateRequest};

/// Resource collection path.
const RESOURCES_PATH: &str = "/v1/resources";

/// HTTP provider for a provisioning control plane.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Base URL without trailing slash.
    endpoint: String,
    /// Region sent with create requests.
    region: Option<String>,
}

/// Create body: the request plus the configured region.
#[derive(Debug, Serialize)]
struct CreateBody<'a> {
    #[serde(flatten)]
    request: &'a CreateRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    region: Option<&'a str>,
}

/// Successful create response.
#[derive(Debug, Deserialize)]
struct CreatedResource {
    id: String,
}

/// Error body returned by the control plane.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl HttpProvider {
    /// Creates a provider from explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if no endpoint is configured or the HTTP client
    /// cannot be created.
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let endpoint = config.endpoint.as_deref().ok_or_else(|| {
            StackError::Config(ConfigError::validation(
                "An endpoint is required for the http provider",
                "provider.endpoint",
            ))
        })?;

        let mut provider =
            Self::with_endpoint(endpoint, Duration::from_secs(config.timeout_secs))?;
        provider.region.clone_from(&config.region);
        Ok(provider)
    }

    /// Creates a provider for an endpoint with a request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_endpoint(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            region: None,
        })
    }

    fn collection_url(&self) -> String {
        format!("{}{RESOURCES_PATH}", self.endpoint)
    }

    fn resource_url(&self, physical_id: &str) -> String {
        format!("{}{RESOURCES_PATH}/{physical_id}", self.endpoint)
    }

    /// Sends a request and maps non-success statuses to provider errors.
    async fn send(&self, request: RequestBuilder) -> ProviderResult<Response> {
        let response = request
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| ProviderError::network(format!("Request failed: {e}")))?;

        let status = response.status();
        trace!("Control plane responded with {status}");

        if status.is_success() {
            return Ok(response);
        }

        let retry_after_ms = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);

        let body = response.text().await.unwrap_or_default();
        let parsed = serde_json::from_str::<ErrorBody>(&body).ok();
        let message = parsed
            .as_ref()
            .and_then(|b| b.message.clone())
            .unwrap_or_else(|| if body.is_empty() { status.to_string() } else { body.clone() });
        let remote_code = parsed.and_then(|b| b.code);

        Err(map_status(status, message, remote_code, retry_after_ms))
    }
}

/// Parses a `Retry-After` value, either delay seconds or an HTTP-date,
/// into milliseconds from now.
fn parse_retry_after(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(secs.saturating_mul(1000));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let wait = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(u64::try_from(wait.num_milliseconds()).unwrap_or(0))
}

fn map_status(
    status: StatusCode,
    message: String,
    remote_code: Option<String>,
    retry_after_ms: Option<u64>,
) -> ProviderError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::throttled(message, retry_after_ms),
        StatusCode::NOT_FOUND => ProviderError::fatal(ProviderError::NOT_FOUND, message),
        StatusCode::CONFLICT => ProviderError::fatal(ProviderError::CONFLICT, message),
        s if s.is_server_error() => ProviderError {
            retry_after_ms,
            ..ProviderError::transient(ProviderError::UNAVAILABLE, message)
        },
        _ => ProviderError::fatal(
            remote_code.unwrap_or_else(|| ProviderError::REJECTED.to_string()),
            message,
        ),
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn create(&self, request: &CreateRequest) -> ProviderResult<String> {
        debug!(
            "Creating {} '{}' via {}",
            request.resource_type, request.logical_name, self.endpoint
        );

        let body = CreateBody {
            request,
            region: self.region.as_deref(),
        };
        let response = self
            .send(self.client.post(self.collection_url()).json(&body))
            .await?;

        let created: CreatedResource = response.json().await.map_err(|e| {
            ProviderError::fatal(
                ProviderError::INVALID_RESPONSE,
                format!("Failed to parse create response: {e}"),
            )
        })?;

        Ok(created.id)
    }

    async fn update(&self, physical_id: &str, request: &UpdateRequest) -> ProviderResult<()> {
        debug!("Updating {physical_id} via {}", self.endpoint);
        self.send(self.client.patch(self.resource_url(physical_id)).json(request))
            .await?;
        Ok(())
    }

    async fn delete(&self, physical_id: &str) -> ProviderResult<()> {
        debug!("Deleting {physical_id} via {}", self.endpoint);
        self.send(self.client.delete(self.resource_url(physical_id)))
            .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceType;
    use crate::provider::ResolvedValue;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn table_request() -> CreateRequest {
        CreateRequest {
            resource_type: ResourceType::KeyValueTable,
            logical_name: "plant-table".to_string(),
            properties: BTreeMap::from([(
                "name".to_string(),
                ResolvedValue::String("plants".to_string()),
            )]),
            grants: Vec::new(),
        }
    }

    fn provider_for(server: &MockServer) -> HttpProvider {
        let config = ProviderConfig {
            kind: crate::config::ProviderKind::Http,
            endpoint: Some(format!("{}/", server.uri())),
            region: Some("eu-west-1".to_string()),
            timeout_secs: 5,
            path: None,
        };
        HttpProvider::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_create_returns_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/resources"))
            .and(body_partial_json(serde_json::json!({
                "type": "key-value-table",
                "logical_name": "plant-table",
                "region": "eu-west-1",
                "properties": { "name": "plants" }
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({ "id": "tbl-42" })))
            .expect(1)
            .mount(&server)
            .await;

        let id = provider_for(&server).create(&table_request()).await.unwrap();
        assert_eq!(id, "tbl-42");
    }

    #[tokio::test]
    async fn test_throttling_is_retryable_with_hint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
            .mount(&server)
            .await;

        let err = provider_for(&server).create(&table_request()).await.unwrap_err();
        assert_eq!(err.code, ProviderError::THROTTLED);
        assert!(err.retryable);
        assert_eq!(err.retry_after_ms, Some(2000));
    }

    #[tokio::test]
    async fn test_retry_after_accepts_http_date() {
        let server = MockServer::start().await;
        let at = (chrono::Utc::now() + chrono::Duration::seconds(30))
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).insert_header("retry-after", at.as_str()))
            .mount(&server)
            .await;

        let err = provider_for(&server).create(&table_request()).await.unwrap_err();
        let wait = err.retry_after_ms.unwrap();
        assert!(wait > 20_000 && wait <= 30_000, "unexpected wait {wait}");
    }

    #[test]
    fn test_retry_after_in_the_past_is_immediate() {
        assert_eq!(parse_retry_after("Sun, 06 Nov 1994 08:49:37 GMT"), Some(0));
        assert_eq!(parse_retry_after(" 3 "), Some(3000));
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/resources/fn-1"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = provider_for(&server).delete("fn-1").await.unwrap_err();
        assert_eq!(err.code, ProviderError::UNAVAILABLE);
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn test_client_errors_are_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/v1/resources/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/v1/resources/bad"))
            .respond_with(ResponseTemplate::new(422).set_body_json(serde_json::json!({
                "code": "invalid_runtime",
                "message": "runtime go1.x is retired"
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let request = UpdateRequest::default();

        let err = provider.update("missing", &request).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!err.retryable);

        let err = provider.update("bad", &request).await.unwrap_err();
        assert_eq!(err.code, "invalid_runtime");
        assert_eq!(err.message, "runtime go1.x is retired");
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_retryable() {
        let provider =
            HttpProvider::with_endpoint("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        let err = provider.delete("x").await.unwrap_err();
        assert_eq!(err.code, ProviderError::NETWORK);
        assert!(err.retryable);
    }

    #[test]
    fn test_missing_endpoint_is_config_error() {
        let err = HttpProvider::new(&ProviderConfig::default()).unwrap_err();
        assert!(matches!(err, StackError::Config(_)));
    }
}
