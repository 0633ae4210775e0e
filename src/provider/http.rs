//! JSON-over-HTTP provider client.
//!
//! Talks to a provider service exposing:
//! - `POST   /resources`        `{type, properties}` -> `{id, outputs}`
//! - `PUT    /resources/{id}`   `{type, properties}` -> `{outputs}`
//! - `DELETE /resources/{id}?type=<tag>`

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, header};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{ProviderError, ProviderResult};

use super::{Created, Outputs, Provider};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum number of attempts for transient failures.
const MAX_RETRIES: u32 = 3;

/// Base delay between retries in milliseconds.
const RETRY_DELAY_MS: u64 = 1000;

/// Upper bound for a server-advertised `Retry-After`.
const MAX_RETRY_AFTER_SECS: u64 = 120;

/// HTTP provider client.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Base URL without trailing slash.
    base_url: String,
    /// Bearer token, if any.
    token: Option<String>,
    /// Base delay between retries.
    retry_delay: Duration,
}

#[derive(Debug, Serialize)]
struct ResourceRequest<'a> {
    #[serde(rename = "type")]
    type_tag: &'a str,
    properties: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: String,
    #[serde(default)]
    outputs: Outputs,
}

#[derive(Debug, Deserialize)]
struct UpdateResponse {
    #[serde(default)]
    outputs: Outputs,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(alias = "error")]
    message: String,
}

impl HttpProvider {
    /// Creates a new client for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: &str, token: Option<String>) -> ProviderResult<Self> {
        Self::with_timeout(base_url, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a client with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(base_url: &str, token: Option<String>, timeout_secs: u64) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        })
    }

    /// Sets the base delay between retries.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sends a request, retrying failures that are safe to repeat.
    ///
    /// Rate-limited requests are retried for any method after the advertised
    /// `Retry-After`. Network and server errors are retried only for
    /// idempotent methods, so a create is never sent twice.
    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        path: &str,
        body: Option<&ResourceRequest<'_>>,
    ) -> ProviderResult<Option<T>> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match self.send_once::<T>(method.clone(), path, body).await {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };

            let delay = match &error {
                ProviderError::RateLimited { retry_after_secs } => {
                    Duration::from_secs((*retry_after_secs).min(MAX_RETRY_AFTER_SECS))
                }
                ProviderError::NetworkError { .. } if method.is_idempotent() => {
                    self.retry_delay * attempt
                }
                _ => return Err(error),
            };
            if attempt >= MAX_RETRIES {
                return Err(error);
            }

            debug!(
                "{method} {path} failed ({error}), retrying in {}ms (attempt {attempt} of {MAX_RETRIES})",
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Sends a single request. Returns `None` for an empty success body.
    async fn send_once<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        path: &str,
        body: Option<&ResourceRequest<'_>>,
    ) -> ProviderResult<Option<T>> {
        let url = format!("{}{path}", self.base_url);
        trace!("{method} {url}");

        let mut request = self
            .client
            .request(method, &url)
            .header(header::ACCEPT, "application/json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::network(format!("Request failed: {e}")))?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(60);
            return Err(ProviderError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProviderError::AuthenticationFailed {
                message: String::from("Invalid or missing provider token"),
            });
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map_or(text, |body| body.message);
            return Err(match status {
                StatusCode::NOT_FOUND => {
                    let resource = path.split('?').next().unwrap_or(path);
                    let segment = resource.rsplit('/').next().unwrap_or(resource);
                    ProviderError::NotFound {
                        id: urlencoding::decode(segment)
                            .map_or_else(|_| segment.to_string(), |id| id.into_owned()),
                    }
                }
                StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
                    ProviderError::Rejected { message }
                }
                _ if status.is_server_error() => {
                    ProviderError::network(format!("{}: {message}", status.as_u16()))
                }
                _ => ProviderError::request(status.as_u16(), message),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProviderError::network(format!("Failed to read response: {e}")))?;
        if bytes.is_empty() {
            return Ok(None);
        }

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ProviderError::InvalidResponse {
                message: format!("Failed to parse response: {e}"),
            })
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn create(&self, type_tag: &str, properties: &serde_json::Value) -> ProviderResult<Created> {
        let body = ResourceRequest {
            type_tag,
            properties,
        };
        let response: CreateResponse = self
            .send(Method::POST, "/resources", Some(&body))
            .await?
            .ok_or_else(|| ProviderError::InvalidResponse {
                message: String::from("Empty create response"),
            })?;

        debug!("Created {type_tag} as {}", response.id);
        Ok(Created {
            id: response.id,
            outputs: response.outputs,
        })
    }

    async fn update(
        &self,
        id: &str,
        type_tag: &str,
        properties: &serde_json::Value,
    ) -> ProviderResult<Outputs> {
        let body = ResourceRequest {
            type_tag,
            properties,
        };
        let response: Option<UpdateResponse> = self
            .send(
                Method::PUT,
                &format!("/resources/{}", urlencoding::encode(id)),
                Some(&body),
            )
            .await?;

        debug!("Updated {type_tag} {id}");
        Ok(response.map(|r| r.outputs).unwrap_or_default())
    }

    async fn delete(&self, id: &str, type_tag: &str) -> ProviderResult<()> {
        let path = format!(
            "/resources/{}?type={}",
            urlencoding::encode(id),
            urlencoding::encode(type_tag)
        );
        let _: Option<serde_json::Value> = self.send(Method::DELETE, &path, None).await?;

        debug!("Deleted {type_tag} {id}");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> HttpProvider {
        HttpProvider::new(&server.uri(), Some(String::from("secret")))
            .unwrap()
            .with_retry_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_create_sends_type_and_properties() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources"))
            .and(header("authorization", "Bearer secret"))
            .and(body_json(json!({"type": "aws:ec2:Vpc", "properties": {"max_azs": 2}})))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!({"id": "vpc-1", "outputs": {"arn": "arn:vpc-1"}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let created = provider(&server)
            .create("aws:ec2:Vpc", &json!({"max_azs": 2}))
            .await
            .unwrap();

        assert_eq!(created.id, "vpc-1");
        assert_eq!(created.outputs["arn"], json!("arn:vpc-1"));
    }

    #[tokio::test]
    async fn test_update_with_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/resources/sg-1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let outputs = provider(&server)
            .update("sg-1", "aws:ec2:SecurityGroup", &json!({}))
            .await
            .unwrap();
        assert!(outputs.is_empty());
    }

    #[tokio::test]
    async fn test_delete_maps_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/resources/nlb-1"))
            .and(query_param("type", "aws:elbv2:NetworkLoadBalancer"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = provider(&server)
            .delete("nlb-1", "aws:elbv2:NetworkLoadBalancer")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_rejected_message_from_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(422).set_body_json(json!({"error": "max_azs out of range"})),
            )
            .mount(&server)
            .await;

        let err = provider(&server)
            .create("aws:ec2:Vpc", &json!({"max_azs": 99}))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ProviderError::Rejected {
                message: String::from("max_azs out of range")
            }
        );
    }

    #[tokio::test]
    async fn test_rate_limit_waits_for_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "c-1"})))
            .mount(&server)
            .await;

        let started = std::time::Instant::now();
        let created = provider(&server)
            .create("aws:ecs:Cluster", &json!({}))
            .await
            .unwrap();
        assert_eq!(created.id, "c-1");
        assert!(created.outputs.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_create_not_resent_after_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "r-2"})))
            .mount(&server)
            .await;

        let err = provider(&server)
            .create("aws:s3:Bucket", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NetworkError { .. }));
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_retried_after_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/resources/sg-1"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/resources/sg-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"outputs": {"arn": "arn:sg-1"}})))
            .mount(&server)
            .await;

        let outputs = provider(&server)
            .update("sg-1", "aws:ec2:SecurityGroup", &json!({}))
            .await
            .unwrap();
        assert_eq!(outputs["arn"], json!("arn:sg-1"));
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_auth_failure_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let err = provider(&server)
            .create("aws:ecs:Cluster", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::AuthenticationFailed { .. }));
    }

    #[tokio::test]
    async fn test_delete_escapes_id_and_type() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/resources/team%2Fapi%20gw"))
            .and(query_param("type", "aws:apigateway:RestApi"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = provider(&server)
            .delete("team/api gw", "aws:apigateway:RestApi")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ProviderError::NotFound {
                id: String::from("team/api gw")
            }
        );
    }
}
