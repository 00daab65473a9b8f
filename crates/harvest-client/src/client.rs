use std::path::PathBuf;
use std::time::Duration;

use reqwest::{Method, Response, StatusCode};
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::auth::SmartAuth;
use crate::error::{ClientError, Result};
use crate::retry::{parse_retry_after, RetryPolicy};

/// Everything needed to construct a [`FhirClient`].
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// FHIR server base URL, e.g. `https://ehr.example.com/fhir`.
    pub base_url: String,
    /// SMART backend-services client id.
    pub smart_client_id: Option<String>,
    /// PEM private key for SMART backend-services assertions.
    pub smart_key: Option<PathBuf>,
    /// Token endpoint; discovered from `.well-known/smart-configuration`
    /// when absent.
    pub token_url: Option<String>,
    /// A static bearer token, for servers handing out long-lived tokens.
    pub bearer_token: Option<String>,
    /// Resource types used to build `system/Type.read` scopes.
    pub scope_types: Vec<String>,
    /// Retry/backoff settings.
    pub retry: RetryPolicy,
    /// Per-request timeout. Downloads pass their own longer one.
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: Duration::from_secs(300),
            ..Self::default()
        }
    }
}

/// Extras for one request: Accept override, arbitrary headers, timeout.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Accept header; defaults to `application/fhir+json`.
    pub accept: Option<String>,
    /// Additional headers, e.g. `Prefer: respond-async`.
    pub headers: Vec<(String, String)>,
    /// Overrides the client-wide timeout, e.g. for long downloads.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn accept(mime: impl Into<String>) -> Self {
        Self {
            accept: Some(mime.into()),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

enum AuthMode {
    None,
    Static(String),
    Smart(SmartAuth),
}

/// An authenticated FHIR REST client.
///
/// Wraps one `reqwest::Client` (and so one connection pool with HTTP
/// keep-alive) for the whole run.
pub struct FhirClient {
    http: reqwest::Client,
    base_url: String,
    auth: AuthMode,
    retry: RetryPolicy,
    capabilities: OnceCell<Value>,
}

impl FhirClient {
    /// Build a client. Does not touch the network; the first request
    /// triggers token discovery if SMART auth is configured.
    pub async fn new(config: ClientConfig) -> Result<Self> {
        if config.base_url.is_empty() {
            return Err(ClientError::configuration("a FHIR base URL is required"));
        }
        let base_url = config.base_url.trim_end_matches('/').to_string();

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        let auth = match (&config.smart_client_id, &config.smart_key) {
            (Some(client_id), Some(key_path)) => {
                let token_url = match &config.token_url {
                    Some(url) => url.clone(),
                    None => discover_token_url(&http, &base_url).await?,
                };
                AuthMode::Smart(SmartAuth::new(
                    http.clone(),
                    token_url,
                    client_id.clone(),
                    key_path,
                    &config.scope_types,
                )?)
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(ClientError::configuration(
                    "SMART authentication needs both a client id and a key",
                ));
            }
            (None, None) => match &config.bearer_token {
                Some(token) => AuthMode::Static(token.clone()),
                None => AuthMode::None,
            },
        };

        Ok(Self {
            http,
            base_url,
            auth,
            retry: config.retry,
            capabilities: OnceCell::new(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolve a possibly-relative URL against the server base.
    pub fn absolute_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        }
    }

    /// Issue a request, retrying transient failures.
    ///
    /// Handles transport errors, 5xx, and `Retry-After` on 429/503 with
    /// the configured backoff, and re-authenticates once on a 401. Any
    /// other response - success or not - is returned for the caller to
    /// interpret; most callers follow up with [`ensure_success`].
    pub async fn request(&self, method: Method, url: &str) -> Result<Response> {
        self.send(method, url, &RequestOptions::default()).await
    }

    /// [`FhirClient::request`] with extra request options.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        options: &RequestOptions,
    ) -> Result<Response> {
        let absolute = self.absolute_url(url);
        let mut reauthed = false;
        let mut attempt: u32 = 1;

        loop {
            let mut request = self.http.request(method.clone(), &absolute).header(
                reqwest::header::ACCEPT,
                options.accept.as_deref().unwrap_or("application/fhir+json"),
            );
            for (name, value) in &options.headers {
                request = request.header(name.as_str(), value.as_str());
            }
            if let Some(timeout) = options.timeout {
                request = request.timeout(timeout);
            }
            if let Some(token) = self.bearer().await? {
                request = request.bearer_auth(token);
            }

            let outcome = request.send().await;

            let response = match outcome {
                Ok(response) => response,
                Err(err) => {
                    if err.is_builder() || attempt >= self.retry.max_attempts {
                        return Err(err.into());
                    }
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(url = %absolute, attempt, error = %err, "Request failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
            };

            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && !reauthed {
                if let AuthMode::Smart(smart) = &self.auth {
                    tracing::debug!(url = %absolute, "Got 401, refreshing token");
                    smart.refresh().await?;
                    reauthed = true;
                    continue;
                }
            }

            if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE
            {
                if attempt >= self.retry.max_attempts {
                    return Err(ClientError::Exhausted {
                        status: status.as_u16(),
                        attempts: attempt,
                        diagnostics: outcome_diagnostics(response).await,
                    });
                }
                let delay =
                    parse_retry_after(&response).unwrap_or_else(|| self.retry.delay_for(attempt));
                tracing::warn!(url = %absolute, status = status.as_u16(), delay = ?delay, "Server asked us to back off");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            if status.is_server_error() {
                if attempt >= self.retry.max_attempts {
                    return Err(ClientError::Exhausted {
                        status: status.as_u16(),
                        attempts: attempt,
                        diagnostics: outcome_diagnostics(response).await,
                    });
                }
                let delay = self.retry.delay_for(attempt);
                tracing::warn!(url = %absolute, status = status.as_u16(), attempt, "Server error, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            return Ok(response);
        }
    }

    /// GET a URL and parse the successful response as JSON.
    pub async fn get_json(&self, url: &str) -> Result<Value> {
        let response = self.request(Method::GET, url).await?;
        let response = ensure_success(response).await?;
        Ok(response.json().await?)
    }

    /// Read one resource by reference, treating 404 as a soft miss.
    pub async fn fetch_resource(&self, reference: &str) -> Result<Option<Value>> {
        match self.get_json(reference).await {
            Ok(resource) => Ok(Some(resource)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// The server's CapabilityStatement, fetched once and cached.
    pub async fn capabilities(&self) -> Result<&Value> {
        self.capabilities
            .get_or_try_init(|| async {
                tracing::debug!(base_url = %self.base_url, "Fetching CapabilityStatement");
                self.get_json("metadata").await
            })
            .await
    }

    async fn bearer(&self) -> Result<Option<String>> {
        match &self.auth {
            AuthMode::None => Ok(None),
            AuthMode::Static(token) => Ok(Some(token.clone())),
            AuthMode::Smart(smart) => Ok(Some(smart.bearer().await?)),
        }
    }
}

/// Classify a non-success response into the error dispositions the engine
/// cares about: 404 soft miss, 410 export-expired, everything else fatal
/// with any OperationOutcome diagnostics attached.
pub async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    match status.as_u16() {
        404 => Err(ClientError::NotFound { url }),
        410 => Err(ClientError::ExportExpired { url }),
        _ => Err(ClientError::Rejected {
            status: status.as_u16(),
            diagnostics: outcome_diagnostics(response).await,
        }),
    }
}

/// Pull human-readable diagnostics out of an OperationOutcome body, or
/// fall back to the raw text.
async fn outcome_diagnostics(response: Response) -> String {
    let body = response.text().await.unwrap_or_default();
    if let Ok(json) = serde_json::from_str::<Value>(&body) {
        if json.get("resourceType").and_then(Value::as_str) == Some("OperationOutcome") {
            let messages: Vec<&str> = json
                .get("issue")
                .and_then(Value::as_array)
                .map(|issues| {
                    issues
                        .iter()
                        .filter_map(|issue| issue.get("diagnostics").and_then(Value::as_str))
                        .collect()
                })
                .unwrap_or_default();
            if !messages.is_empty() {
                return messages.join("; ");
            }
        }
    }
    body
}

async fn discover_token_url(http: &reqwest::Client, base_url: &str) -> Result<String> {
    let url = format!("{base_url}/.well-known/smart-configuration");
    let response = http
        .get(&url)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
        .map_err(|err| ClientError::Auth(format!("SMART discovery failed: {err}")))?;

    if !response.status().is_success() {
        return Err(ClientError::Auth(format!(
            "SMART discovery at {url} returned HTTP {}; pass --token-url instead",
            response.status()
        )));
    }

    let config: Value = response
        .json()
        .await
        .map_err(|err| ClientError::Auth(format!("malformed SMART configuration: {err}")))?;

    config
        .get("token_endpoint")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            ClientError::Auth(format!(
                "SMART configuration at {url} has no token_endpoint; pass --token-url instead"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requires_base_url() {
        let err = FhirClient::new(ClientConfig::default())
            .await
            .err()
            .expect("expected error");
        assert!(matches!(err, ClientError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_smart_needs_both_id_and_key() {
        let mut config = ClientConfig::new("https://ehr.example.com/fhir");
        config.smart_client_id = Some("client".into());
        let err = FhirClient::new(config).await.err().expect("expected error");
        assert!(matches!(err, ClientError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_absolute_url() {
        let client = FhirClient::new(ClientConfig::new("https://ehr.example.com/fhir/"))
            .await
            .unwrap();
        assert_eq!(
            client.absolute_url("Patient/123"),
            "https://ehr.example.com/fhir/Patient/123"
        );
        assert_eq!(
            client.absolute_url("https://elsewhere.example.com/file.ndjson"),
            "https://elsewhere.example.com/file.ndjson"
        );
    }
}
