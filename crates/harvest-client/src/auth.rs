//! SMART-on-FHIR backend services authentication.
//!
//! Signs a JWT client assertion with the configured private key and
//! exchanges it for a bearer token via the `client_credentials` grant.
//! Token state is internal mutable state behind a mutex, refreshed on
//! expiry or on a 401 from the server.

use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{ClientError, Result};

/// Assertion lifetime. SMART recommends no more than five minutes.
const ASSERTION_LIFETIME: Duration = Duration::from_secs(300);

/// Refresh slack so a token never expires mid-request.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    exp: u64,
    jti: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Client-credentials token source for one FHIR server.
pub struct SmartAuth {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    key: EncodingKey,
    algorithm: Algorithm,
    scope: String,
    state: Mutex<Option<CachedToken>>,
}

impl SmartAuth {
    pub fn new(
        http: reqwest::Client,
        token_url: String,
        client_id: String,
        key_path: &Path,
        scope_types: &[String],
    ) -> Result<Self> {
        let (key, algorithm) = load_signing_key(key_path)?;
        Ok(Self {
            http,
            token_url,
            client_id,
            key,
            algorithm,
            scope: backend_scope(scope_types),
            state: Mutex::new(None),
        })
    }

    /// A currently-valid bearer token, fetching a fresh one if needed.
    pub async fn bearer(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        if let Some(cached) = state.as_ref() {
            if cached.expires_at > Instant::now() + EXPIRY_MARGIN {
                return Ok(cached.access_token.clone());
            }
        }
        let token = self.fetch_token().await?;
        let access_token = token.access_token.clone();
        *state = Some(token);
        Ok(access_token)
    }

    /// Drop the cached token and fetch a new one. Used after a 401.
    pub async fn refresh(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        let token = self.fetch_token().await?;
        let access_token = token.access_token.clone();
        *state = Some(token);
        Ok(access_token)
    }

    async fn fetch_token(&self) -> Result<CachedToken> {
        let assertion = self.sign_assertion()?;

        let params = [
            ("grant_type", "client_credentials"),
            ("scope", self.scope.as_str()),
            (
                "client_assertion_type",
                "urn:ietf:params:oauth:client-assertion-type:jwt-bearer",
            ),
            ("client_assertion", assertion.as_str()),
        ];

        let response = self
            .http
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|err| ClientError::Auth(format!("token request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Auth(format!(
                "token endpoint returned HTTP {status}: {body}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| ClientError::Auth(format!("malformed token response: {err}")))?;

        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(300));
        tracing::debug!(token_url = %self.token_url, lifetime = ?lifetime, "Obtained access token");

        Ok(CachedToken {
            access_token: token.access_token,
            expires_at: Instant::now() + lifetime,
        })
    }

    fn sign_assertion(&self) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let claims = AssertionClaims {
            iss: &self.client_id,
            sub: &self.client_id,
            aud: &self.token_url,
            exp: (now + ASSERTION_LIFETIME).as_secs(),
            jti: uuid::Uuid::new_v4().to_string(),
        };
        encode(&Header::new(self.algorithm), &claims, &self.key)
            .map_err(|err| ClientError::Auth(format!("failed to sign client assertion: {err}")))
    }
}

/// The `system/Type.read` scopes for the resource types we will touch.
fn backend_scope(scope_types: &[String]) -> String {
    if scope_types.is_empty() {
        return "system/*.read".to_string();
    }
    scope_types
        .iter()
        .map(|res_type| format!("system/{res_type}.read"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Load a PEM private key, inferring the algorithm from the key type.
///
/// SMART servers expect RS384 or ES384 client assertions. Raw JWKS files
/// carry private key material in a form `jsonwebtoken` cannot sign with,
/// so they are rejected up front with a pointer at PEM.
fn load_signing_key(path: &Path) -> Result<(EncodingKey, Algorithm)> {
    let pem = std::fs::read(path).map_err(|err| {
        ClientError::configuration(format!("cannot read key file {}: {err}", path.display()))
    })?;

    if pem.trim_ascii_start().starts_with(b"{") {
        return Err(ClientError::configuration(format!(
            "{} looks like a JWKS file; convert the private key to PEM form",
            path.display()
        )));
    }

    if let Ok(key) = EncodingKey::from_rsa_pem(&pem) {
        return Ok((key, Algorithm::RS384));
    }
    if let Ok(key) = EncodingKey::from_ec_pem(&pem) {
        return Ok((key, Algorithm::ES384));
    }

    Err(ClientError::configuration(format!(
        "{} is not an RSA or EC private key in PEM form",
        path.display()
    )))
}
