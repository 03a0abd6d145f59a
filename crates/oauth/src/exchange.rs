//! Shared token-endpoint client used by both flows.

use {serde::Deserialize, tracing::debug, url::Url};

use crate::{Error, Result, types::Token};

pub(crate) const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Wraps the token-endpoint HTTP calls. One per flow instance.
#[derive(Debug)]
pub(crate) struct TokenClient {
    http: reqwest::Client,
    token_endpoint: Url,
    client_id: String,
}

/// Outcome of a single device-flow poll that does not end the flow.
/// Terminal outcomes (denial, expiry, malformed bodies, transport
/// failures) are returned as errors instead.
#[derive(Debug)]
pub(crate) enum DevicePoll {
    Ready(Token),
    Pending,
    SlowDown,
}

impl TokenClient {
    pub(crate) fn new(http: reqwest::Client, token_endpoint: Url, client_id: String) -> Self {
        Self {
            http,
            token_endpoint,
            client_id,
        }
    }

    /// Exchange an authorization code (plus the PKCE verifier) for tokens.
    /// No retry: any transport or server error ends the flow.
    pub(crate) async fn exchange_code(
        &self,
        code: &str,
        verifier: &str,
        redirect_uri: &str,
    ) -> Result<Token> {
        debug!(url = %self.token_endpoint, "exchanging authorization code");

        let resp = self
            .http
            .post(self.token_endpoint.clone())
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", self.client_id.as_str()),
                ("code_verifier", verifier),
            ])
            .send()
            .await?;

        let body: TokenResponse = resp.json().await?;
        body.into_token()
    }

    /// One device-flow poll of the token endpoint.
    pub(crate) async fn poll_device(&self, device_code: &str) -> Result<DevicePoll> {
        let resp = self
            .http
            .post(self.token_endpoint.clone())
            .header("Accept", "application/json")
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("device_code", device_code),
                ("grant_type", DEVICE_GRANT_TYPE),
            ])
            .send()
            .await?;

        let body: TokenResponse = resp.json().await?;
        body.classify()
    }
}

/// Token endpoint response body, covering both the success shape
/// (RFC 6749 §5.1) and the error shape (RFC 8628 §3.5 / RFC 6749 §5.2).
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    pub(crate) access_token: Option<String>,
    #[serde(default)]
    pub(crate) token_type: Option<String>,
    #[serde(default)]
    pub(crate) refresh_token: Option<String>,
    #[serde(default)]
    pub(crate) expires_in: Option<u64>,
    #[serde(default)]
    pub(crate) error: Option<String>,
    #[serde(default)]
    pub(crate) error_description: Option<String>,
}

impl TokenResponse {
    pub(crate) fn into_token(self) -> Result<Token> {
        if let Some(code) = self.error {
            return Err(Error::AuthorizationServer {
                code,
                description: self.error_description,
            });
        }
        let Some(access_token) = self.access_token else {
            return Err(Error::protocol(
                "unexpected response from token endpoint: missing access_token",
            ));
        };
        Ok(Token {
            access_token: secrecy::Secret::new(access_token),
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
            refresh_token: self.refresh_token.map(secrecy::Secret::new),
            expires_at: expires_at(self.expires_in),
        })
    }

    /// Classify a polling response per RFC 8628 §3.5: `authorization_pending`
    /// and `slow_down` keep the loop alive, everything else is terminal.
    pub(crate) fn classify(self) -> Result<DevicePoll> {
        match self.error.as_deref() {
            Some("authorization_pending") => return Ok(DevicePoll::Pending),
            Some("slow_down") => return Ok(DevicePoll::SlowDown),
            _ => {},
        }
        Ok(DevicePoll::Ready(self.into_token()?))
    }
}

fn expires_at(expires_in: Option<u64>) -> Option<u64> {
    expires_in.and_then(|secs| {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .ok()
            .map(|d| d.as_secs().saturating_add(secs))
    })
}
