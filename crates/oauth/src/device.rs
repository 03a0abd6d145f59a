//! Device Authorization Grant (RFC 8628) for headless hosts without a
//! local browser or loopback callback.

use {
    futures::StreamExt,
    serde::Deserialize,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info},
    url::Url,
};

use crate::{
    Error, Result,
    exchange::{DevicePoll, TokenClient},
    handlers::{DiscardToken, PresentUserCode, StderrPresenter, TokenSink},
    types::{FlowConfig, Token},
};

/// Cap on the device-authorization response body, to bound memory use
/// against a misbehaving server.
const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// Polling interval when the server omits one (RFC 8628 §3.2).
const DEFAULT_INTERVAL_SECS: u64 = 5;

/// Floor for the polling interval.
const MIN_INTERVAL_SECS: u64 = 1;

/// How much `slow_down` widens the polling interval (RFC 8628 §3.5).
const SLOW_DOWN_INCREMENT_SECS: u64 = 5;

/// Device-authorization response (RFC 8628 §3.2). `device_code`,
/// `user_code` and `verification_uri` are mandatory; a response missing
/// any of them is rejected as a protocol error.
#[derive(Clone, Deserialize)]
pub struct DeviceAuthorization {
    /// Opaque code sent only to the token endpoint, never displayed.
    pub device_code: String,
    /// Short code the user types on the verification page.
    pub user_code: String,
    pub verification_uri: String,
    /// Variant of the verification URI with the user code pre-filled.
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    /// Lifetime of the device/user code pair, in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default = "default_interval")]
    pub interval: u64,
}

const fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

impl std::fmt::Debug for DeviceAuthorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAuthorization")
            .field("device_code", &"[REDACTED]")
            .field("user_code", &self.user_code)
            .field("verification_uri", &self.verification_uri)
            .field(
                "verification_uri_complete",
                &self.verification_uri_complete,
            )
            .field("expires_in", &self.expires_in)
            .field("interval", &self.interval)
            .finish()
    }
}

/// A single device-flow authentication attempt.
pub struct DeviceFlow {
    config: FlowConfig,
    device_endpoint: Url,
    http: reqwest::Client,
    token: TokenClient,
    present: Box<dyn PresentUserCode>,
    on_token: Box<dyn TokenSink>,
}

impl DeviceFlow {
    /// Validates the configured URLs. Configuration errors fail fast and
    /// are never retried.
    pub fn new(config: FlowConfig) -> Result<Self> {
        let device_endpoint = Url::parse(&config.device_authorization_url)
            .map_err(|source| Error::config(format!("invalid device_authorization_url: {source}")))?;
        let token_endpoint = Url::parse(&config.token_url)
            .map_err(|source| Error::config(format!("invalid token_url: {source}")))?;

        let http = reqwest::Client::new();
        let token = TokenClient::new(http.clone(), token_endpoint, config.client_id.clone());

        Ok(Self {
            device_endpoint,
            http,
            token,
            present: Box::new(StderrPresenter),
            on_token: Box::new(DiscardToken),
            config,
        })
    }

    #[must_use]
    pub fn with_presenter(mut self, present: impl PresentUserCode + 'static) -> Self {
        self.present = Box::new(present);
        self
    }

    #[must_use]
    pub fn with_token_sink(mut self, sink: impl TokenSink + 'static) -> Self {
        self.on_token = Box::new(sink);
        self
    }

    /// Run the full device flow: request a device/user code pair, show it
    /// to the user, then poll the token endpoint until success, denial or
    /// expiry. Suspends the calling task for the whole duration; the
    /// cancellation token is the only way to abort an in-progress poll
    /// loop early, and is honored before each HTTP call and each sleep.
    pub async fn authorize(&self, cancel: &CancellationToken) -> Result<Token> {
        let authorization = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Canceled),
            res = self.request_authorization() => res?,
        };

        info!(
            user_code = %authorization.user_code,
            interval = authorization.interval,
            "obtained device authorization; waiting for the user"
        );

        self.present.present(
            &authorization.user_code,
            &authorization.verification_uri,
            authorization.verification_uri_complete.as_deref(),
        )?;

        let mut interval = authorization.interval.max(MIN_INTERVAL_SECS);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Canceled),
                () = tokio::time::sleep(std::time::Duration::from_secs(interval)) => {},
            }

            let poll = tokio::select! {
                () = cancel.cancelled() => return Err(Error::Canceled),
                res = self.token.poll_device(&authorization.device_code) => res?,
            };

            match poll {
                DevicePoll::Ready(token) => {
                    self.on_token.on_token(&token)?;
                    return Ok(token);
                },
                DevicePoll::Pending => {
                    debug!("authorization pending");
                },
                DevicePoll::SlowDown => {
                    interval += SLOW_DOWN_INCREMENT_SECS;
                    debug!(interval, "server requested slow_down");
                },
            }
        }
    }

    /// POST to the device-authorization endpoint (RFC 8628 §3.1).
    async fn request_authorization(&self) -> Result<DeviceAuthorization> {
        let mut form: Vec<(String, String)> =
            vec![("client_id".into(), self.config.client_id.clone())];
        if !self.config.scopes.is_empty() {
            form.push(("scope".into(), self.config.scopes.join(" ")));
        }
        if let Some(audience) = &self.config.audience {
            form.push(("audience".into(), audience.clone()));
        }
        form.extend(self.config.extra_params.iter().cloned());

        debug!(url = %self.device_endpoint, "requesting device authorization");

        let resp = self
            .http
            .post(self.device_endpoint.clone())
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await?;

        let status = resp.status();
        let body = read_limited(resp, MAX_RESPONSE_BYTES).await?;
        if !status.is_success() {
            return Err(Error::protocol(format!(
                "device authorization request failed: HTTP {status}: {}",
                String::from_utf8_lossy(&body)
            )));
        }

        serde_json::from_slice(&body).map_err(|source| {
            Error::protocol(format!("invalid device authorization response: {source}"))
        })
    }
}

/// Read a response body, failing once it exceeds `limit` bytes.
async fn read_limited(resp: reqwest::Response, limit: usize) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if body.len() + chunk.len() > limit {
            return Err(Error::protocol(format!(
                "response body exceeds the {limit} byte limit"
            )));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}
