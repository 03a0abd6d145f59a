use secrecy::Secret;

/// Configuration for a single authentication attempt.
///
/// Owned by the flow instance once a flow begins; nothing in here is
/// mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct FlowConfig {
    /// Public (non-confidential) client identifier.
    pub client_id: String,
    pub scopes: Vec<String>,
    /// Authorization endpoint (authorization-code flow).
    pub authorization_url: String,
    /// Token endpoint (both flows).
    pub token_url: String,
    /// Device-authorization endpoint (device flow, RFC 8628).
    pub device_authorization_url: String,
    /// Loopback redirect URL (authorization-code flow only).
    pub redirect_url: String,
    /// Optional audience forwarded to the authorization server.
    pub audience: Option<String>,
    /// Extra endpoint parameters, appended after the flow's own
    /// parameters. Repeat a key to send multiple values.
    pub extra_params: Vec<(String, String)>,
}

/// Tokens returned by the authorization server. Opaque beyond what the
/// caller needs to use them.
#[derive(Clone)]
pub struct Token {
    pub access_token: Secret<String>,
    pub token_type: String,
    pub refresh_token: Option<Secret<String>>,
    /// Unix timestamp when the access token expires.
    pub expires_at: Option<u64>,
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
