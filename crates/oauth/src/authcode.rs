//! Authorization Code Grant with PKCE (RFC 7636) over a loopback
//! HTTP callback.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    axum::{
        Router,
        extract::Request,
        http::{Method, StatusCode},
        response::Response,
    },
    tokio::sync::oneshot,
    tracing::debug,
    url::Url,
};

use crate::{
    Error, Result,
    exchange::TokenClient,
    handlers::{PlainTextPage, RenderResponse, TokenSink},
    pkce::{self, PkceChallenge},
    types::{FlowConfig, Token},
};

/// Query parameters owned by the flow; caller-supplied extras may not
/// shadow these.
const PROTECTED_PARAMS: [&str; 3] = ["state", "code_challenge", "code_challenge_method"];

/// A single authorization-code authentication attempt.
///
/// Each instance owns its own PKCE verifier and CSRF state; neither is
/// ever persisted or shared across instances. The CSRF state is
/// single-use: the first callback request presenting the matching value
/// consumes it, and any later request fails the state check.
#[derive(Debug)]
pub struct AuthCodeFlow {
    config: FlowConfig,
    auth_endpoint: Url,
    redirect: Url,
    pkce: PkceChallenge,
    state: String,
    state_used: AtomicBool,
    token: TokenClient,
}

impl AuthCodeFlow {
    /// Validates the configured URLs and generates the per-instance
    /// secrets. Configuration errors fail fast and are never retried.
    pub fn new(config: FlowConfig) -> Result<Self> {
        let auth_endpoint = Url::parse(&config.authorization_url)
            .map_err(|source| Error::config(format!("invalid authorization_url: {source}")))?;
        let token_endpoint = Url::parse(&config.token_url)
            .map_err(|source| Error::config(format!("invalid token_url: {source}")))?;
        let redirect = Url::parse(&config.redirect_url)
            .map_err(|source| Error::config(format!("invalid redirect_url: {source}")))?;

        let token = TokenClient::new(
            reqwest::Client::new(),
            token_endpoint,
            config.client_id.clone(),
        );

        Ok(Self {
            auth_endpoint,
            redirect,
            pkce: PkceChallenge::generate()?,
            state: pkce::generate_state()?,
            state_used: AtomicBool::new(false),
            token,
            config,
        })
    }

    /// The URL to open in the user's browser.
    #[must_use]
    pub fn authorization_url(&self) -> String {
        let mut url = self.auth_endpoint.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", self.redirect.as_str())
            .append_pair("state", &self.state)
            .append_pair("code_challenge", &self.pkce.challenge)
            .append_pair("code_challenge_method", pkce::CHALLENGE_METHOD);

        if let Some(audience) = &self.config.audience {
            url.query_pairs_mut().append_pair("audience", audience);
        }

        if !self.config.scopes.is_empty() {
            url.query_pairs_mut()
                .append_pair("scope", &self.config.scopes.join(" "));
        }

        // Extras go last and may not shadow the flow's own parameters.
        for (key, value) in &self.config.extra_params {
            if PROTECTED_PARAMS.contains(&key.as_str()) {
                debug!(key = %key, "ignoring extra parameter reserved by the flow");
                continue;
            }
            url.query_pairs_mut().append_pair(key, value);
        }

        url.to_string()
    }

    /// Build the HTTP handler for the loopback callback, bound to this
    /// flow instance. `on_token` is invoked exactly once, synchronously,
    /// when the code exchange succeeds; a failure it returns surfaces to
    /// `render` as a server error.
    pub fn callback(
        self: Arc<Self>,
        on_token: Arc<dyn TokenSink>,
        render: Arc<dyn RenderResponse>,
    ) -> Router {
        Router::new().fallback(move |req: Request| {
            let flow = self.clone();
            let on_token = on_token.clone();
            let render = render.clone();
            async move { flow.handle_callback(req, on_token.as_ref(), render.as_ref()).await }
        })
    }

    /// Validation sequence for an incoming callback request, evaluated in
    /// order with short-circuit on the first failure. A request that
    /// fails the path or method checks is not necessarily the real
    /// callback, so the flow keeps waiting after rejecting it.
    async fn handle_callback(
        &self,
        req: Request,
        on_token: &dyn TokenSink,
        render: &dyn RenderResponse,
    ) -> Response {
        if req.uri().path() != self.redirect.path() {
            return render.render(
                StatusCode::NOT_FOUND,
                Some(&Error::protocol(format!(
                    "no handler for {}",
                    req.uri().path()
                ))),
            );
        }
        if req.method() != Method::GET {
            return render.render(
                StatusCode::METHOD_NOT_ALLOWED,
                Some(&Error::protocol(format!(
                    "method {} not allowed for the callback",
                    req.method()
                ))),
            );
        }

        let params: HashMap<String, String> =
            url::form_urlencoded::parse(req.uri().query().unwrap_or("").as_bytes())
                .into_owned()
                .collect();

        match params.get("state") {
            Some(state) if self.consume_state(state) => {},
            _ => return render.render(StatusCode::FORBIDDEN, Some(&Error::StateMismatch)),
        }

        if let Some(code) = params.get("error") {
            return render.render(
                StatusCode::INTERNAL_SERVER_ERROR,
                Some(&Error::AuthorizationServer {
                    code: code.clone(),
                    description: params.get("error_description").cloned(),
                }),
            );
        }

        let Some(code) = params.get("code") else {
            return render.render(
                StatusCode::INTERNAL_SERVER_ERROR,
                Some(&Error::protocol("callback is missing the code parameter")),
            );
        };

        let exchanged = self
            .token
            .exchange_code(code, &self.pkce.verifier, self.redirect.as_str())
            .await;

        match exchanged {
            Ok(token) => match on_token.on_token(&token) {
                Ok(()) => render.render(StatusCode::OK, None),
                Err(err) => render.render(StatusCode::INTERNAL_SERVER_ERROR, Some(&err)),
            },
            Err(err) => render.render(StatusCode::INTERNAL_SERVER_ERROR, Some(&err)),
        }
    }

    /// Compare-and-consume the CSRF state. Returns true at most once, for
    /// the first request presenting the matching value, which also rejects
    /// a replayed state/code pair after a completed exchange.
    fn consume_state(&self, presented: &str) -> bool {
        presented == self.state && !self.state_used.swap(true, Ordering::SeqCst)
    }

    fn redirect_port(&self) -> Result<u16> {
        self.redirect
            .port()
            .ok_or_else(|| Error::config("redirect_url must carry an explicit port"))
    }
}

/// Serves the callback router on the loopback interface until a token
/// arrives, then shuts down.
pub struct CallbackServer;

impl CallbackServer {
    /// Bind `127.0.0.1:<redirect port>`, serve the flow's callback, and
    /// resolve with the obtained token. Times out after `timeout`.
    pub async fn wait_for_token(
        flow: Arc<AuthCodeFlow>,
        timeout: std::time::Duration,
    ) -> Result<Token> {
        let port = flow.redirect_port()?;

        let (tx, rx) = oneshot::channel::<Token>();
        let tx = Arc::new(std::sync::Mutex::new(Some(tx)));
        let sink: Arc<dyn TokenSink> = Arc::new(move |token: &Token| -> Result<()> {
            if let Some(tx) = tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
                let _ = tx.send(token.clone());
            }
            Ok(())
        });

        let app = flow.callback(sink, Arc::new(PlainTextPage));
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
        let server = axum::serve(listener, app);

        tokio::select! {
            result = rx => {
                result.map_err(|_| Error::protocol("callback server closed before a token was received"))
            }
            res = server.into_future() => {
                res?;
                Err(Error::protocol("callback server exited unexpectedly"))
            }
            () = tokio::time::sleep(timeout) => {
                Err(Error::protocol(format!(
                    "timed out after {}s waiting for the OAuth callback",
                    timeout.as_secs()
                )))
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use secrecy::ExposeSecret;

    use {super::*, crate::handlers::DiscardToken};

    fn test_config(token_url: &str) -> FlowConfig {
        FlowConfig {
            client_id: "test-client".into(),
            scopes: vec!["openid".into(), "offline_access".into()],
            authorization_url: "https://issuer.example.com/oauth/authorize".into(),
            token_url: token_url.into(),
            redirect_url: "http://127.0.0.1:18080/auth/callback".into(),
            audience: None,
            ..FlowConfig::default()
        }
    }

    fn query_params(raw: &str) -> HashMap<String, String> {
        let url = Url::parse(raw).unwrap();
        url.query_pairs().into_owned().collect()
    }

    /// Serve the flow's callback on an ephemeral port and return its base URL.
    async fn serve_callback(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// Sink that records every token it sees.
    fn recording_sink() -> (Arc<Mutex<Vec<Token>>>, Arc<dyn TokenSink>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            Arc::new(move |token: &Token| -> Result<()> {
                seen.lock().unwrap().push(token.clone());
                Ok(())
            })
        };
        (seen, sink)
    }

    #[test]
    fn authorization_url_contains_flow_parameters() {
        let flow = AuthCodeFlow::new(test_config("https://issuer.example.com/oauth/token")).unwrap();
        let params = query_params(&flow.authorization_url());

        assert_eq!(params.get("response_type").map(String::as_str), Some("code"));
        assert_eq!(params.get("client_id").map(String::as_str), Some("test-client"));
        assert_eq!(
            params.get("redirect_uri").map(String::as_str),
            Some("http://127.0.0.1:18080/auth/callback")
        );
        assert_eq!(
            params.get("scope").map(String::as_str),
            Some("openid offline_access")
        );
        assert_eq!(
            params.get("code_challenge_method").map(String::as_str),
            Some("S256")
        );
        assert_eq!(params.get("state").map(String::as_str), Some(flow.state.as_str()));
    }

    #[test]
    fn authorization_url_challenge_matches_stored_verifier() {
        let flow = AuthCodeFlow::new(test_config("https://issuer.example.com/oauth/token")).unwrap();
        let params = query_params(&flow.authorization_url());
        assert_eq!(
            params.get("code_challenge").map(String::as_str),
            Some(pkce::challenge(&flow.pkce.verifier).as_str())
        );
    }

    #[test]
    fn extra_params_append_but_never_override() {
        let mut config = test_config("https://issuer.example.com/oauth/token");
        config.extra_params = vec![
            ("prompt".into(), "consent".into()),
            ("state".into(), "attacker-chosen".into()),
            ("code_challenge".into(), "attacker-chosen".into()),
        ];
        let flow = AuthCodeFlow::new(config).unwrap();
        let raw = flow.authorization_url();
        let params = query_params(&raw);

        assert_eq!(params.get("prompt").map(String::as_str), Some("consent"));
        assert_eq!(params.get("state").map(String::as_str), Some(flow.state.as_str()));
        assert!(!raw.contains("attacker-chosen"));
    }

    #[test]
    fn audience_is_forwarded_when_set() {
        let mut config = test_config("https://issuer.example.com/oauth/token");
        config.audience = Some("https://api.example.com".into());
        let flow = AuthCodeFlow::new(config).unwrap();
        let params = query_params(&flow.authorization_url());
        assert_eq!(
            params.get("audience").map(String::as_str),
            Some("https://api.example.com")
        );
    }

    #[test]
    fn malformed_urls_fail_fast() {
        let mut config = test_config("https://issuer.example.com/oauth/token");
        config.redirect_url = "not a url".into();
        let err = AuthCodeFlow::new(config).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn callback_with_wrong_path_is_404_even_with_bad_state() {
        let flow = Arc::new(
            AuthCodeFlow::new(test_config("https://issuer.example.com/oauth/token")).unwrap(),
        );
        let app = flow.callback(Arc::new(DiscardToken), Arc::new(PlainTextPage));
        let base = serve_callback(app).await;

        let resp = reqwest::get(format!("{base}/elsewhere?state=wrong"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn callback_with_wrong_method_is_405() {
        let flow = Arc::new(
            AuthCodeFlow::new(test_config("https://issuer.example.com/oauth/token")).unwrap(),
        );
        let state = flow.state.clone();
        let app = flow.callback(Arc::new(DiscardToken), Arc::new(PlainTextPage));
        let base = serve_callback(app).await;

        let resp = reqwest::Client::new()
            .post(format!("{base}/auth/callback?state={state}&code=abc"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn callback_with_state_mismatch_is_403() {
        let flow = Arc::new(
            AuthCodeFlow::new(test_config("https://issuer.example.com/oauth/token")).unwrap(),
        );
        let app = flow.callback(Arc::new(DiscardToken), Arc::new(PlainTextPage));
        let base = serve_callback(app).await;

        let resp = reqwest::get(format!("{base}/auth/callback?state=wrong&code=abc"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert!(resp.text().await.unwrap().contains("state parameter mismatch"));
    }

    #[tokio::test]
    async fn callback_with_provider_error_is_500() {
        let flow = Arc::new(
            AuthCodeFlow::new(test_config("https://issuer.example.com/oauth/token")).unwrap(),
        );
        let state = flow.state.clone();
        let app = flow.callback(Arc::new(DiscardToken), Arc::new(PlainTextPage));
        let base = serve_callback(app).await;

        let resp = reqwest::get(format!(
            "{base}/auth/callback?state={state}&error=access_denied&error_description=nope"
        ))
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(resp.text().await.unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn callback_without_code_is_500() {
        let flow = Arc::new(
            AuthCodeFlow::new(test_config("https://issuer.example.com/oauth/token")).unwrap(),
        );
        let state = flow.state.clone();
        let app = flow.callback(Arc::new(DiscardToken), Arc::new(PlainTextPage));
        let base = serve_callback(app).await;

        let resp = reqwest::get(format!("{base}/auth/callback?state={state}"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn callback_success_exchanges_code_and_rejects_replay() {
        let mut server = mockito::Server::new_async().await;
        let flow = Arc::new(
            AuthCodeFlow::new(test_config(&format!("{}/oauth/token", server.url()))).unwrap(),
        );

        // The exchange must carry the authorization-code grant with this
        // flow's stored verifier as code_verifier.
        let token_mock = server
            .mock("POST", "/oauth/token")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                mockito::Matcher::UrlEncoded("code".into(), "auth-code-1".into()),
                mockito::Matcher::UrlEncoded("client_id".into(), "test-client".into()),
                mockito::Matcher::UrlEncoded(
                    "redirect_uri".into(),
                    "http://127.0.0.1:18080/auth/callback".into(),
                ),
                mockito::Matcher::UrlEncoded("code_verifier".into(), flow.pkce.verifier.clone()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                serde_json::json!({
                    "access_token": "at_success",
                    "token_type": "Bearer",
                    "expires_in": 3600
                })
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;
        let state = flow.state.clone();
        let (seen, sink) = recording_sink();
        let app = flow.clone().callback(sink, Arc::new(PlainTextPage));
        let base = serve_callback(app).await;

        let callback = format!("{base}/auth/callback?state={state}&code=auth-code-1");
        let resp = reqwest::get(&callback).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].access_token.expose_secret(), "at_success");
        }

        // The state was consumed by the first exchange; a replayed
        // valid-looking callback must be rejected outright.
        let resp = reqwest::get(&callback).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(seen.lock().unwrap().len(), 1);

        token_mock.assert_async().await;
    }

    #[tokio::test]
    async fn callback_exchange_failure_is_500() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/oauth/token")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let flow = Arc::new(
            AuthCodeFlow::new(test_config(&format!("{}/oauth/token", server.url()))).unwrap(),
        );
        let state = flow.state.clone();
        let app = flow.callback(Arc::new(DiscardToken), Arc::new(PlainTextPage));
        let base = serve_callback(app).await;

        let resp = reqwest::get(format!("{base}/auth/callback?state={state}&code=bad"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(resp.text().await.unwrap().contains("invalid_grant"));
    }

    #[tokio::test]
    async fn failing_token_sink_surfaces_as_500() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"at","token_type":"Bearer"}"#)
            .create_async()
            .await;

        let flow = Arc::new(
            AuthCodeFlow::new(test_config(&format!("{}/oauth/token", server.url()))).unwrap(),
        );
        let state = flow.state.clone();
        let sink: Arc<dyn TokenSink> = Arc::new(|_token: &Token| -> Result<()> {
            Err(Error::protocol("sink rejected the token"))
        });
        let app = flow.callback(sink, Arc::new(PlainTextPage));
        let base = serve_callback(app).await;

        let resp = reqwest::get(format!("{base}/auth/callback?state={state}&code=ok"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(resp.text().await.unwrap().contains("sink rejected the token"));
    }

    #[tokio::test]
    async fn wait_for_token_resolves_on_callback() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"at_cb","token_type":"Bearer"}"#)
            .create_async()
            .await;

        // Pick an ephemeral port for the loopback redirect.
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let mut config = test_config(&format!("{}/oauth/token", server.url()));
        config.redirect_url = format!("http://127.0.0.1:{port}/auth/callback");
        let flow = Arc::new(AuthCodeFlow::new(config).unwrap());
        let state = flow.state.clone();

        let waiter = tokio::spawn(CallbackServer::wait_for_token(
            flow,
            std::time::Duration::from_secs(10),
        ));

        // Give the server a moment to bind, then play the browser's part.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let resp = reqwest::get(format!(
            "http://127.0.0.1:{port}/auth/callback?state={state}&code=cb-code"
        ))
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let token = waiter.await.unwrap().unwrap();
        assert_eq!(token.access_token.expose_secret(), "at_cb");
    }
}
