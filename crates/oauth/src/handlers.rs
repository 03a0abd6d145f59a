//! Strategy traits for the points where the flows hand control back to
//! the caller, each with an explicit default implementation.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::{Error, Result, types::Token};

/// Receives the obtained token. Invoked exactly once per successful flow;
/// a returned error becomes the overall result of the flow.
pub trait TokenSink: Send + Sync {
    fn on_token(&self, token: &Token) -> Result<()>;
}

impl<F> TokenSink for F
where
    F: Fn(&Token) -> Result<()> + Send + Sync,
{
    fn on_token(&self, token: &Token) -> Result<()> {
        self(token)
    }
}

/// Default sink: accepts the token and does nothing with it.
pub struct DiscardToken;

impl TokenSink for DiscardToken {
    fn on_token(&self, _token: &Token) -> Result<()> {
        Ok(())
    }
}

/// Renders the HTTP result of a callback request back to the browser.
pub trait RenderResponse: Send + Sync {
    fn render(&self, status: StatusCode, error: Option<&Error>) -> Response;
}

/// Default renderer: a plain-text body, with the error message on failure.
pub struct PlainTextPage;

impl RenderResponse for PlainTextPage {
    fn render(&self, status: StatusCode, error: Option<&Error>) -> Response {
        match error {
            Some(err) => (status, format!("{err}\n")).into_response(),
            None => (
                status,
                "authenticated: you may close this window\n".to_string(),
            )
                .into_response(),
        }
    }
}

/// Shows the user code and verification URI to the user. Invoked exactly
/// once per device flow; it only displays information and must return
/// promptly rather than wait for the user.
pub trait PresentUserCode: Send + Sync {
    fn present(
        &self,
        user_code: &str,
        verification_uri: &str,
        verification_uri_complete: Option<&str>,
    ) -> Result<()>;
}

impl<F> PresentUserCode for F
where
    F: Fn(&str, &str, Option<&str>) -> Result<()> + Send + Sync,
{
    fn present(
        &self,
        user_code: &str,
        verification_uri: &str,
        verification_uri_complete: Option<&str>,
    ) -> Result<()> {
        self(user_code, verification_uri, verification_uri_complete)
    }
}

/// Default presenter: prints sign-in instructions to stderr so stdout
/// stays free for the credential output of the enclosing CLI.
pub struct StderrPresenter;

impl PresentUserCode for StderrPresenter {
    fn present(
        &self,
        user_code: &str,
        verification_uri: &str,
        verification_uri_complete: Option<&str>,
    ) -> Result<()> {
        match verification_uri_complete {
            Some(uri) => eprintln!("Open {uri} in a browser to sign in"),
            None => eprintln!("Open {verification_uri} in a browser and enter the code: {user_code}"),
        }
        Ok(())
    }
}
