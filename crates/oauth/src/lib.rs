pub mod authcode;
pub mod device;
pub mod discovery;
pub mod error;
mod exchange;
pub mod handlers;
pub mod pkce;
pub mod types;

pub use {
    authcode::{AuthCodeFlow, CallbackServer},
    device::{DeviceAuthorization, DeviceFlow},
    discovery::well_known_uri,
    handlers::{DiscardToken, PlainTextPage, PresentUserCode, RenderResponse, StderrPresenter, TokenSink},
    pkce::PkceChallenge,
    types::{FlowConfig, Token},
};

pub use error::{Error, Result};
