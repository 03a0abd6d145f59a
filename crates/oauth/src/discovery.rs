//! Well-known metadata URL computation (RFC 8414 path conventions).

use crate::{Error, Result};

/// Compute the well-known metadata URI for a registered `name` under an
/// issuer URL: `<origin>/.well-known/<name><path>` when the issuer has a
/// non-root path, else `<origin>/.well-known/<name>`.
///
/// The issuer must not carry a query or fragment.
pub fn well_known_uri(issuer: &str, name: &str) -> Result<String> {
    if issuer.contains('?') || issuer.contains('#') {
        return Err(Error::config(format!(
            "issuer must not contain a query or fragment: {issuer}"
        )));
    }
    let (origin, path) = split_origin(issuer);
    let path = if path == "/" { "" } else { path };
    Ok(format!("{origin}/.well-known/{name}{path}"))
}

/// Split an issuer into `scheme://authority` and the path that follows.
/// An issuer without a scheme is treated as a bare path.
fn split_origin(issuer: &str) -> (&str, &str) {
    let Some(scheme_end) = issuer.find("://") else {
        return ("", issuer);
    };
    let rest = &issuer[scheme_end + 3..];
    match rest.find('/') {
        Some(i) => issuer.split_at(scheme_end + 3 + i),
        None => (issuer, ""),
    }
}
