use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::Engine as _;

use crate::request::AuthorizationResponse;

/// Parses HTTP Basic credentials out of the `Authorization` header.
#[must_use]
pub fn basic_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Response for a denied authorization: 401 with a Basic challenge when the
/// client never presented credentials, 403 otherwise.
#[must_use]
pub fn denied_response(auth: &AuthorizationResponse) -> Response {
    if auth.challenge {
        let mut response = (StatusCode::UNAUTHORIZED, "Authentication required").into_response();
        response.headers_mut().insert(
            "WWW-Authenticate",
            "Basic realm=\"omegaup-gitserver\"".parse().unwrap(),
        );
        response
    } else {
        (StatusCode::FORBIDDEN, "Forbidden").into_response()
    }
}
