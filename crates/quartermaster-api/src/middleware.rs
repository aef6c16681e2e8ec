//! Request middleware for OSB routes.

use axum::Json;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::warn;

use quartermaster_broker::ErrorResponse;

use crate::{ApiState, BasicCredentials};

/// Header every OSB request must carry.
pub const API_VERSION_HEADER: &str = "X-Broker-API-Version";

/// Reject requests without an `X-Broker-API-Version` header.
pub async fn require_api_version(request: Request, next: Next) -> Response {
    if request.headers().get(API_VERSION_HEADER).is_none() {
        warn!(path = %request.uri().path(), "request without api version header");
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                description: format!("{API_VERSION_HEADER} header is required"),
            }),
        )
            .into_response();
    }
    next.run(request).await
}

/// Check basic auth when the broker has credentials configured.
pub async fn require_auth(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.auth else {
        return next.run(request).await;
    };

    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| credentials_match(value, expected));

    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"broker\"")],
            Json(ErrorResponse {
                description: "credentials are not valid".to_string(),
            }),
        )
            .into_response();
    }
    next.run(request).await
}

fn credentials_match(header_value: &str, expected: &BasicCredentials) -> bool {
    let Some(encoded) = header_value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    match decoded.split_once(':') {
        Some((user, pass)) => user == expected.username && pass == expected.password,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected() -> BasicCredentials {
        BasicCredentials {
            username: "admin".to_string(),
            password: "s3cret".to_string(),
        }
    }

    fn encode(user: &str, pass: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{user}:{pass}")))
    }

    #[test]
    fn matching_credentials_pass() {
        assert!(credentials_match(&encode("admin", "s3cret"), &expected()));
    }

    #[test]
    fn wrong_password_and_malformed_headers_fail() {
        assert!(!credentials_match(&encode("admin", "wrong"), &expected()));
        assert!(!credentials_match("Bearer abc", &expected()));
        assert!(!credentials_match("Basic not-base64!!", &expected()));
        let no_colon = format!("Basic {}", BASE64.encode("adminonly"));
        assert!(!credentials_match(&no_colon, &expected()));
    }
}
