//! Token-authenticating HTTP client for v2 container registry APIs.
//!
//! Probing `GET /v2/` either succeeds outright or answers 401 with a
//! `Www-Authenticate` challenge naming a token service. The client fetches
//! a bearer token from that service (with basic auth when credentials are
//! configured) and replays the probe. The token is cached and attached to
//! every later request.

use std::time::Duration;

use regex::Regex;
use reqwest::header::{ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Response, StatusCode};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::error::{RegistryError, RegistryResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP client that transparently performs the registry token dance.
pub struct OciClient {
    username: String,
    password: String,
    base: Url,
    client: reqwest::Client,
    // Guards token refresh so concurrent 401s cannot race each other.
    token: Mutex<Option<String>>,
}

impl OciClient {
    pub fn new(
        username: &str,
        password: &str,
        skip_verify_tls: bool,
        base: Url,
    ) -> RegistryResult<Self> {
        if skip_verify_tls {
            warn!("skipping verification of registry TLS certificate per adapter configuration");
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(skip_verify_tls)
            .build()?;

        Ok(Self {
            username: username.to_string(),
            password: password.to_string(),
            base,
            client,
            token: Mutex::new(None),
        })
    }

    /// Base URL of the registry this client talks to.
    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Join `path` onto the registry base URL.
    pub fn endpoint(&self, path: &str) -> RegistryResult<Url> {
        self.base.join(path).map_err(|e| RegistryError::Url {
            url: format!("{}{}", self.base, path),
            reason: e.to_string(),
        })
    }

    /// Probe `GET /v2/`, acquiring a token on a 401 challenge and trying
    /// once more with it.
    pub async fn login(&self) -> RegistryResult<()> {
        let mut token = self.token.lock().await;

        let probe = self.endpoint("/v2/")?;
        let resp = self.send(probe.clone(), token.as_deref()).await?;

        match resp.status() {
            StatusCode::UNAUTHORIZED => {
                let challenge = resp
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let fresh = self.fetch_token(&challenge).await?;

                let retry = self.send(probe, Some(&fresh)).await?;
                if retry.status() != StatusCode::OK {
                    warn!(status = %retry.status(), "token not accepted by /v2/");
                    return Err(RegistryError::Response {
                        code: retry.status().as_u16(),
                        body: "token not accepted by /v2/".to_string(),
                    });
                }
                debug!("GET /v2/ successful with new token");
                *token = Some(fresh);
            }
            StatusCode::OK => {
                debug!("GET /v2/ successful");
            }
            status => {
                warn!(%status, "bad response from /v2/");
                return Err(RegistryError::Response {
                    code: status.as_u16(),
                    body: "bad response from /v2/".to_string(),
                });
            }
        }
        Ok(())
    }

    /// GET a registry URL with the cached token, if any.
    pub async fn get(&self, url: Url) -> RegistryResult<Response> {
        let token = self.token.lock().await.clone();
        self.send(url, token.as_deref()).await
    }

    async fn send(&self, url: Url, token: Option<&str>) -> RegistryResult<Response> {
        let mut req = self.client.get(url).header(ACCEPT, "application/json");
        if let Some(token) = token {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        Ok(req.send().await?)
    }

    async fn fetch_token(&self, challenge: &str) -> RegistryResult<String> {
        let token_url = parse_auth_header(challenge)?;

        let mut req = self.client.get(token_url);
        if !self.password.is_empty() {
            debug!("adding basic auth to token request");
            req = req.basic_auth(&self.username, Some(&self.password));
        }

        let resp = req.send().await?;
        if resp.status() != StatusCode::OK {
            warn!(status = %resp.status(), "token service rejected the request");
            return Err(RegistryError::Response {
                code: resp.status().as_u16(),
                body: "token service rejected the request".to_string(),
            });
        }

        #[derive(serde::Deserialize)]
        struct AuthResponse {
            #[serde(default)]
            access_token: String,
            #[serde(default)]
            token: String,
        }

        let auth: AuthResponse = resp.json().await?;
        if !auth.access_token.is_empty() {
            Ok(auth.access_token)
        } else {
            Ok(auth.token)
        }
    }
}

/// Parse a `Www-Authenticate` challenge into the token service URL.
fn parse_auth_header(value: &str) -> RegistryResult<Url> {
    let realm_re = Regex::new("realm=\"([^\"]+)\"").map_err(|e| RegistryError::Auth(e.to_string()))?;
    let service_re =
        Regex::new("service=\"([^\"]+)\"").map_err(|e| RegistryError::Auth(e.to_string()))?;

    let realm = realm_re
        .captures(value)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| {
            warn!(header = value, "could not parse www-authenticate header");
            RegistryError::Auth(format!("could not parse www-authenticate header: {value}"))
        })?;

    let mut url = Url::parse(realm).map_err(|_| {
        warn!(realm, "realm is not a valid URL");
        RegistryError::Auth(format!("realm is not a valid URL: {realm}"))
    })?;

    if let Some(service) = service_re
        .captures(value)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
    {
        url.query_pairs_mut().append_pair("service", service);
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{basic_auth, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn auth_header_parses_realm_and_service() {
        let url = parse_auth_header(
            "Bearer realm=\"https://sso.example.com/token\",service=\"registry.example.com\"",
        )
        .unwrap();
        assert_eq!(url.host_str(), Some("sso.example.com"));
        assert_eq!(url.path(), "/token");
        assert!(url.query().unwrap().contains("service=registry.example.com"));
    }

    #[test]
    fn auth_header_without_realm_is_an_error() {
        assert!(parse_auth_header("Bearer nope").is_err());
    }

    #[tokio::test]
    async fn login_succeeds_without_token_on_200() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client =
            OciClient::new("", "", false, Url::parse(&server.uri()).unwrap()).unwrap();
        client.login().await.unwrap();
    }

    #[tokio::test]
    async fn login_fetches_token_on_401_challenge() {
        let server = MockServer::start().await;
        let challenge = format!(
            "Bearer realm=\"{}/token\",service=\"test-registry\"",
            server.uri()
        );

        Mock::given(method("GET"))
            .and(path("/v2/"))
            .and(header("Authorization", "Bearer shiny-new-token"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(401).insert_header("Www-Authenticate", challenge))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .and(query_param("service", "test-registry"))
            .and(basic_auth("user", "pass"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "shiny-new-token"
            })))
            .mount(&server)
            .await;

        let client =
            OciClient::new("user", "pass", false, Url::parse(&server.uri()).unwrap()).unwrap();
        client.login().await.unwrap();

        // Token is cached for later requests.
        let resp = client.get(client.endpoint("/v2/").unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn login_fails_when_token_is_rejected() {
        let server = MockServer::start().await;
        let challenge = format!("Bearer realm=\"{}/token\"", server.uri());

        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(401).insert_header("Www-Authenticate", challenge))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"token": "rejected-token"})),
            )
            .mount(&server)
            .await;

        let err = OciClient::new("", "", false, Url::parse(&server.uri()).unwrap())
            .unwrap()
            .login()
            .await;
        assert!(err.is_err());
    }
}
