use crate::config::{ClientAuthMethod, ClientSpec};
use crate::error::AuthError;
use crate::jwt::{JwtHandler, now_unix};
use axum::body::Bytes;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Lifetime of a generated client assertion.
const ASSERTION_LIFETIME_SECS: i64 = 60;

/// Form parameters, in order. Repeated keys are allowed.
pub type Params = Vec<(String, String)>;

/// The relying party as registered with the authorization server.
pub struct OAuthClient {
    pub id: String,
    pub secret: String,
    pub audience: String,
    /// Space-joined scopes.
    pub scope: String,
    pub jwt: Option<Arc<JwtHandler>>,
}

impl std::fmt::Debug for OAuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClient")
            .field("id", &self.id)
            .field("secret", &"[REDACTED]")
            .field("audience", &self.audience)
            .field("scope", &self.scope)
            .finish()
    }
}

impl OAuthClient {
    pub fn from_spec(spec: &ClientSpec) -> Result<Self, AuthError> {
        let jwt = spec
            .jwt
            .as_ref()
            .map(JwtHandler::from_spec)
            .transpose()?
            .map(Arc::new);

        let audience = if spec.audience.is_empty() {
            spec.id.clone()
        } else {
            spec.audience.clone()
        };

        Ok(Self {
            id: spec.id.clone(),
            secret: spec.secret.clone(),
            audience,
            scope: spec.scopes.join(" "),
            jwt,
        })
    }
}

#[derive(Serialize)]
struct ClientAssertion<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: [&'a str; 1],
    exp: i64,
    iat: i64,
    jti: String,
}

/// Raw answer of an authorization server endpoint.
/// The status is not interpreted here; callers classify it.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Bytes,
}

impl RawResponse {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends client-authenticated form POSTs to the authorization server.
pub struct ClientRequester {
    client: Arc<OAuthClient>,
    method: ClientAuthMethod,
    extra_params: Params,
    headers: HeaderMap,
    http: reqwest::Client,
}

impl ClientRequester {
    pub fn new(
        client: Arc<OAuthClient>,
        method: ClientAuthMethod,
        extra_params: Params,
        headers: HeaderMap,
        http: reqwest::Client,
    ) -> Result<Self, AuthError> {
        if matches!(
            method,
            ClientAuthMethod::ClientSecretJwt | ClientAuthMethod::PrivateKeyJwt
        ) && !client.jwt.as_ref().is_some_and(|j| j.can_sign())
        {
            return Err(AuthError::CreateComponent(format!(
                "client auth method {:?} needs a signing key",
                method
            )));
        }
        Ok(Self {
            client,
            method,
            extra_params,
            headers,
            http,
        })
    }

    pub fn client(&self) -> &OAuthClient {
        &self.client
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Builds the form body and any auth header for `endpoint`.
    pub fn build_body(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<(Params, Option<HeaderValue>), AuthError> {
        let mut body: Params = self
            .extra_params
            .iter()
            .filter(|(k, _)| !params.iter().any(|(pk, _)| pk == k))
            .cloned()
            .collect();
        body.extend(params.iter().cloned());

        let mut auth_header = None;
        match self.method {
            ClientAuthMethod::Basic => {
                let raw = format!("{}:{}", self.client.id, self.client.secret);
                let value = format!("Basic {}", BASE64.encode(raw.as_bytes()));
                auth_header = Some(
                    HeaderValue::from_str(&value)
                        .map_err(|e| AuthError::CreateRequest(e.to_string()))?,
                );
            }
            ClientAuthMethod::Form => {
                body.push(("client_id".into(), self.client.id.clone()));
                body.push(("client_secret".into(), self.client.secret.clone()));
            }
            ClientAuthMethod::ClientSecretJwt | ClientAuthMethod::PrivateKeyJwt => {
                let assertion = self.client_assertion(endpoint)?;
                body.push(("client_assertion_type".into(), CLIENT_ASSERTION_TYPE.into()));
                body.push(("client_assertion".into(), assertion));
            }
            ClientAuthMethod::TlsClientAuth | ClientAuthMethod::SelfSignedTlsClientAuth => {
                // the certificate itself authenticates; only identify the client
                body.push(("client_id".into(), self.client.id.clone()));
            }
        }
        Ok((body, auth_header))
    }

    fn client_assertion(&self, endpoint: &str) -> Result<String, AuthError> {
        let jwt = self.client.jwt.as_ref().ok_or_else(|| {
            AuthError::CreateRequest("client assertion needs a signing key".into())
        })?;
        let now = now_unix();
        jwt.sign(&ClientAssertion {
            iss: &self.client.id,
            sub: &self.client.id,
            aud: [endpoint],
            exp: now + ASSERTION_LIFETIME_SECS,
            iat: now,
            jti: Uuid::new_v4().to_string(),
        })
    }

    /// POSTs `params` to `endpoint` with client authentication applied.
    ///
    /// An `Err` means no usable answer was obtained (request never sent, body
    /// unreadable or not JSON). Any HTTP status is returned as-is.
    pub async fn do_request(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<RawResponse, AuthError> {
        let raw = self.post(endpoint, params).await?;
        if !is_json(&raw.content_type) {
            tracing::debug!(
                "{} answered {} with content type {:?}",
                endpoint,
                raw.status,
                raw.content_type
            );
            return Err(AuthError::InvalidResponse(raw.content_type));
        }
        Ok(raw)
    }

    /// Like [`do_request`](Self::do_request) but accepts any content type.
    pub async fn post(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<RawResponse, AuthError> {
        if endpoint.is_empty() {
            return Err(AuthError::CreateRequest("endpoint not configured".into()));
        }
        let (body, auth_header) = self.build_body(endpoint, params)?;
        let encoded =
            serde_urlencoded::to_string(&body).map_err(|e| AuthError::CreateRequest(e.to_string()))?;

        let mut request = self
            .http
            .post(endpoint)
            .headers(self.headers.clone())
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(header::ACCEPT, "application/json")
            .body(encoded);
        if let Some(value) = auth_header {
            request = request.header(header::AUTHORIZATION, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AuthError::RoundTrip(e.to_string()))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response
            .bytes()
            .await
            .map_err(|e| AuthError::ReadBody(e.to_string()))?;

        Ok(RawResponse {
            status,
            content_type,
            body,
        })
    }
}

pub fn is_json(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
}

pub fn params_from_map(map: &std::collections::BTreeMap<String, String>) -> Params {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwt::ParseOptions;
    use jsonwebtoken::Algorithm;
    use wiremock::matchers::{header as header_is, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SECRET: &[u8] = b"client-secret-client-secret-1234";

    fn client(with_jwt: bool) -> Arc<OAuthClient> {
        Arc::new(OAuthClient {
            id: "app".into(),
            secret: "s3cret".into(),
            audience: "app".into(),
            scope: "openid profile".into(),
            jwt: with_jwt.then(|| Arc::new(JwtHandler::hmac(None, Algorithm::HS256, SECRET))),
        })
    }

    fn requester(method: ClientAuthMethod) -> ClientRequester {
        ClientRequester::new(
            client(true),
            method,
            vec![("audience".into(), "api".into())],
            HeaderMap::new(),
            reqwest::Client::new(),
        )
        .unwrap()
    }

    fn params() -> Params {
        vec![
            ("grant_type".into(), "client_credentials".into()),
            ("scope".into(), "openid".into()),
        ]
    }

    fn get<'a>(body: &'a Params, key: &str) -> Option<&'a str> {
        body.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_audience_defaults_to_id() {
        let c = OAuthClient::from_spec(&ClientSpec {
            id: "app".into(),
            scopes: vec!["openid".into(), "email".into()],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(c.audience, "app");
        assert_eq!(c.scope, "openid email");
    }

    #[test]
    fn test_basic_and_form_bodies() {
        let (body, auth) = requester(ClientAuthMethod::Basic)
            .build_body("https://idp/token", &params())
            .unwrap();
        assert_eq!(auth.unwrap(), "Basic YXBwOnMzY3JldA==");
        assert_eq!(get(&body, "audience"), Some("api"));
        assert_eq!(get(&body, "grant_type"), Some("client_credentials"));
        assert_eq!(get(&body, "client_secret"), None);

        let (body, auth) = requester(ClientAuthMethod::Form)
            .build_body("https://idp/token", &params())
            .unwrap();
        assert!(auth.is_none());
        assert_eq!(get(&body, "client_id"), Some("app"));
        assert_eq!(get(&body, "client_secret"), Some("s3cret"));
    }

    #[test]
    fn test_params_override_extras() {
        let (body, _) = requester(ClientAuthMethod::Basic)
            .build_body("https://idp/token", &[("audience".into(), "mine".into())])
            .unwrap();
        assert_eq!(body, vec![("audience".to_string(), "mine".to_string())]);
    }

    #[test]
    fn test_tls_client_auth_only_identifies() {
        let (body, auth) = requester(ClientAuthMethod::TlsClientAuth)
            .build_body("https://idp/token", &params())
            .unwrap();
        assert!(auth.is_none());
        assert_eq!(get(&body, "client_id"), Some("app"));
        assert_eq!(get(&body, "client_secret"), None);
    }

    #[test]
    fn test_client_assertion() {
        let (body, _) = requester(ClientAuthMethod::ClientSecretJwt)
            .build_body("https://idp/token", &params())
            .unwrap();
        assert_eq!(get(&body, "client_assertion_type"), Some(CLIENT_ASSERTION_TYPE));

        let assertion = get(&body, "client_assertion").unwrap();
        let verifier = JwtHandler::hmac(None, Algorithm::HS256, SECRET);
        let claims = verifier
            .parse(
                assertion,
                &ParseOptions {
                    issuer: Some("app".into()),
                    audience: Some("https://idp/token".into()),
                    exp_required: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(claims["sub"], "app");
        assert!(claims["jti"].as_str().is_some_and(|j| !j.is_empty()));
    }

    #[test]
    fn test_jwt_method_needs_key() {
        let result = ClientRequester::new(
            client(false),
            ClientAuthMethod::PrivateKeyJwt,
            Vec::new(),
            HeaderMap::new(),
            reqwest::Client::new(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_do_request_posts_form() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(header_is("content-type", "application/x-www-form-urlencoded"))
            .and(header_is("accept", "application/json"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant"
            })))
            .mount(&server)
            .await;

        let endpoint = format!("{}/token", server.uri());
        let resp = requester(ClientAuthMethod::Form)
            .do_request(&endpoint, &params())
            .await
            .unwrap();
        assert_eq!(resp.status, 400);
        assert!(resp.body_text().contains("invalid_grant"));

        let received = server.received_requests().await.unwrap();
        let sent: Params = serde_urlencoded::from_bytes(&received[0].body).unwrap();
        assert_eq!(
            sent,
            vec![
                ("audience".to_string(), "api".to_string()),
                ("grant_type".to_string(), "client_credentials".to_string()),
                ("scope".to_string(), "openid".to_string()),
                ("client_id".to_string(), "app".to_string()),
                ("client_secret".to_string(), "s3cret".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_do_request_rejects_non_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;

        let err = requester(ClientAuthMethod::Basic)
            .do_request(&format!("{}/token", server.uri()), &params())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_do_request_round_trip_failure() {
        let err = requester(ClientAuthMethod::Basic)
            .do_request("http://127.0.0.1:1/token", &params())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::RoundTrip(_)));
    }

    #[test]
    fn test_is_json() {
        assert!(is_json("application/json"));
        assert!(is_json("application/json; charset=utf-8"));
        assert!(!is_json("text/html"));
        assert!(!is_json(""));
    }
}
