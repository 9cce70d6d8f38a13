use crate::config::ProviderSpec;
use crate::error::AuthError;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long to wait between discovery attempts.
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(5);

/// Issuer and endpoint URLs of an authorization server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoints {
    pub issuer: String,
    pub authorization: String,
    pub token: String,
    pub userinfo: String,
    pub jwks: String,
    pub introspect: String,
    pub revocation: String,
}

/// Subset of an OpenID Provider Metadata document we care about.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    pub jwks_uri: String,
    pub introspection_endpoint: String,
    pub revocation_endpoint: String,
}

fn upgrade(current: &mut String, discovered: String) -> bool {
    if current.is_empty() && !discovered.is_empty() {
        *current = discovered;
        return true;
    }
    false
}

impl Endpoints {
    /// Fills empty fields from a discovery document. Configured or previously
    /// discovered values are never replaced. Returns how many fields changed.
    pub fn merge(&mut self, doc: DiscoveryDocument) -> usize {
        [
            upgrade(&mut self.issuer, doc.issuer),
            upgrade(&mut self.authorization, doc.authorization_endpoint),
            upgrade(&mut self.token, doc.token_endpoint),
            upgrade(&mut self.userinfo, doc.userinfo_endpoint),
            upgrade(&mut self.jwks, doc.jwks_uri),
            upgrade(&mut self.introspect, doc.introspection_endpoint),
            upgrade(&mut self.revocation, doc.revocation_endpoint),
        ]
        .into_iter()
        .filter(|changed| *changed)
        .count()
    }
}

/// One authorization server. Endpoints are readable from any request while the
/// discovery task fills in whatever configuration left empty.
pub struct Provider {
    endpoints: Arc<RwLock<Endpoints>>,
    headers: HeaderMap,
    discovery_url: String,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("endpoints", &self.endpoints())
            .field("discovery_url", &self.discovery_url)
            .finish()
    }
}

/// Joins `base` and `path` the way a path join would: relative paths are
/// appended to the base, absolute URLs and empty paths are kept as they are.
fn join_endpoint(base: &str, path: &str) -> Result<String, String> {
    if path.is_empty() || base.is_empty() || url::Url::parse(path).is_ok() {
        return Ok(path.to_string());
    }
    let base_url = url::Url::parse(base).map_err(|e| format!("base_url {:?}: {}", base, e))?;
    let joined = format!(
        "{}/{}",
        base_url.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url::Url::parse(&joined)
        .map(|u| u.to_string())
        .map_err(|e| format!("endpoint {:?}: {}", path, e))
}

impl Provider {
    /// Builds the provider and, when a discovery endpoint is configured,
    /// spawns the discovery task on the current tokio runtime.
    pub fn new(spec: &ProviderSpec, http: Client) -> Result<Self, AuthError> {
        let mut errors = Vec::new();
        let mut join = |path: &str| {
            join_endpoint(&spec.base_url, path).unwrap_or_else(|e| {
                errors.push(e);
                String::new()
            })
        };

        let endpoints = Endpoints {
            issuer: spec.issuer.clone(),
            authorization: join(&spec.authorization_endpoint),
            token: join(&spec.token_endpoint),
            userinfo: join(&spec.userinfo_endpoint),
            jwks: join(&spec.jwks_endpoint),
            introspect: join(&spec.introspect_endpoint),
            revocation: join(&spec.revocation_endpoint),
        };
        let discovery_url = join(&spec.discovery_endpoint);

        if !errors.is_empty() {
            return Err(AuthError::CreateComponent(format!(
                "provider: {}",
                errors.join("; ")
            )));
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &spec.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| AuthError::CreateComponent(format!("header {:?}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| AuthError::CreateComponent(format!("header {:?}: {}", name, e)))?;
            headers.insert(name, value);
        }

        let provider = Self {
            endpoints: Arc::new(RwLock::new(endpoints)),
            headers,
            discovery_url,
            cancel: CancellationToken::new(),
        };

        if !provider.discovery_url.is_empty() {
            let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
                AuthError::CreateComponent(format!("discovery needs a tokio runtime: {}", e))
            })?;
            runtime.spawn(run_discovery(
                provider.endpoints.clone(),
                http,
                provider.discovery_url.clone(),
                provider.cancel.clone(),
            ));
        }

        Ok(provider)
    }

    pub fn endpoints(&self) -> Endpoints {
        match self.endpoints.read() {
            Ok(e) => e.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn issuer(&self) -> String {
        self.endpoints().issuer
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Stops the discovery task.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn fetch_discovery(http: &Client, url: &str) -> Result<DiscoveryDocument, AuthError> {
    let response = http
        .get(url)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
        .map_err(|e| AuthError::RoundTrip(e.to_string()))?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
        let body = response.text().await.unwrap_or_default();
        return Err(AuthError::InvalidResponse(format!("status {}: {}", status, body)));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| AuthError::ReadBody(e.to_string()))?;
    serde_json::from_slice(&body).map_err(|e| AuthError::Unmarshal(e.to_string()))
}

/// Polls the discovery endpoint until one round succeeds or the provider is closed.
async fn run_discovery(
    endpoints: Arc<RwLock<Endpoints>>,
    http: Client,
    url: String,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(DISCOVERY_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => {
                tracing::debug!("oidc discovery for {} cancelled", url);
                return;
            }
        }

        let doc = tokio::select! {
            doc = fetch_discovery(&http, &url) => doc,
            _ = cancel.cancelled() => return,
        };

        match doc {
            Ok(doc) => {
                let changed = match endpoints.write() {
                    Ok(mut e) => e.merge(doc),
                    Err(poisoned) => poisoned.into_inner().merge(doc),
                };
                tracing::info!("oidc discovery from {} set {} endpoint(s)", url, changed);
                return;
            }
            Err(e) => {
                tracing::warn!(
                    "oidc discovery from {} failed, retrying in {}s: {}",
                    url,
                    DISCOVERY_INTERVAL.as_secs(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_join_endpoint() {
        assert_eq!(
            join_endpoint("https://idp.example/realms/x", "/protocol/token").unwrap(),
            "https://idp.example/realms/x/protocol/token"
        );
        assert_eq!(
            join_endpoint("https://idp.example/", "token").unwrap(),
            "https://idp.example/token"
        );
        assert_eq!(
            join_endpoint("https://idp.example", "https://other.example/token").unwrap(),
            "https://other.example/token"
        );
        assert_eq!(join_endpoint("https://idp.example", "").unwrap(), "");
        assert!(join_endpoint("not a url", "/token").is_err());
    }

    #[test]
    fn test_new_aggregates_join_errors() {
        let spec = ProviderSpec {
            base_url: "::bad::".into(),
            token_endpoint: "/token".into(),
            introspect_endpoint: "/introspect".into(),
            ..Default::default()
        };
        let err = Provider::new(&spec, Client::new()).unwrap_err();
        match err {
            AuthError::CreateComponent(msg) => assert_eq!(msg.matches("base_url").count(), 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_merge_only_fills_empty_fields() {
        let mut e = Endpoints {
            issuer: "https://configured".into(),
            ..Default::default()
        };
        let changed = e.merge(DiscoveryDocument {
            issuer: "https://discovered".into(),
            token_endpoint: "https://discovered/token".into(),
            ..Default::default()
        });
        assert_eq!(changed, 1);
        assert_eq!(e.issuer, "https://configured");
        assert_eq!(e.token, "https://discovered/token");

        // a later round never replaces what is already set
        let changed = e.merge(DiscoveryDocument {
            token_endpoint: "https://elsewhere/token".into(),
            ..Default::default()
        });
        assert_eq!(changed, 0);
        assert_eq!(e.token, "https://discovered/token");
    }

    #[tokio::test]
    async fn test_discovery_fills_endpoints() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "issuer": server.uri(),
                "authorization_endpoint": format!("{}/authorize", server.uri()),
                "token_endpoint": format!("{}/token", server.uri()),
                "jwks_uri": format!("{}/jwks", server.uri()),
            })))
            .mount(&server)
            .await;

        let spec = ProviderSpec {
            base_url: server.uri(),
            discovery_endpoint: "/.well-known/openid-configuration".into(),
            token_endpoint: "https://configured.example/token".into(),
            ..Default::default()
        };
        let provider = Provider::new(&spec, Client::new()).unwrap();

        let mut endpoints = provider.endpoints();
        for _ in 0..50 {
            if !endpoints.issuer.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            endpoints = provider.endpoints();
        }

        assert_eq!(endpoints.issuer, server.uri());
        assert_eq!(endpoints.authorization, format!("{}/authorize", server.uri()));
        assert_eq!(endpoints.token, "https://configured.example/token");
        provider.close();
    }

    #[test]
    fn test_discovery_requires_runtime() {
        let spec = ProviderSpec {
            discovery_endpoint: "https://idp.example/.well-known/openid-configuration".into(),
            ..Default::default()
        };
        assert!(Provider::new(&spec, Client::new()).is_err());
    }
}
