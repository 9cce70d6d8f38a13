use crate::client::OAuthClient;
use crate::config::RequestObjectSpec;
use crate::error::AuthError;
use crate::jwt::{Claims, now_unix};
use crate::provider::Provider;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Builds signed authorization request objects (RFC 9101) for FAPI flows.
pub struct RequestObjectGenerator {
    client: Arc<OAuthClient>,
    provider: Arc<Provider>,
    request_uri: String,
    enable_cache: bool,
    nbf_secs: i64,
    exp_secs: i64,
}

impl RequestObjectGenerator {
    pub fn new(
        spec: &RequestObjectSpec,
        client: Arc<OAuthClient>,
        provider: Arc<Provider>,
    ) -> Result<Self, AuthError> {
        if !client.jwt.as_ref().is_some_and(|j| j.can_sign()) {
            return Err(AuthError::CreateComponent(
                "request objects need a client signing key".into(),
            ));
        }
        if !spec.request_uri.is_empty() {
            url::Url::parse(&spec.request_uri).map_err(|e| {
                AuthError::CreateComponent(format!("request_uri {:?}: {}", spec.request_uri, e))
            })?;
        }
        Ok(Self {
            client,
            provider,
            request_uri: spec.request_uri.clone(),
            enable_cache: spec.enable_cache,
            nbf_secs: spec.nbf_secs,
            exp_secs: spec.exp_secs,
        })
    }

    /// Signs `base` and `optional` parameters into a request object.
    /// Repeated parameters are joined with a space.
    pub fn generate(
        &self,
        base: &[(String, String)],
        optional: &[(String, String)],
    ) -> Result<String, AuthError> {
        let now = now_unix();
        let mut claims = Claims::new();
        claims.insert("iss".into(), Value::from(self.client.id.clone()));
        claims.insert("aud".into(), Value::from(vec![self.provider.issuer()]));
        claims.insert("exp".into(), Value::from(now + self.nbf_secs + self.exp_secs));
        claims.insert("nbf".into(), Value::from(now + self.nbf_secs));
        claims.insert("scope".into(), Value::from(self.client.scope.clone()));

        let mut overlay: Vec<(String, String)> = Vec::new();
        for (key, value) in base.iter().chain(optional.iter()) {
            match overlay.iter_mut().find(|(k, _)| k == key) {
                Some((_, joined)) => {
                    joined.push(' ');
                    joined.push_str(value);
                }
                None => overlay.push((key.clone(), value.clone())),
            }
        }
        for (key, value) in overlay {
            claims.insert(key, Value::from(value));
        }

        let jwt = self.client.jwt.as_ref().ok_or_else(|| {
            AuthError::CreateRequest("request objects need a client signing key".into())
        })?;
        jwt.sign(&claims)
    }

    pub fn uses_request_uri(&self) -> bool {
        !self.request_uri.is_empty()
    }

    /// Path under which this gateway serves the request object, if any.
    pub fn request_uri_path(&self) -> Option<String> {
        url::Url::parse(&self.request_uri)
            .ok()
            .map(|u| u.path().to_string())
    }

    /// The `request_uri` to send. Without caching a hash fragment of the
    /// object is appended so the authorization server refetches it.
    pub fn request_uri(&self, signed: &str) -> String {
        if self.enable_cache {
            return self.request_uri.clone();
        }
        format!(
            "{}#{}",
            self.request_uri,
            URL_SAFE_NO_PAD.encode(Sha256::digest(signed.as_bytes()))
        )
    }
}
