use crate::client::{ClientRequester, RawResponse, is_json};
use crate::error::{AuthError, HttpError, classify_status};
use crate::jwt::Claims;
use crate::provider::Provider;
use axum::body::Bytes;
use reqwest::header;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Token endpoint response (RFC 6749 §5.1 plus OIDC `id_token`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenResponse {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id_token: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub access_token: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub refresh_token: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub token_type: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub expires_in: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub refresh_expires_in: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub scope: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_uri: String,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn param(k: &str, v: &str) -> (String, String) {
    (k.to_string(), v.to_string())
}

/// Exchanges grants for tokens at the token endpoint.
pub struct TokenRedeemer {
    provider: Arc<Provider>,
    requester: Arc<ClientRequester>,
}

impl TokenRedeemer {
    pub fn new(provider: Arc<Provider>, requester: Arc<ClientRequester>) -> Self {
        Self {
            provider,
            requester,
        }
    }

    /// POSTs to the token endpoint and hands back the unparsed answer.
    pub async fn redeem_raw(&self, params: &[(String, String)]) -> Result<RawResponse, AuthError> {
        let endpoint = self.provider.endpoints().token;
        self.requester.do_request(&endpoint, params).await
    }

    pub async fn redeem(&self, params: &[(String, String)]) -> Result<TokenResponse, HttpError> {
        let raw = self.redeem_raw(params).await.map_err(HttpError::internal)?;
        parse_token_response(raw)
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, HttpError> {
        self.redeem(&[
            param("grant_type", "refresh_token"),
            param("refresh_token", refresh_token),
        ])
        .await
    }
}

pub fn parse_token_response(raw: RawResponse) -> Result<TokenResponse, HttpError> {
    if raw.status != 200 {
        tracing::debug!("token endpoint returned {}: {}", raw.status, raw.body_text());
        return Err(classify_status(
            raw.status,
            AuthError::RedeemToken {
                status: raw.status,
                body: raw.body_text(),
            },
        ));
    }
    serde_json::from_slice(&raw.body)
        .map_err(|e| HttpError::internal(AuthError::Unmarshal(e.to_string())))
}

/// Asks the authorization server whether a token is active (RFC 7662).
pub struct Introspector {
    provider: Arc<Provider>,
    requester: Arc<ClientRequester>,
}

impl Introspector {
    pub fn new(provider: Arc<Provider>, requester: Arc<ClientRequester>) -> Self {
        Self {
            provider,
            requester,
        }
    }

    pub async fn introspect(&self, token: &str) -> Result<Claims, HttpError> {
        let endpoint = self.provider.endpoints().introspect;
        let raw = self
            .requester
            .do_request(
                &endpoint,
                &[param("token", token), param("token_type_hint", "access_token")],
            )
            .await
            .map_err(HttpError::internal)?;

        if raw.status != 200 {
            tracing::debug!("introspection returned {}: {}", raw.status, raw.body_text());
            return Err(classify_status(
                raw.status,
                AuthError::Introspection {
                    status: raw.status,
                    body: raw.body_text(),
                },
            ));
        }
        serde_json::from_slice(&raw.body)
            .map_err(|e| HttpError::internal(AuthError::Unmarshal(e.to_string())))
    }
}

/// Revokes tokens (RFC 7009).
pub struct Revoker {
    provider: Arc<Provider>,
    requester: Arc<ClientRequester>,
}

impl Revoker {
    pub fn new(provider: Arc<Provider>, requester: Arc<ClientRequester>) -> Self {
        Self {
            provider,
            requester,
        }
    }

    pub fn enabled(&self) -> bool {
        !self.provider.endpoints().revocation.is_empty()
    }

    pub async fn revoke(&self, token: &str, hint: &str) -> Result<(), HttpError> {
        let endpoint = self.provider.endpoints().revocation;
        let params = [param("token", token), param("token_type_hint", hint)];
        // RFC 7009 answers 200 with an empty body, which is not JSON
        let raw = self
            .requester
            .post(&endpoint, &params)
            .await
            .map_err(HttpError::internal)?;
        if !(200..300).contains(&raw.status) {
            return Err(classify_status(
                raw.status,
                AuthError::Revocation {
                    status: raw.status,
                    body: raw.body_text(),
                },
            ));
        }
        Ok(())
    }
}

/// GETs the userinfo endpoint with `access_token` as bearer credential.
pub async fn fetch_userinfo(
    provider: &Provider,
    requester: &ClientRequester,
    access_token: &str,
) -> Result<Bytes, HttpError> {
    let endpoint = provider.endpoints().userinfo;
    if endpoint.is_empty() {
        return Err(HttpError::internal(AuthError::CreateRequest(
            "userinfo endpoint not configured".into(),
        )));
    }

    let response = requester
        .http()
        .get(&endpoint)
        .headers(requester.headers().clone())
        .bearer_auth(access_token)
        .header(header::ACCEPT, "application/json")
        .send()
        .await
        .map_err(|e| HttpError::internal(AuthError::RoundTrip(e.to_string())))?;

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
        .map_err(|e| HttpError::internal(AuthError::ReadBody(e.to_string())))?;

    if status != 200 {
        return Err(classify_status(
            status,
            AuthError::UserInfo {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            },
        ));
    }
    if !is_json(&content_type) {
        return Err(HttpError::internal(AuthError::InvalidResponse(content_type)));
    }
    Ok(body)
}
