//! JWT Secured Authorization Response Mode (JARM).

use crate::config::JarmSpec;
use crate::error::{AuthError, HttpError};
use crate::jwt::{JwtHandler, ParseOptions};
use crate::provider::Provider;
use axum::body::{Body, to_bytes};
use axum::extract::Request;
use std::sync::Arc;

/// Largest form body read when looking for a `form_post.jwt` response.
const MAX_FORM_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    Jwt,
    QueryJwt,
    FormPostJwt,
}

impl ResponseMode {
    pub fn parse(mode: &str) -> Result<Self, AuthError> {
        match mode {
            "jwt" => Ok(Self::Jwt),
            "query.jwt" => Ok(Self::QueryJwt),
            "form_post.jwt" => Ok(Self::FormPostJwt),
            // the fragment never reaches the server
            "fragment.jwt" => Err(AuthError::CreateComponent(
                "response mode fragment.jwt cannot be verified server side".into(),
            )),
            other => Err(AuthError::CreateComponent(format!(
                "unknown jarm response mode {:?}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jwt => "jwt",
            Self::QueryJwt => "query.jwt",
            Self::FormPostJwt => "form_post.jwt",
        }
    }
}

pub struct JarmValidator {
    mode: ResponseMode,
    provider: Arc<Provider>,
    audience: String,
    jwt: Arc<JwtHandler>,
}

fn find_param(encoded: &[u8], key: &str) -> Option<String> {
    url::form_urlencoded::parse(encoded)
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

impl JarmValidator {
    pub fn new(
        spec: &JarmSpec,
        provider: Arc<Provider>,
        audience: String,
        jwt: Arc<JwtHandler>,
    ) -> Result<Self, AuthError> {
        Ok(Self {
            mode: ResponseMode::parse(&spec.response_mode)?,
            provider,
            audience,
            jwt,
        })
    }

    pub fn mode(&self) -> ResponseMode {
        self.mode
    }

    /// Pulls the `response` parameter out of the callback request. For
    /// `form_post.jwt` the body is buffered and put back on the request.
    pub async fn extract_response(&self, req: Request) -> Result<(Request, String), HttpError> {
        match self.mode {
            ResponseMode::Jwt | ResponseMode::QueryJwt => {
                let response = req
                    .uri()
                    .query()
                    .and_then(|q| find_param(q.as_bytes(), "response"))
                    .unwrap_or_default();
                Ok((req, response))
            }
            ResponseMode::FormPostJwt => {
                let (parts, body) = req.into_parts();
                let bytes = to_bytes(body, MAX_FORM_BYTES)
                    .await
                    .map_err(|e| HttpError::internal(AuthError::ReadBody(e.to_string())))?;
                let response = find_param(&bytes, "response").unwrap_or_default();
                Ok((Request::from_parts(parts, Body::from(bytes)), response))
            }
        }
    }

    /// Verifies a JARM response and returns `(code, state)`.
    pub fn validate_response(
        &self,
        response: &str,
        state_disabled: bool,
    ) -> Result<(String, String), HttpError> {
        if response.is_empty() {
            return Err(HttpError::unauthorized(AuthError::InvalidParameters(
                "jarm response missing".into(),
            )));
        }
        let opts = ParseOptions {
            issuer: Some(self.provider.issuer()),
            audience: Some(self.audience.clone()),
            exp_required: true,
            ..Default::default()
        };
        let claims = self.jwt.parse(response, &opts).map_err(|e| {
            tracing::debug!("jarm response rejected: {}", e);
            HttpError::unauthorized(e)
        })?;

        let code = claims
            .get("code")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                HttpError::unauthorized(AuthError::InvalidParameters(
                    "jarm response has no code".into(),
                ))
            })?
            .to_string();

        if state_disabled {
            return Ok((code, String::new()));
        }
        let state = claims
            .get("state")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                HttpError::unauthorized(AuthError::InvalidParameters(
                    "jarm response has no state".into(),
                ))
            })?
            .to_string();
        Ok((code, state))
    }

    pub async fn validate(
        &self,
        req: Request,
        state_disabled: bool,
    ) -> Result<(Request, String, String), HttpError> {
        let (req, response) = self.extract_response(req).await?;
        let (code, state) = self.validate_response(&response, state_disabled)?;
        Ok((req, code, state))
    }
}
