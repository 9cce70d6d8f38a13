//! Bearer token protection for APIs, with the FAPI resource server rules.

use super::{AuthResult, Authenticator, BaseHandler, ResponseHeaders};
use crate::config::ResourceServerSpec;
use crate::context::{OAuthTokens, PeerCertificates, validate_cert};
use crate::error::{AuthError, HttpError};
use async_trait::async_trait;
use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue, header},
};
use std::sync::Arc;
use uuid::Uuid;

pub const FAPI_INTERACTION_ID: &str = "x-fapi-interaction-id";

pub struct ResourceServerHandler {
    base: Arc<BaseHandler>,
    header_key: HeaderName,
    fapi_enabled: bool,
}

/// `Date` header value in IMF-fixdate form.
fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

impl ResourceServerHandler {
    pub fn new(spec: &ResourceServerSpec, base: Arc<BaseHandler>) -> Result<Self, AuthError> {
        let header_key = if spec.header_key.is_empty() {
            header::AUTHORIZATION
        } else {
            HeaderName::from_bytes(spec.header_key.as_bytes()).map_err(|e| {
                AuthError::CreateComponent(format!("header key {:?}: {}", spec.header_key, e))
            })?
        };
        Ok(Self {
            base,
            header_key,
            fapi_enabled: spec.fapi_enabled,
        })
    }

    fn bearer(&self, req: &Request) -> String {
        let raw = req
            .headers()
            .get(&self.header_key)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        raw.strip_prefix("Bearer ").unwrap_or(raw).to_string()
    }

    /// Certificate binding plus the interaction id and date headers.
    fn apply_fapi(&self, req: &mut Request, tokens: &OAuthTokens) -> Result<(), HttpError> {
        let cnf = tokens
            .at_claims
            .as_ref()
            .and_then(|c| c.get("cnf"))
            .ok_or_else(|| {
                HttpError::unauthorized(AuthError::CertificateMismatch(
                    "access token has no cnf claim".into(),
                ))
                .with_bearer_challenge()
            })?;
        validate_cert(cnf, req.extensions().get::<PeerCertificates>()).map_err(|e| {
            tracing::debug!("certificate binding failed: {}", e);
            HttpError::unauthorized(e).with_bearer_challenge()
        })?;

        let interaction_id = req
            .headers()
            .get(FAPI_INTERACTION_ID)
            .cloned()
            .or_else(|| HeaderValue::from_str(&Uuid::new_v4().to_string()).ok());

        let mut extra = req
            .extensions_mut()
            .remove::<ResponseHeaders>()
            .unwrap_or_default();
        if let Some(id) = interaction_id {
            req.headers_mut()
                .insert(HeaderName::from_static(FAPI_INTERACTION_ID), id.clone());
            extra
                .0
                .insert(HeaderName::from_static(FAPI_INTERACTION_ID), id);
        }
        if let Ok(date) = HeaderValue::from_str(&http_date()) {
            extra.0.insert(header::DATE, date);
        }
        req.extensions_mut().insert(extra);
        Ok(())
    }
}

#[async_trait]
impl Authenticator for ResourceServerHandler {
    async fn serve_authn(&self, mut req: Request) -> Result<AuthResult, HttpError> {
        let token = self.bearer(&req);
        if token.is_empty() {
            return Ok(AuthResult::Continue(req));
        }

        let ctx = self.base.resolve_context(&req)?;
        let mut tokens = OAuthTokens {
            context: ctx.name().to_string(),
            at: token,
            ..Default::default()
        };
        if let Err(e) = ctx.validate_tokens(&mut tokens, &[]).await {
            if e.status.is_server_error() {
                return Err(e);
            }
            tracing::debug!("bearer token refused: {}", e);
            return Err(HttpError::unauthorized(e.source).with_bearer_challenge());
        }

        if self.fapi_enabled {
            self.apply_fapi(&mut req, &tokens)?;
        }
        ctx.attach(&mut req, &tokens);
        Ok(AuthResult::Succeeded(req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwt::now_unix;
    use crate::testutil;
    use axum::body::Body;
    use axum::http::StatusCode;
    use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
    use serde_json::json;
    use sha2::{Digest, Sha256};

    fn handler(fapi_enabled: bool) -> ResourceServerHandler {
        let base = BaseHandler::new(
            vec![testutil::context(None, |s| s.claims_key = "oauth".into())],
            "",
            "",
        )
        .unwrap();
        ResourceServerHandler::new(
            &ResourceServerSpec {
                fapi_enabled,
                ..Default::default()
            },
            Arc::new(base),
        )
        .unwrap()
    }

    fn req(token: &str) -> Request {
        Request::builder()
            .uri("/api")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_missing_token_continues() {
        let h = handler(false);
        let req = Request::builder().uri("/api").body(Body::empty()).unwrap();
        assert!(matches!(
            h.serve_authn(req).await.unwrap(),
            AuthResult::Continue(_)
        ));
    }

    #[tokio::test]
    async fn test_valid_bearer() {
        let h = handler(false);
        let AuthResult::Succeeded(req) = h
            .serve_authn(req(&testutil::access_token(now_unix() + 600)))
            .await
            .unwrap()
        else {
            panic!("expected success");
        };
        let stash = req.extensions().get::<crate::context::TokenClaims>().unwrap();
        assert_eq!(stash.get("oauth").unwrap().at_claims.as_ref().unwrap()["sub"], "alice");
    }

    #[tokio::test]
    async fn test_expired_bearer_challenged() {
        let h = handler(false);
        let err = h
            .serve_authn(req(&testutil::access_token(now_unix() - 60)))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert_eq!(
            err.headers[header::WWW_AUTHENTICATE],
            crate::error::BEARER_INVALID_TOKEN
        );
    }

    #[tokio::test]
    async fn test_prefix_stripped_once_without_trimming() {
        let h = handler(false);
        let token = testutil::access_token(now_unix() + 600);

        let padded = Request::builder()
            .uri("/api")
            .header(header::AUTHORIZATION, format!("Bearer  {}", token))
            .body(Body::empty())
            .unwrap();
        let err = h.serve_authn(padded).await.unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert!(err.headers.contains_key(header::WWW_AUTHENTICATE));

        // a bare token without the scheme is taken as is
        let bare = Request::builder()
            .uri("/api")
            .header(header::AUTHORIZATION, token)
            .body(Body::empty())
            .unwrap();
        assert!(matches!(
            h.serve_authn(bare).await.unwrap(),
            AuthResult::Succeeded(_)
        ));
    }

    #[tokio::test]
    async fn test_fapi_certificate_binding() {
        let der = b"client certificate".to_vec();
        let thumbprint = URL_SAFE_NO_PAD.encode(Sha256::digest(&der));
        let token = testutil::mint(json!({
            "iss": testutil::ISSUER,
            "aud": testutil::AUDIENCE,
            "sub": "alice",
            "exp": now_unix() + 600,
            "cnf": {"x5t#S256": thumbprint},
        }));
        let h = handler(true);

        let mut bound = req(&token);
        bound
            .extensions_mut()
            .insert(PeerCertificates(vec![der.clone()]));
        bound
            .headers_mut()
            .insert(FAPI_INTERACTION_ID, HeaderValue::from_static("abc-123"));
        let AuthResult::Succeeded(bound) = h.serve_authn(bound).await.unwrap() else {
            panic!("expected success");
        };
        let extra = bound.extensions().get::<ResponseHeaders>().unwrap();
        assert_eq!(extra.0[FAPI_INTERACTION_ID], "abc-123");
        assert!(extra.0[header::DATE].to_str().unwrap().ends_with(" GMT"));

        let mut fresh = req(&token);
        fresh.extensions_mut().insert(PeerCertificates(vec![der]));
        let AuthResult::Succeeded(fresh) = h.serve_authn(fresh).await.unwrap() else {
            panic!("expected success");
        };
        let id = fresh.extensions().get::<ResponseHeaders>().unwrap().0[FAPI_INTERACTION_ID]
            .to_str()
            .unwrap()
            .to_string();
        assert_eq!(Uuid::parse_str(&id).unwrap().get_version_num(), 4);

        let err = h.serve_authn(req(&token)).await.unwrap_err();
        assert!(matches!(err.source, AuthError::CertificateMismatch(_)));

        let unbound = testutil::access_token(now_unix() + 600);
        let err = h.serve_authn(req(&unbound)).await.unwrap_err();
        assert!(matches!(err.source, AuthError::CertificateMismatch(_)));
    }

    #[test]
    fn test_http_date_shape() {
        let date = http_date();
        assert_eq!(date.len(), 29);
        assert!(date.ends_with(" GMT"));
    }
}
