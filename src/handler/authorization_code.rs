//! Browser login with the authorization code grant (OIDC, PKCE, FAPI).

use super::{AuthResult, Authenticator, BaseHandler, redirect};
use crate::client::{Params, params_from_map};
use crate::config::AuthorizationCodeSpec;
use crate::context::{OAuthContext, OAuthTokens, ValidationOption};
use crate::csrf::{CsrfStateGenerator, CsrfStates};
use crate::error::{AuthError, HttpError};
use crate::session::{
    AUTHZ_CODE_CALLBACK_SESSION_KEY, AUTHZ_CODE_REDIRECT_SESSION_KEY,
    AUTHZ_CODE_REQUEST_SESSION_KEY, AUTHZ_CODE_SESSION_KEY, CSRF_SESSION_KEY, Session,
    SessionHandle, extract_json, persist_json, take_json,
};
use async_trait::async_trait;
use axum::{
    body::{Body, to_bytes},
    extract::Request,
    http::{HeaderName, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const DEFAULT_REDIRECT_KEY: &str = "rd";
const DEFAULT_REDIRECT_PATTERN: &str = "^$";

/// Largest request body kept in the session for `restore_request`.
const MAX_SAVED_BODY: usize = 1024 * 1024;

/// A request parked in the session while the user logs in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SavedRequest {
    method: String,
    uri: String,
    headers: Vec<(String, String)>,
    /// base64 of the body bytes
    body: String,
}

impl SavedRequest {
    async fn capture(req: Request) -> Result<Self, HttpError> {
        let (parts, body) = req.into_parts();
        let bytes = to_bytes(body, MAX_SAVED_BODY)
            .await
            .map_err(|e| HttpError::internal(AuthError::ReadBody(e.to_string())))?;
        Ok(Self {
            method: parts.method.to_string(),
            uri: parts.uri.to_string(),
            headers: parts
                .headers
                .iter()
                .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
                .collect(),
            body: STANDARD.encode(&bytes),
        })
    }

    /// Rebuilds the request, keeping the extensions of `current`.
    fn restore(self, current: Request) -> Result<Request, HttpError> {
        let invalid = |what: &str, e: String| {
            HttpError::internal(AuthError::Session {
                operation: "restore",
                reason: format!("saved {}: {}", what, e),
            })
        };
        let body = STANDARD
            .decode(&self.body)
            .map_err(|e| invalid("body", e.to_string()))?;
        let method = Method::from_bytes(self.method.as_bytes())
            .map_err(|e| invalid("method", e.to_string()))?;

        let (parts, _) = current.into_parts();
        let mut restored = Request::builder()
            .method(method)
            .uri(self.uri.as_str())
            .body(Body::from(body))
            .map_err(|e| invalid("uri", e.to_string()))?;
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                restored.headers_mut().append(name, value);
            }
        }
        *restored.extensions_mut() = parts.extensions;
        Ok(restored)
    }
}

pub struct AuthorizationCodeHandler {
    base: Arc<BaseHandler>,
    login_path: String,
    callback_url: String,
    callback_path: String,
    redirect_path: String,
    redirect_key: String,
    redirect_pattern: Regex,
    redirect_to_login: bool,
    unauthorize_any: bool,
    restore_request: bool,
    csrf: CsrfStateGenerator,
    url_params: Params,
    fapi_enabled: bool,
    logout_path: String,
    logout_redirect: String,
    max_age: i64,
}

fn path_of(url: &str) -> Result<String, AuthError> {
    if url.starts_with('/') {
        return Ok(url.split('?').next().unwrap_or(url).to_string());
    }
    url::Url::parse(url)
        .map(|u| u.path().to_string())
        .map_err(|e| AuthError::CreateComponent(format!("callback url {:?}: {}", url, e)))
}

fn query_value(req: &Request, key: &str) -> String {
    req.uri()
        .query()
        .and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.into_owned())
        })
        .unwrap_or_default()
}

fn session_of(req: &Request) -> Option<SessionHandle> {
    req.extensions().get::<SessionHandle>().cloned()
}

fn extract_string(session: &dyn Session, key: &str) -> Result<String, AuthError> {
    Ok(session
        .extract(key)?
        .map(|raw| String::from_utf8_lossy(&raw).into_owned())
        .unwrap_or_default())
}

impl AuthorizationCodeHandler {
    pub fn new(spec: &AuthorizationCodeSpec, base: Arc<BaseHandler>) -> Result<Self, AuthError> {
        if spec.callback_url.is_empty() {
            return Err(AuthError::CreateComponent(
                "authorization code handler needs a callback url".into(),
            ));
        }
        let pattern = if spec.redirect_path_pattern.is_empty() {
            DEFAULT_REDIRECT_PATTERN
        } else {
            spec.redirect_path_pattern.as_str()
        };
        let redirect_pattern = Regex::new(pattern).map_err(|e| {
            AuthError::CreateComponent(format!("redirect path pattern {:?}: {}", pattern, e))
        })?;

        Ok(Self {
            base,
            login_path: spec.login_path.clone(),
            callback_path: path_of(&spec.callback_url)?,
            callback_url: spec.callback_url.clone(),
            redirect_path: spec.redirect_path.clone(),
            redirect_key: if spec.redirect_key.is_empty() {
                DEFAULT_REDIRECT_KEY.to_string()
            } else {
                spec.redirect_key.clone()
            },
            redirect_pattern,
            redirect_to_login: spec.redirect_to_login,
            unauthorize_any: spec.unauthorize_any,
            restore_request: spec.restore_request,
            csrf: CsrfStateGenerator {
                disable_state: spec.disable_state,
                disable_nonce: spec.disable_nonce,
                disable_pkce: spec.disable_pkce,
                pkce_method: spec.pkce_method,
            },
            url_params: params_from_map(&spec.url_params),
            fapi_enabled: spec.fapi_enabled,
            logout_path: spec.logout_path.clone(),
            logout_redirect: if spec.logout_redirect.is_empty() {
                "/".to_string()
            } else {
                spec.logout_redirect.clone()
            },
            max_age: spec.max_age,
        })
    }

    fn after_login_target(&self) -> &str {
        if self.redirect_path.is_empty() {
            "/"
        } else {
            &self.redirect_path
        }
    }

    /// Authorization request parameters that do not depend on the user.
    fn base_params(&self, ctx: &OAuthContext) -> Params {
        let mut params = vec![
            ("response_type".to_string(), "code".to_string()),
            ("client_id".to_string(), ctx.client().id.clone()),
        ];
        if !ctx.client().scope.is_empty() {
            params.push(("scope".to_string(), ctx.client().scope.clone()));
        }
        params.push(("redirect_uri".to_string(), self.callback_url.clone()));
        params.extend(self.url_params.iter().cloned());
        if let Some(jarm) = ctx.jarm() {
            params.push(("response_mode".to_string(), jarm.mode().as_str().to_string()));
        }
        params
    }

    /// Session tokens from an earlier login. `Ok(None)` means start a new login.
    async fn resume(
        &self,
        req: Request,
        session: &SessionHandle,
    ) -> Result<Result<AuthResult, Request>, HttpError> {
        let Some(mut tokens) = extract_json::<OAuthTokens>(&**session, AUTHZ_CODE_SESSION_KEY)?
        else {
            return Ok(Err(req));
        };
        let Some(ctx) = self.base.context_by_name(&tokens.context) else {
            tracing::debug!("session names unknown oauth context {:?}", tokens.context);
            session.delete(AUTHZ_CODE_SESSION_KEY);
            return Ok(Err(req));
        };

        if let Err(e) = ctx.validate_tokens(&mut tokens, &[]).await {
            session.delete(AUTHZ_CODE_SESSION_KEY);
            if !e.is_reauth() {
                return Err(e);
            }
            tracing::debug!("session tokens need re-authentication");
            return Ok(Err(req));
        }

        if tokens.updated {
            persist_json(&**session, AUTHZ_CODE_SESSION_KEY, &tokens)?;
        }
        let path = req.uri().path();
        if path == self.login_path || path == self.callback_path {
            return Ok(Ok(AuthResult::Respond(redirect(self.after_login_target()))));
        }
        let mut req = req;
        ctx.attach(&mut req, &tokens);
        Ok(Ok(AuthResult::Succeeded(req)))
    }

    fn serve_request_object(&self, ctx: &OAuthContext) -> Result<AuthResult, HttpError> {
        let Some(generator) = ctx.request_object() else {
            return Err(HttpError::internal(AuthError::CreateRequest(
                "request object not configured".into(),
            )));
        };
        let signed = generator.generate(&self.base_params(ctx), &[])?;
        let mut response = (StatusCode::OK, signed).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/jwt"),
        );
        Ok(AuthResult::Respond(response))
    }

    fn choose_redirect(&self, req: &Request) -> String {
        let requested = query_value(req, &self.redirect_key);
        if !requested.is_empty() {
            if self.redirect_pattern.is_match(&requested) {
                return requested;
            }
            tracing::debug!("redirect target {:?} not allowed", requested);
        }
        if !self.redirect_path.is_empty() {
            return self.redirect_path.clone();
        }
        if req.uri().path() != self.login_path
            && let Some(pq) = req.uri().path_and_query()
        {
            return pq.as_str().to_string();
        }
        "/".to_string()
    }

    async fn login(
        &self,
        req: Request,
        session: &SessionHandle,
        ctx: &OAuthContext,
    ) -> Result<AuthResult, HttpError> {
        if self.fapi_enabled {
            session.persist(
                AUTHZ_CODE_CALLBACK_SESSION_KEY,
                self.callback_path.as_bytes().to_vec(),
            )?;
        }

        let target = self.choose_redirect(&req);
        if req.uri().path() != self.login_path {
            if self.redirect_to_login && !self.login_path.is_empty() {
                return Ok(AuthResult::Respond(redirect(&self.login_path)));
            }
            if self.unauthorize_any {
                return Err(HttpError::unauthorized(AuthError::InvalidCredential(
                    "login required".into(),
                )));
            }
            if self.restore_request {
                let saved = SavedRequest::capture(req).await?;
                persist_json(&**session, AUTHZ_CODE_REQUEST_SESSION_KEY, &saved)?;
            }
        }
        session.persist(AUTHZ_CODE_REDIRECT_SESSION_KEY, target.into_bytes())?;

        let states = self.csrf.generate();
        persist_json(&**session, CSRF_SESSION_KEY, &states)?;

        let endpoint = ctx.provider().endpoints().authorization;
        let mut location = url::Url::parse(&endpoint).map_err(|e| {
            HttpError::internal(AuthError::CreateRequest(format!(
                "authorization endpoint {:?}: {}",
                endpoint, e
            )))
        })?;

        let mut params = self.base_params(ctx);
        let mut user_params = Params::new();
        states.set(&mut user_params);
        if let Some(generator) = ctx.request_object() {
            let signed = generator.generate(&params, &user_params)?;
            if generator.uses_request_uri() {
                user_params.push(("request_uri".to_string(), generator.request_uri(&signed)));
            } else {
                user_params.push(("request".to_string(), signed));
            }
        }
        params.extend(user_params);
        location.query_pairs_mut().extend_pairs(params.iter());

        tracing::info!("redirecting to authorization endpoint of context {}", ctx.name());
        Ok(AuthResult::Respond(redirect(location.as_str())))
    }

    async fn callback(
        &self,
        req: Request,
        session: &SessionHandle,
        ctx: &OAuthContext,
    ) -> Result<AuthResult, HttpError> {
        if self.fapi_enabled {
            let saved = extract_string(&**session, AUTHZ_CODE_CALLBACK_SESSION_KEY)?;
            session.delete(AUTHZ_CODE_CALLBACK_SESSION_KEY);
            if saved != req.uri().path() {
                tracing::debug!("callback path {:?} was not the one saved at login", req.uri().path());
                return Err(HttpError::unauthorized(AuthError::InvalidParameters(
                    "unexpected callback path".into(),
                )));
            }
        }

        let (req, code, state) = match ctx.jarm() {
            Some(jarm) => jarm.validate(req, self.csrf.disable_state).await?,
            None => {
                let code = query_value(&req, "code");
                let state = query_value(&req, "state");
                (req, code, state)
            }
        };

        let states: CsrfStates = take_json(&**session, CSRF_SESSION_KEY)?.unwrap_or_default();
        if !self.csrf.disable_state
            && (states.state.is_empty() || !crate::context::constant_time_eq(&state, &states.state))
        {
            tracing::debug!("state does not match the one saved at login");
            return Err(HttpError::unauthorized(AuthError::InvalidParameters(
                "state mismatch".into(),
            )));
        }
        if code.is_empty() {
            return Err(HttpError::unauthorized(AuthError::InvalidParameters(
                "code missing".into(),
            )));
        }

        let mut params = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code),
            ("redirect_uri".to_string(), self.callback_url.clone()),
        ];
        if !states.verifier.is_empty() {
            params.push(("code_verifier".to_string(), states.verifier.clone()));
        }

        let mut tokens = ctx.exchange(&params).await?;
        ctx.validate_tokens(
            &mut tokens,
            &[
                ValidationOption::MaxAge(self.max_age),
                ValidationOption::Nonce(states.nonce.clone()),
            ],
        )
        .await?;
        if ctx.userinfo_check() {
            ctx.check_userinfo(&tokens).await?;
        }
        persist_json(&**session, AUTHZ_CODE_SESSION_KEY, &tokens)?;
        tracing::info!("login completed for context {}", ctx.name());

        if self.restore_request
            && let Some(saved) =
                take_json::<SavedRequest>(&**session, AUTHZ_CODE_REQUEST_SESSION_KEY)?
        {
            session.delete(AUTHZ_CODE_REDIRECT_SESSION_KEY);
            let mut restored = saved.restore(req)?;
            ctx.attach(&mut restored, &tokens);
            return Ok(AuthResult::Succeeded(restored));
        }

        let mut target = extract_string(&**session, AUTHZ_CODE_REDIRECT_SESSION_KEY)?;
        session.delete(AUTHZ_CODE_REDIRECT_SESSION_KEY);
        if target.is_empty() {
            target = self.after_login_target().to_string();
        }
        Ok(AuthResult::Respond(redirect(&target)))
    }

    /// Revokes what the provider allows (best effort), forgets the tokens and
    /// redirects to the post-logout page.
    async fn logout(&self, session: &SessionHandle) -> Result<AuthResult, HttpError> {
        if let Some(tokens) = extract_json::<OAuthTokens>(&**session, AUTHZ_CODE_SESSION_KEY)?
            && let Some(ctx) = self.base.context_by_name(&tokens.context)
            && ctx.revoker().enabled()
        {
            let (token, hint) = if tokens.rt.is_empty() {
                (&tokens.at, "access_token")
            } else {
                (&tokens.rt, "refresh_token")
            };
            if !token.is_empty()
                && let Err(e) = ctx.revoker().revoke(token, hint).await
            {
                tracing::warn!("token revocation failed: {}", e);
            }
        }
        session.delete(AUTHZ_CODE_SESSION_KEY);
        tracing::info!("session logged out");
        Ok(AuthResult::Respond(redirect(&self.logout_redirect)))
    }
}

#[async_trait]
impl Authenticator for AuthorizationCodeHandler {
    async fn serve_authn(&self, req: Request) -> Result<AuthResult, HttpError> {
        let Some(session) = session_of(&req) else {
            return Ok(AuthResult::Continue(req));
        };

        if !self.logout_path.is_empty() && req.uri().path() == self.logout_path {
            return self.logout(&session).await;
        }

        let req = match self.resume(req, &session).await? {
            Ok(done) => return Ok(done),
            Err(req) => req,
        };

        let ctx = match self.base.resolve_context(&req) {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::debug!("authorization code handler skipped: {}", e);
                return Ok(AuthResult::Continue(req));
            }
        };

        if let Some(path) = ctx.request_object().and_then(|g| g.request_uri_path())
            && req.uri().path() == path
        {
            return self.serve_request_object(&ctx);
        }

        if req.uri().path() != self.callback_path {
            self.login(req, &session, &ctx).await
        } else {
            self.callback(req, &session, &ctx).await
        }
    }
}
