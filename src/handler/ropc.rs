//! Resource owner password credentials grant.

use super::{AuthResult, Authenticator, BaseHandler};
use crate::client::{Params, RawResponse, params_from_map};
use crate::config::RopcSpec;
use crate::context::{OAuthContext, OAuthTokens, grant_params};
use crate::error::{AuthError, HttpError};
use crate::session::{ROPC_SESSION_KEY, SessionHandle, extract_json, persist_json};
use crate::token::{TokenResponse, parse_token_response};
use async_trait::async_trait;
use axum::{
    body::{Body, to_bytes},
    extract::Request,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use std::sync::Arc;

const MAX_FORM_BYTES: usize = 64 * 1024;

struct Credentials {
    username: String,
    password: String,
}

pub struct RopcHandler {
    base: Arc<BaseHandler>,
    redeem_token_path: String,
    username_key: String,
    password_key: String,
    extra_params: Params,
}

fn json_response(status: StatusCode, body: impl Into<Body>) -> Response {
    let mut response = (status, body.into()).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn raw_response(raw: RawResponse) -> Response {
    let status = StatusCode::from_u16(raw.status).unwrap_or(StatusCode::BAD_GATEWAY);
    json_response(status, raw.body)
}

fn basic_credentials(req: &Request) -> Option<Credentials> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some(Credentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

impl RopcHandler {
    pub fn new(spec: &RopcSpec, base: Arc<BaseHandler>) -> Self {
        Self {
            base,
            redeem_token_path: spec.redeem_token_path.clone(),
            username_key: spec.username_key.clone(),
            password_key: spec.password_key.clone(),
            extra_params: params_from_map(&spec.extra_params),
        }
    }

    pub fn redeem_token_path(&self) -> &str {
        &self.redeem_token_path
    }

    /// Reads credentials from the form body (which is put back for downstream)
    /// or from HTTP Basic.
    async fn credentials(&self, req: Request) -> Result<(Request, Credentials), HttpError> {
        let (req, creds) = if !self.username_key.is_empty() && !self.password_key.is_empty() {
            let (parts, body) = req.into_parts();
            let bytes = to_bytes(body, MAX_FORM_BYTES)
                .await
                .map_err(|e| HttpError::internal(AuthError::ReadBody(e.to_string())))?;
            let mut creds = Credentials {
                username: String::new(),
                password: String::new(),
            };
            for (k, v) in url::form_urlencoded::parse(&bytes) {
                if k == self.username_key.as_str() {
                    creds.username = v.into_owned();
                } else if k == self.password_key.as_str() {
                    creds.password = v.into_owned();
                }
            }
            (Request::from_parts(parts, Body::from(bytes)), creds)
        } else {
            let creds = basic_credentials(&req).unwrap_or(Credentials {
                username: String::new(),
                password: String::new(),
            });
            (req, creds)
        };

        if creds.username.is_empty() && creds.password.is_empty() {
            return Err(HttpError::unauthorized(AuthError::InvalidCredential(
                "username and password missing".into(),
            )));
        }
        Ok((req, creds))
    }

    async fn exchange(&self, ctx: &OAuthContext, creds: &Credentials) -> Result<RawResponse, HttpError> {
        let params = grant_params(
            &[
                ("grant_type", "password"),
                ("username", creds.username.as_str()),
                ("password", creds.password.as_str()),
                ("scope", ctx.client().scope.as_str()),
            ],
            &self.extra_params,
        );
        ctx.redeemer()
            .redeem_raw(&params)
            .await
            .map_err(HttpError::internal)
    }

    /// Endpoint form: trades the caller's credentials for tokens and answers
    /// with whatever the token endpoint said.
    pub async fn serve_http(&self, req: Request) -> Response {
        let result = async {
            let ctx = self.base.resolve_context(&req)?;
            let (_, creds) = self.credentials(req).await?;
            self.exchange(&ctx, &creds).await
        }
        .await;
        match result {
            Ok(raw) => raw_response(raw),
            Err(e) => e.into_response(),
        }
    }

    async fn resume(
        &self,
        req: Request,
        session: &SessionHandle,
    ) -> Result<Result<AuthResult, Request>, HttpError> {
        let Some(mut tokens) = extract_json::<OAuthTokens>(&**session, ROPC_SESSION_KEY)? else {
            return Ok(Err(req));
        };
        let Some(ctx) = self.base.context_by_name(&tokens.context) else {
            session.delete(ROPC_SESSION_KEY);
            return Ok(Err(req));
        };

        if let Err(e) = ctx.validate_tokens(&mut tokens, &[]).await {
            session.delete(ROPC_SESSION_KEY);
            if !e.is_reauth() {
                return Err(e);
            }
            return Ok(Err(req));
        }
        if tokens.updated {
            persist_json(&**session, ROPC_SESSION_KEY, &tokens)?;
        }

        if req.uri().path() == self.redeem_token_path {
            let view = TokenResponse {
                access_token: tokens.at.clone(),
                id_token: tokens.idt.clone(),
                refresh_token: tokens.rt.clone(),
                token_type: "Bearer".to_string(),
                ..Default::default()
            };
            let body = serde_json::to_vec(&view)
                .map_err(|e| HttpError::internal(AuthError::Unmarshal(e.to_string())))?;
            return Ok(Ok(AuthResult::Respond(json_response(StatusCode::OK, body))));
        }
        let mut req = req;
        ctx.attach(&mut req, &tokens);
        Ok(Ok(AuthResult::Succeeded(req)))
    }
}

#[async_trait]
impl Authenticator for RopcHandler {
    async fn serve_authn(&self, req: Request) -> Result<AuthResult, HttpError> {
        let session = req.extensions().get::<SessionHandle>().cloned();
        let req = match &session {
            Some(session) => match self.resume(req, session).await? {
                Ok(done) => return Ok(done),
                Err(req) => req,
            },
            None => req,
        };

        let ctx = match self.base.resolve_context(&req) {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::debug!("ropc handler skipped: {}", e);
                return Ok(AuthResult::Continue(req));
            }
        };

        let (mut req, creds) = self.credentials(req).await?;
        let raw = self.exchange(&ctx, &creds).await?;
        let resp = parse_token_response(raw.clone())?;
        let mut tokens = OAuthTokens::from_response(ctx.name(), &resp);
        ctx.validate_tokens(&mut tokens, &[]).await?;
        if let Some(session) = &session {
            persist_json(&**session, ROPC_SESSION_KEY, &tokens)?;
        }
        tracing::info!("password grant succeeded for context {}", ctx.name());

        // the caller asked for the tokens themselves
        if req.uri().path() == self.redeem_token_path {
            return Ok(AuthResult::Respond(raw_response(raw)));
        }
        ctx.attach(&mut req, &tokens);
        Ok(AuthResult::Succeeded(req))
    }
}
