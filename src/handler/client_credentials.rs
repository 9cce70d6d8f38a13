//! Client credentials grant: the gateway authenticates itself upstream.

use super::{AuthResult, Authenticator, BaseHandler};
use crate::client::{Params, params_from_map};
use crate::config::ClientCredentialsSpec;
use crate::context::{OAuthContext, OAuthTokens, grant_params};
use crate::error::HttpError;
use async_trait::async_trait;
use axum::extract::Request;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CachedTokens {
    at: String,
    rt: String,
}

pub struct ClientCredentialsHandler {
    base: Arc<BaseHandler>,
    extra_params: Params,
    /// context name -> last tokens obtained for it
    cache: RwLock<HashMap<String, CachedTokens>>,
}

impl ClientCredentialsHandler {
    pub fn new(spec: &ClientCredentialsSpec, base: Arc<BaseHandler>) -> Self {
        Self {
            base,
            extra_params: params_from_map(&spec.extra_params),
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn store(&self, ctx: &OAuthContext, tokens: &OAuthTokens) {
        let mut cache = self.cache.write().await;
        cache.insert(
            ctx.name().to_string(),
            CachedTokens {
                at: tokens.at.clone(),
                rt: tokens.rt.clone(),
            },
        );
    }

    /// Validated tokens for `ctx`, fetching new ones when the cached pair is
    /// missing or can no longer be healed by refresh.
    pub async fn tokens(&self, ctx: &OAuthContext) -> Result<OAuthTokens, HttpError> {
        let snapshot = {
            let cache = self.cache.read().await;
            cache.get(ctx.name()).cloned().unwrap_or_default()
        };
        let mut tokens = OAuthTokens {
            context: ctx.name().to_string(),
            at: snapshot.at.clone(),
            rt: snapshot.rt.clone(),
            ..Default::default()
        };

        match ctx.validate_tokens(&mut tokens, &[]).await {
            Ok(()) => {
                if tokens.at != snapshot.at || tokens.rt != snapshot.rt {
                    self.store(ctx, &tokens).await;
                }
                return Ok(tokens);
            }
            Err(e) if !e.is_reauth() => return Err(e),
            Err(_) => {}
        }

        tracing::debug!("requesting client credentials tokens for context {}", ctx.name());
        let params = grant_params(
            &[
                ("grant_type", "client_credentials"),
                ("scope", ctx.client().scope.as_str()),
            ],
            &self.extra_params,
        );
        let mut tokens = ctx.exchange(&params).await?;
        ctx.validate_tokens(&mut tokens, &[]).await?;
        self.store(ctx, &tokens).await;
        Ok(tokens)
    }
}

#[async_trait]
impl Authenticator for ClientCredentialsHandler {
    async fn serve_authn(&self, mut req: Request) -> Result<AuthResult, HttpError> {
        let ctx = match self.base.resolve_context(&req) {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::debug!("client credentials handler skipped: {}", e);
                return Ok(AuthResult::Continue(req));
            }
        };
        let tokens = self.tokens(&ctx).await?;
        ctx.attach(&mut req, &tokens);
        Ok(AuthResult::Succeeded(req))
    }
}
