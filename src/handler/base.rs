use crate::config::{GatewayConfig, ValidationFlags};
use crate::context::OAuthContext;
use crate::error::{AuthError, HttpError};
use axum::extract::Request;
use std::collections::HashMap;
use std::sync::Arc;

pub const DEFAULT_CONTEXT: &str = "default";

/// The set of configured OAuth contexts and the rule picking one per request.
pub struct BaseHandler {
    contexts: HashMap<String, Arc<OAuthContext>>,
    context_query_key: String,
    context_header_key: String,
}

impl BaseHandler {
    pub fn new(
        contexts: Vec<OAuthContext>,
        context_query_key: &str,
        context_header_key: &str,
    ) -> Result<Self, AuthError> {
        let mut map = HashMap::new();
        for context in contexts {
            let name = context.name().to_string();
            if map.insert(name.clone(), Arc::new(context)).is_some() {
                return Err(AuthError::CreateComponent(format!(
                    "duplicate oauth context {:?}",
                    name
                )));
            }
        }
        Ok(Self {
            contexts: map,
            context_query_key: context_query_key.to_string(),
            context_header_key: context_header_key.to_string(),
        })
    }

    pub fn from_config(config: &GatewayConfig, flags: ValidationFlags) -> Result<Self, AuthError> {
        let contexts = config
            .contexts
            .iter()
            .map(|spec| OAuthContext::new(spec, flags))
            .collect::<Result<Vec<_>, _>>()?;
        tracing::info!("configured {} oauth context(s)", contexts.len());
        Self::new(
            contexts,
            &config.context_query_key,
            &config.context_header_key,
        )
    }

    fn context_name(&self, req: &Request) -> String {
        let name = if !self.context_query_key.is_empty() {
            req.uri()
                .query()
                .and_then(|q| {
                    url::form_urlencoded::parse(q.as_bytes())
                        .find(|(k, _)| k == self.context_query_key.as_str())
                        .map(|(_, v)| v.into_owned())
                })
                .unwrap_or_default()
        } else if !self.context_header_key.is_empty() {
            req.headers()
                .get(self.context_header_key.as_str())
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        } else {
            String::new()
        };
        if name.is_empty() {
            DEFAULT_CONTEXT.to_string()
        } else {
            name
        }
    }

    pub fn resolve_context(&self, req: &Request) -> Result<Arc<OAuthContext>, HttpError> {
        let name = self.context_name(req);
        self.contexts.get(&name).cloned().ok_or_else(|| {
            tracing::debug!("no oauth context named {:?}", name);
            HttpError::unauthorized(AuthError::ContextNotFound)
        })
    }

    /// Plain lookup, used for tokens that name the context that issued them.
    pub fn context_by_name(&self, name: &str) -> Option<Arc<OAuthContext>> {
        self.contexts.get(name).cloned()
    }
}
