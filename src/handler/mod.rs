//! Authenticators and the middleware that chains them.

pub mod authorization_code;
pub mod base;
pub mod client_credentials;
pub mod resource_server;
pub mod ropc;

pub use base::BaseHandler;

use crate::error::{AuthError, HttpError};
use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

/// What an authenticator decided about a request.
#[derive(Debug)]
pub enum AuthResult {
    /// Not this authenticator's business; hand the request to the next one.
    Continue(Request),
    /// Authenticated. The request (with tokens attached) goes upstream.
    Succeeded(Request),
    /// The authenticator already produced the response: a redirect, a token
    /// view or a served request object. Nothing goes upstream.
    Respond(Response),
}

/// Request extension: headers an authenticator wants on the eventual response.
#[derive(Debug, Clone, Default)]
pub struct ResponseHeaders(pub HeaderMap);

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn serve_authn(&self, req: Request) -> Result<AuthResult, HttpError>;
}

/// Ordered list of authenticators, used as middleware state.
#[derive(Clone)]
pub struct AuthChain {
    authenticators: Arc<Vec<Arc<dyn Authenticator>>>,
}

impl AuthChain {
    pub fn new(authenticators: Vec<Arc<dyn Authenticator>>) -> Self {
        Self {
            authenticators: Arc::new(authenticators),
        }
    }

    pub fn len(&self) -> usize {
        self.authenticators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.authenticators.is_empty()
    }

    /// Runs the chain without a downstream service. `Continue` from every
    /// authenticator ends as a 401.
    pub async fn authenticate(&self, mut req: Request) -> Result<AuthResult, HttpError> {
        for authenticator in self.authenticators.iter() {
            match authenticator.serve_authn(req).await? {
                AuthResult::Continue(next) => req = next,
                done => return Ok(done),
            }
        }
        Err(HttpError::unauthorized(AuthError::InvalidCredential(
            "no authenticator accepted the request".into(),
        )))
    }
}

/// axum middleware: authenticates and forwards to `next`, or answers directly.
pub async fn authn_middleware(State(chain): State<AuthChain>, req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();

    match chain.authenticate(req).await {
        Ok(AuthResult::Succeeded(req)) => {
            let extra = req.extensions().get::<ResponseHeaders>().cloned();
            let mut response = next.run(req).await;
            if let Some(ResponseHeaders(headers)) = extra {
                response.headers_mut().extend(headers);
            }
            response
        }
        Ok(AuthResult::Respond(response)) => response,
        // authenticate never yields Continue
        Ok(AuthResult::Continue(_)) => StatusCode::UNAUTHORIZED.into_response(),
        Err(e) => {
            if e.status.is_server_error() {
                tracing::warn!("authentication error for {} {}: {}", method, uri, e);
            } else {
                tracing::debug!("authentication refused for {} {}: {}", method, uri, e);
            }
            e.into_response()
        }
    }
}

/// 302 to `location`.
pub fn redirect(location: &str) -> Response {
    let Ok(value) = HeaderValue::from_str(location) else {
        return HttpError::internal(AuthError::CreateRequest(format!(
            "invalid redirect location {:?}",
            location
        )))
        .into_response();
    };
    let mut response = (StatusCode::FOUND, "Found").into_response();
    let headers = response.headers_mut();
    headers.insert(header::LOCATION, value);
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    struct Fixed(fn(Request) -> Result<AuthResult, HttpError>);

    #[async_trait]
    impl Authenticator for Fixed {
        async fn serve_authn(&self, req: Request) -> Result<AuthResult, HttpError> {
            (self.0)(req)
        }
    }

    fn req() -> Request {
        Request::builder().uri("/").body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_chain_all_continue_is_unauthorized() {
        let chain = AuthChain::new(vec![
            Arc::new(Fixed(|r| Ok(AuthResult::Continue(r)))),
            Arc::new(Fixed(|r| Ok(AuthResult::Continue(r)))),
        ]);
        let err = chain.authenticate(req()).await.unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_chain_stops_at_first_decision() {
        let chain = AuthChain::new(vec![
            Arc::new(Fixed(|r| Ok(AuthResult::Continue(r)))),
            Arc::new(Fixed(|r| Ok(AuthResult::Succeeded(r)))),
            Arc::new(Fixed(|_| Err(HttpError::reauth()))),
        ]);
        assert!(matches!(
            chain.authenticate(req()).await.unwrap(),
            AuthResult::Succeeded(_)
        ));

        let failing = AuthChain::new(vec![Arc::new(Fixed(|_| Err(HttpError::reauth())))]);
        assert!(failing.authenticate(req()).await.unwrap_err().is_reauth());
    }

    #[test]
    fn test_redirect_headers() {
        let response = redirect("https://idp.example/authorize?x=1");
        assert_eq!(response.status(), StatusCode::FOUND);
        let headers = response.headers();
        assert_eq!(headers[header::LOCATION], "https://idp.example/authorize?x=1");
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain; charset=utf-8");
        assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");

        assert_eq!(
            redirect("bad\nlocation").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
