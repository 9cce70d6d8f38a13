//! OAuth 2.0 / OpenID Connect authentication for a reverse proxy.
//!
//! The [`handler`] module holds the four authenticators (authorization code,
//! ROPC, client credentials, resource server). They share the validation
//! engine in [`context`] and are chained in front of an upstream service by
//! [`handler::authn_middleware`].

pub mod client;
pub mod config;
pub mod context;
pub mod csrf;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod jarm;
pub mod jwt;
pub mod provider;
pub mod request_object;
pub mod session;
pub mod token;

#[cfg(test)]
mod testutil;

pub use context::{OAuthContext, OAuthTokens, ValidationOption};
pub use error::{AuthError, HttpError};
pub use handler::{AuthChain, AuthResult, Authenticator, BaseHandler};
