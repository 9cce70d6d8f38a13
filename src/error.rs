use axum::{
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Value of the `WWW-Authenticate` header sent when a bearer token is refused.
pub const BEARER_INVALID_TOKEN: &str = r#"Bearer error="invalid_token""#;

/// Everything that can go wrong while authenticating a request.
///
/// Variants are grouped the same way callers classify them: configuration,
/// credentials, token shape, transport, authorization server status, session,
/// and the `ReAuthRequired` control signal.
#[derive(Debug, Error)]
pub enum AuthError {
    // configuration
    #[error("failed to create component: {0}")]
    CreateComponent(String),

    // credentials
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    #[error("client certificate does not match token binding: {0}")]
    CertificateMismatch(String),

    // token
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("azp claim does not match client id (got {0:?})")]
    InvalidAzp(String),
    #[error("auth_time claim missing or not numeric")]
    AuthTimeMissing,
    #[error("auth_time exceeded max_age ({elapsed}s > {max_age}s)")]
    ExceededAuthTime { elapsed: i64, max_age: i64 },
    #[error("nonce mismatch")]
    InvalidNonce,

    // transport
    #[error("failed to create request: {0}")]
    CreateRequest(String),
    #[error("round trip failed: {0}")]
    RoundTrip(String),
    #[error("failed to read body: {0}")]
    ReadBody(String),
    #[error("invalid response content type {0:?}")]
    InvalidResponse(String),
    #[error("failed to unmarshal: {0}")]
    Unmarshal(String),

    // authorization server status
    #[error("token endpoint returned {status}: {body}")]
    RedeemToken { status: u16, body: String },
    #[error("introspection endpoint returned {status}: {body}")]
    Introspection { status: u16, body: String },
    #[error("revocation endpoint returned {status}: {body}")]
    Revocation { status: u16, body: String },
    #[error("userinfo endpoint returned {status}: {body}")]
    UserInfo { status: u16, body: String },

    // session
    #[error("session {operation} failed: {reason}")]
    Session {
        operation: &'static str,
        reason: String,
    },

    #[error("oauth context not found")]
    ContextNotFound,

    // control
    #[error("re-authentication required")]
    ReAuthRequired,
}

/// An [`AuthError`] paired with the HTTP status, headers and body it renders as.
#[derive(Debug)]
pub struct HttpError {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Option<String>,
    pub source: AuthError,
}

impl HttpError {
    pub fn new(status: StatusCode, source: AuthError) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: None,
            source,
        }
    }

    pub fn unauthorized(source: AuthError) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, source)
    }

    pub fn internal(source: AuthError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, source)
    }

    pub fn forbidden(source: AuthError) -> Self {
        Self::new(StatusCode::FORBIDDEN, source)
    }

    /// The 401 sentinel telling callers to drop the session and restart the flow.
    pub fn reauth() -> Self {
        Self::unauthorized(AuthError::ReAuthRequired)
    }

    /// Token failures surface as 401 with `WWW-Authenticate: Bearer error="invalid_token"`.
    pub fn invalid_token(reason: impl Into<String>) -> Self {
        Self::unauthorized(AuthError::InvalidToken(reason.into())).with_bearer_challenge()
    }

    pub fn is_reauth(&self) -> bool {
        matches!(self.source, AuthError::ReAuthRequired)
    }

    pub fn with_header(mut self, name: header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_bearer_challenge(self) -> Self {
        self.with_header(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static(BEARER_INVALID_TOKEN),
        )
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.source, self.status)
    }
}

impl std::error::Error for HttpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl From<AuthError> for HttpError {
    /// Default classification: client-side problems are 401, everything else 500.
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredential(_)
            | AuthError::CertificateMismatch(_)
            | AuthError::InvalidParameters(_)
            | AuthError::InvalidAzp(_)
            | AuthError::AuthTimeMissing
            | AuthError::InvalidNonce
            | AuthError::ExceededAuthTime { .. }
            | AuthError::ContextNotFound
            | AuthError::ReAuthRequired => Self::unauthorized(err),
            AuthError::InvalidToken(_) => Self::unauthorized(err).with_bearer_challenge(),
            _ => Self::internal(err),
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = self.body.unwrap_or_else(|| {
            self.status
                .canonical_reason()
                .unwrap_or("error")
                .to_string()
        });

        let mut response = (self.status, body).into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        headers.insert(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        );
        for (name, value) in self.headers.iter() {
            headers.insert(name.clone(), value.clone());
        }
        response
    }
}

/// Classifies an authorization server status code: 5xx and transport
/// failures become 500, any other non-200 becomes 401.
pub fn classify_status(status: u16, err: AuthError) -> HttpError {
    if status >= 500 {
        HttpError::internal(err)
    } else {
        HttpError::unauthorized(err)
    }
}
