//! Wiring for the standalone gateway: a cookie-keyed session store, client
//! certificates handed over by a TLS terminator, the authenticator chain and
//! forwarding to the upstream service.

use crate::config::{GatewayConfig, ValidationFlags};
use crate::context::{PeerCertificates, TokenClaims};
use crate::error::{AuthError, HttpError};
use crate::handler::{
    AuthChain, Authenticator, BaseHandler, authn_middleware,
    authorization_code::AuthorizationCodeHandler, client_credentials::ClientCredentialsHandler,
    resource_server::ResourceServerHandler, ropc::RopcHandler,
};
use crate::session::{MemorySession, Session, SessionHandle};
use axum::{
    Json, Router,
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
};
use base64::{Engine, engine::general_purpose::STANDARD};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

pub const DEFAULT_SESSION_COOKIE: &str = "authn_session";
/// Sessions untouched for this long are dropped.
pub const DEFAULT_SESSION_IDLE: Duration = Duration::from_secs(30 * 60);
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Runtime knobs that do not belong in the JSON configuration.
#[derive(Debug, Clone, Default)]
pub struct GatewayOptions {
    /// Base URL requests are forwarded to. `None` echoes the attached tokens.
    pub upstream: Option<String>,
    pub session_cookie: String,
    /// Zero means [`DEFAULT_SESSION_IDLE`].
    pub session_idle: Duration,
    /// Marks the session cookie `Secure`. Set it when clients reach the
    /// gateway over TLS.
    pub secure_cookie: bool,
    /// Header in which the TLS terminator passes the client certificate (PEM,
    /// optionally URL-encoded).
    pub client_cert_header: Option<String>,
    pub flags: ValidationFlags,
}

struct StoredSession {
    session: Arc<MemorySession>,
    touched: Instant,
}

/// In-memory sessions keyed by cookie value. Sessions left empty after a
/// request are dropped again, idle ones are dropped by [`SessionStore::sweep`].
pub struct SessionStore {
    cookie: String,
    idle: Duration,
    secure: bool,
    sessions: RwLock<HashMap<String, StoredSession>>,
}

impl SessionStore {
    pub fn new(cookie: &str, idle: Duration, secure: bool) -> Self {
        Self {
            cookie: if cookie.is_empty() {
                DEFAULT_SESSION_COOKIE.to_string()
            } else {
                cookie.to_string()
            },
            idle: if idle.is_zero() {
                DEFAULT_SESSION_IDLE
            } else {
                idle
            },
            secure,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Removes sessions idle for longer than the timeout. Returns how many
    /// were removed.
    pub async fn sweep(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.touched.elapsed() <= self.idle);
        before - sessions.len()
    }

    async fn lookup(&self, id: &str) -> Option<Arc<MemorySession>> {
        self.sessions
            .read()
            .await
            .get(id)
            .filter(|s| s.touched.elapsed() <= self.idle)
            .map(|s| s.session.clone())
    }

    fn set_cookie(&self, id: &str) -> String {
        let mut cookie = format!("{}={}; Path=/; HttpOnly; SameSite=Lax", self.cookie, id);
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

/// Sweeps `store` until it is dropped.
pub fn spawn_session_sweeper(store: &Arc<SessionStore>, every: Duration) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::warn!("no tokio runtime, idle sessions will only expire on lookup");
        return;
    };
    let store = Arc::downgrade(store);
    runtime.spawn(async move {
        loop {
            tokio::time::sleep(every).await;
            let Some(store) = store.upgrade() else {
                break;
            };
            let removed = store.sweep().await;
            if removed > 0 {
                tracing::debug!("dropped {} idle session(s)", removed);
            }
        }
    });
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.to_string())
}

pub async fn session_middleware(
    State(store): State<Arc<SessionStore>>,
    mut req: Request,
    next: Next,
) -> Response {
    let existing = match cookie_value(req.headers(), &store.cookie) {
        Some(id) => store.lookup(&id).await.map(|s| (id, s)),
        None => None,
    };
    let is_new = existing.is_none();
    let (id, session) = existing
        .unwrap_or_else(|| (Uuid::new_v4().to_string(), Arc::new(MemorySession::new())));

    req.extensions_mut()
        .insert(SessionHandle(session.clone() as Arc<dyn Session>));
    let mut response = next.run(req).await;

    if session.is_empty() {
        store.sessions.write().await.remove(&id);
        return response;
    }
    store.sessions.write().await.insert(
        id.clone(),
        StoredSession {
            session,
            touched: Instant::now(),
        },
    );
    if is_new && let Ok(value) = HeaderValue::from_str(&store.set_cookie(&id)) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    response
}

/// Decodes a PEM certificate as forwarded by proxies such as nginx
/// (`$ssl_client_escaped_cert`).
pub fn pem_to_der(value: &str) -> Option<Vec<u8>> {
    let decoded = urlencoding::decode(value).ok()?;
    let pem = decoded.trim();
    let inner = pem
        .strip_prefix("-----BEGIN CERTIFICATE-----")
        .and_then(|s| s.trim_end().strip_suffix("-----END CERTIFICATE-----"))
        .unwrap_or(pem);
    let b64: String = inner.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD.decode(b64).ok().filter(|der| !der.is_empty())
}

pub async fn client_cert_middleware(
    State(header_name): State<HeaderName>,
    mut req: Request,
    next: Next,
) -> Response {
    let der = req
        .headers()
        .get(&header_name)
        .and_then(|v| v.to_str().ok())
        .and_then(pem_to_der);
    if let Some(der) = der {
        req.extensions_mut().insert(PeerCertificates(vec![der]));
    }
    // the upstream only ever sees the verified binding, not the raw header
    req.headers_mut().remove(&header_name);
    next.run(req).await
}

#[derive(Clone)]
pub struct Upstream {
    base: Option<String>,
    http: reqwest::Client,
}

impl Upstream {
    pub fn new(base: Option<String>) -> Self {
        Self {
            base: base.map(|b| b.trim_end_matches('/').to_string()),
            http: reqwest::Client::new(),
        }
    }
}

const HOP_BY_HOP: [HeaderName; 4] = [
    header::HOST,
    header::CONNECTION,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
];

/// Sends an authenticated request on to the upstream service.
pub async fn forward(State(upstream): State<Upstream>, req: Request) -> Response {
    let Some(base) = &upstream.base else {
        let claims = req
            .extensions()
            .get::<TokenClaims>()
            .map(|c| c.0.clone())
            .unwrap_or_default();
        return Json(claims).into_response();
    };

    let (mut parts, body) = req.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", base, path);
    for name in &HOP_BY_HOP {
        parts.headers.remove(name);
    }

    let sent = upstream
        .http
        .request(parts.method.clone(), &url)
        .headers(parts.headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await;
    let upstream_response = match sent {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!("upstream request to {} failed: {}", url, e);
            return HttpError::new(
                axum::http::StatusCode::BAD_GATEWAY,
                AuthError::RoundTrip(e.to_string()),
            )
            .into_response();
        }
    };

    let status = upstream_response.status();
    let mut headers = upstream_response.headers().clone();
    for name in &HOP_BY_HOP[1..] {
        headers.remove(name);
    }
    let mut response = Response::new(Body::from_stream(upstream_response.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// The authenticators named in `config`, most specific first. The bearer
/// check runs before the session based flows, client credentials come last
/// because they always succeed.
pub fn build_chain(
    config: &GatewayConfig,
    base: Arc<BaseHandler>,
) -> Result<(AuthChain, Option<Arc<RopcHandler>>), AuthError> {
    let mut authenticators: Vec<Arc<dyn Authenticator>> = Vec::new();
    if let Some(spec) = &config.resource_server {
        authenticators.push(Arc::new(ResourceServerHandler::new(spec, base.clone())?));
    }
    if let Some(spec) = &config.authorization_code {
        authenticators.push(Arc::new(AuthorizationCodeHandler::new(spec, base.clone())?));
    }
    let ropc = config
        .ropc
        .as_ref()
        .map(|spec| Arc::new(RopcHandler::new(spec, base.clone())));
    if let Some(ropc) = &ropc {
        authenticators.push(ropc.clone());
    }
    if let Some(spec) = &config.client_credentials {
        authenticators.push(Arc::new(ClientCredentialsHandler::new(spec, base)));
    }
    if authenticators.is_empty() {
        tracing::warn!("no authenticator configured, every request will be refused");
    }
    Ok((AuthChain::new(authenticators), ropc))
}

/// Builds the full gateway router.
pub fn build_router(config: &GatewayConfig, options: &GatewayOptions) -> Result<Router, AuthError> {
    let base = Arc::new(BaseHandler::from_config(config, options.flags)?);
    let (chain, ropc) = build_chain(config, base)?;
    tracing::info!("authenticator chain has {} handler(s)", chain.len());

    let mut app = Router::new()
        .fallback(forward)
        .with_state(Upstream::new(options.upstream.clone()))
        .layer(middleware::from_fn_with_state(chain, authn_middleware));

    if let Some(ropc) = ropc
        && !ropc.redeem_token_path().is_empty()
    {
        let path = ropc.redeem_token_path().to_string();
        tracing::info!("password grant endpoint at {}", path);
        let redeem = Router::new().route(
            &path,
            post(move |req: Request| {
                let ropc = ropc.clone();
                async move { ropc.serve_http(req).await }
            }),
        );
        app = redeem.merge(app);
    }

    let store = Arc::new(SessionStore::new(
        &options.session_cookie,
        options.session_idle,
        options.secure_cookie,
    ));
    spawn_session_sweeper(&store, SESSION_SWEEP_INTERVAL);
    let mut app = app.layer(middleware::from_fn_with_state(store, session_middleware));

    if let Some(name) = &options.client_cert_header {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            AuthError::CreateComponent(format!("client cert header {:?}: {}", name, e))
        })?;
        app = app.layer(middleware::from_fn_with_state(name, client_cert_middleware));
    }
    Ok(app)
}
