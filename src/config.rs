//! Declarative configuration for the authenticator.
//!
//! Everything here is plain serde data. Components are built from these specs
//! at startup; after that the only mutable state is the discovered provider
//! endpoints and the client-credentials token cache.

use serde::Deserialize;
use std::collections::BTreeMap;

pub const SKIP_AT_VALIDATION_ENV: &str = "AILERON_SKIP_AT_VALIDATION";
pub const SKIP_IDT_VALIDATION_ENV: &str = "AILERON_SKIP_IDT_VALIDATION";

/// Top-level configuration consumed by the gateway binary.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub contexts: Vec<OAuthContextSpec>,
    /// Query parameter naming the OAuth context for a request.
    pub context_query_key: String,
    /// Header naming the OAuth context for a request (used when no query key).
    pub context_header_key: String,
    pub authorization_code: Option<AuthorizationCodeSpec>,
    pub ropc: Option<RopcSpec>,
    pub client_credentials: Option<ClientCredentialsSpec>,
    pub resource_server: Option<ResourceServerSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OAuthContextSpec {
    pub name: String,
    pub provider: ProviderSpec,
    pub client: ClientSpec,
    /// Keys used to verify tokens issued by the provider.
    pub jwt: Option<JwtHandlerSpec>,
    pub at_parse_options: ParseOptionsSpec,
    pub idt_parse_options: ParseOptionsSpec,
    pub enable_introspection: bool,
    pub skip_unexpired_at: bool,
    pub skip_unexpired_idt: bool,
    pub at_proxy_header: String,
    pub idt_proxy_header: String,
    pub claims_key: String,
    pub request_object: Option<RequestObjectSpec>,
    pub jarm: Option<JarmSpec>,
    /// Cross-check the userinfo `sub` against the ID token after a code exchange.
    pub userinfo_check: bool,
    /// Outbound request timeout in seconds. 0 means the transport default.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderSpec {
    pub issuer: String,
    /// Joined with every relative endpoint below.
    pub base_url: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    pub jwks_endpoint: String,
    pub introspect_endpoint: String,
    pub revocation_endpoint: String,
    pub discovery_endpoint: String,
    /// Extra headers sent with every request to this provider.
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    #[default]
    Basic,
    Form,
    ClientSecretJwt,
    PrivateKeyJwt,
    TlsClientAuth,
    SelfSignedTlsClientAuth,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientSpec {
    pub id: String,
    pub secret: String,
    /// Defaults to `id` when empty.
    pub audience: String,
    pub scopes: Vec<String>,
    pub auth_method: ClientAuthMethod,
    /// Signing keys for client assertions and request objects.
    pub jwt: Option<JwtHandlerSpec>,
    /// Parameters added to every request body sent to the provider.
    pub extra_params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JwtHandlerSpec {
    pub keys: Vec<KeySpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KeySpec {
    pub kid: String,
    /// JOSE algorithm name, e.g. `HS256`, `RS256`, `ES256`.
    pub algorithm: String,
    pub secret: String,
    pub public_key_pem: String,
    pub private_key_pem: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ParseOptionsSpec {
    pub leeway_secs: i64,
    /// Accepted `alg` values. Empty accepts every algorithm the keyring has.
    pub valid_methods: Vec<String>,
    pub exp_optional: bool,
    pub iat_required: bool,
    pub skip_issuer_check: bool,
    pub skip_audience_check: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RequestObjectSpec {
    /// When empty the object travels in the `request` parameter.
    pub request_uri: String,
    pub enable_cache: bool,
    pub nbf_secs: i64,
    pub exp_secs: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JarmSpec {
    /// One of `jwt`, `query.jwt`, `form_post.jwt`.
    pub response_mode: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum PkceMethod {
    #[serde(rename = "plain")]
    Plain,
    #[default]
    S256,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthorizationCodeSpec {
    pub login_path: String,
    pub callback_url: String,
    pub redirect_path: String,
    /// Query key holding the post-login redirect target. Defaults to `rd`.
    pub redirect_key: String,
    /// Allowed redirect targets. Defaults to `^$` (nothing but the empty string).
    pub redirect_path_pattern: String,
    pub redirect_to_login: bool,
    pub unauthorize_any: bool,
    pub restore_request: bool,
    pub disable_state: bool,
    pub disable_nonce: bool,
    pub disable_pkce: bool,
    pub pkce_method: PkceMethod,
    pub url_params: BTreeMap<String, String>,
    pub fapi_enabled: bool,
    pub logout_path: String,
    pub logout_redirect: String,
    pub max_age: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RopcSpec {
    pub redeem_token_path: String,
    pub username_key: String,
    pub password_key: String,
    pub extra_params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientCredentialsSpec {
    pub extra_params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResourceServerSpec {
    /// Defaults to `Authorization`.
    pub header_key: String,
    pub fapi_enabled: bool,
}

/// Debug escape hatches that disable AT or IDT validation entirely.
/// Read once at startup and injected into every context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationFlags {
    pub skip_at: bool,
    pub skip_idt: bool,
}

impl ValidationFlags {
    pub fn from_env() -> Self {
        Self {
            skip_at: env_flag(SKIP_AT_VALIDATION_ENV),
            skip_idt: env_flag(SKIP_IDT_VALIDATION_ENV),
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| parse_bool(&v))
        .unwrap_or(false)
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "t" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true"));
        assert!(parse_bool(" TRUE "));
        assert!(parse_bool("1"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool(""));
        assert!(!parse_bool("nope"));
    }

    #[test]
    fn test_gateway_config_defaults() {
        let cfg: GatewayConfig = serde_json::from_str(
            r#"{
                "contexts": [{
                    "name": "default",
                    "provider": {"issuer": "https://idp.example", "base_url": "https://idp.example", "token_endpoint": "/token"},
                    "client": {"id": "app", "secret": "s3cret", "scopes": ["openid", "profile"], "auth_method": "client_secret_jwt"}
                }],
                "resource_server": {}
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.contexts.len(), 1);
        let ctx = &cfg.contexts[0];
        assert_eq!(ctx.client.auth_method, ClientAuthMethod::ClientSecretJwt);
        assert_eq!(ctx.client.audience, "");
        assert!(!ctx.enable_introspection);
        assert!(cfg.resource_server.is_some());
        assert!(cfg.authorization_code.is_none());
    }

    #[test]
    fn test_pkce_method_names() {
        let m: PkceMethod = serde_json::from_str(r#""plain""#).unwrap();
        assert_eq!(m, PkceMethod::Plain);
        let m: PkceMethod = serde_json::from_str(r#""S256""#).unwrap();
        assert_eq!(m, PkceMethod::S256);
        assert_eq!(PkceMethod::default(), PkceMethod::S256);
    }
}
