//! One authorization-server binding and the token validation engine.

use crate::client::{ClientRequester, OAuthClient, Params, params_from_map};
use crate::config::{OAuthContextSpec, ParseOptionsSpec, ValidationFlags};
use crate::error::{AuthError, HttpError};
use crate::jarm::JarmValidator;
use crate::jwt::{Claims, JwtHandler, ParseOptions, now_unix, peek_claims};
use crate::provider::Provider;
use crate::request_object::RequestObjectGenerator;
use crate::token::{Introspector, Revoker, TokenRedeemer, TokenResponse, fetch_userinfo};
use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Tokens held for one session, plus what validation learned about them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OAuthTokens {
    /// Name of the context that obtained the tokens.
    #[serde(rename = "Context", default)]
    pub context: String,
    #[serde(rename = "AT", default, skip_serializing_if = "String::is_empty")]
    pub at: String,
    #[serde(rename = "ATExp", default)]
    pub at_exp: i64,
    #[serde(rename = "ATClaims", default, skip_serializing_if = "Option::is_none")]
    pub at_claims: Option<Claims>,
    #[serde(rename = "IDT", default, skip_serializing_if = "String::is_empty")]
    pub idt: String,
    #[serde(rename = "IDTExp", default)]
    pub idt_exp: i64,
    #[serde(rename = "IDTClaims", default, skip_serializing_if = "Option::is_none")]
    pub idt_claims: Option<Claims>,
    #[serde(rename = "RT", default, skip_serializing_if = "String::is_empty")]
    pub rt: String,
    /// Set when validation changed anything that should be persisted again.
    #[serde(skip)]
    pub updated: bool,
}

impl OAuthTokens {
    pub fn from_response(context: &str, resp: &TokenResponse) -> Self {
        Self {
            context: context.to_string(),
            at: resp.access_token.clone(),
            idt: resp.id_token.clone(),
            rt: resp.refresh_token.clone(),
            updated: true,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.at.is_empty() && self.idt.is_empty()
    }
}

/// Extra checks applied to an ID token after the standard ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOption {
    /// Maximum seconds since `auth_time`. 0 disables the check.
    MaxAge(i64),
    /// Expected `nonce`. Empty disables the check.
    Nonce(String),
}

impl ValidationOption {
    pub fn validate(&self, claims: &Claims, now: i64) -> Result<(), HttpError> {
        match self {
            Self::MaxAge(0) => Ok(()),
            Self::MaxAge(max_age) => {
                let auth_time = claims
                    .get("auth_time")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| {
                        HttpError::unauthorized(AuthError::AuthTimeMissing).with_bearer_challenge()
                    })? as i64;
                let elapsed = now - auth_time;
                if elapsed > *max_age {
                    let reason = AuthError::ExceededAuthTime {
                        elapsed,
                        max_age: *max_age,
                    };
                    tracing::debug!("{}", reason);
                    return Err(HttpError::reauth());
                }
                Ok(())
            }
            Self::Nonce(expected) if expected.is_empty() => Ok(()),
            Self::Nonce(expected) => {
                let got = claims.get("nonce").and_then(Value::as_str).unwrap_or_default();
                if !constant_time_eq(got, expected) {
                    return Err(
                        HttpError::unauthorized(AuthError::InvalidNonce).with_bearer_challenge()
                    );
                }
                Ok(())
            }
        }
    }
}

pub fn constant_time_eq(a: &str, b: &str) -> bool {
    use subtle::ConstantTimeEq;
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// DER certificates the TLS terminator saw from the client, leaf first.
#[derive(Debug, Clone, Default)]
pub struct PeerCertificates(pub Vec<Vec<u8>>);

/// Request extension holding validated tokens keyed by each context's claims key.
#[derive(Debug, Clone, Default)]
pub struct TokenClaims(pub HashMap<String, OAuthTokens>);

impl TokenClaims {
    pub fn get(&self, key: &str) -> Option<&OAuthTokens> {
        self.0.get(key)
    }
}

/// Parse options whose issuer follows the provider, which discovery may fill in late.
struct ParseProfile {
    base: ParseOptions,
    check_issuer: bool,
}

impl ParseProfile {
    fn new(spec: &ParseOptionsSpec, audience: &str) -> Result<Self, AuthError> {
        Ok(Self {
            base: ParseOptions::from_spec(spec, "", audience)?,
            check_issuer: !spec.skip_issuer_check,
        })
    }

    fn options(&self, issuer: String) -> ParseOptions {
        let mut opts = self.base.clone();
        if self.check_issuer && !issuer.is_empty() {
            opts.issuer = Some(issuer);
        }
        opts
    }
}

pub struct OAuthContext {
    name: String,
    provider: Arc<Provider>,
    client: Arc<OAuthClient>,
    requester: Arc<ClientRequester>,
    redeemer: TokenRedeemer,
    introspector: Introspector,
    revoker: Revoker,
    jwt: Option<Arc<JwtHandler>>,
    at_parse: ParseProfile,
    idt_parse: ParseProfile,
    introspection_enabled: bool,
    skip_unexpired_at: bool,
    skip_unexpired_idt: bool,
    at_proxy_header: Option<HeaderName>,
    idt_proxy_header: Option<HeaderName>,
    claims_key: String,
    flags: ValidationFlags,
    request_object: Option<RequestObjectGenerator>,
    jarm: Option<JarmValidator>,
    userinfo_check: bool,
}

impl std::fmt::Debug for OAuthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthContext")
            .field("name", &self.name)
            .field("provider", &self.provider)
            .field("client", &self.client)
            .finish()
    }
}

fn proxy_header(name: &str) -> Result<Option<HeaderName>, AuthError> {
    if name.is_empty() {
        return Ok(None);
    }
    HeaderName::from_bytes(name.as_bytes())
        .map(Some)
        .map_err(|e| AuthError::CreateComponent(format!("proxy header {:?}: {}", name, e)))
}

impl OAuthContext {
    pub fn new(spec: &OAuthContextSpec, flags: ValidationFlags) -> Result<Self, AuthError> {
        let mut builder = reqwest::Client::builder();
        if spec.timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(spec.timeout_secs));
        }
        let http = builder
            .build()
            .map_err(|e| AuthError::CreateComponent(format!("http client: {}", e)))?;

        let provider = Arc::new(Provider::new(&spec.provider, http.clone())?);
        let client = Arc::new(OAuthClient::from_spec(&spec.client)?);
        let requester = Arc::new(ClientRequester::new(
            client.clone(),
            spec.client.auth_method,
            params_from_map(&spec.client.extra_params),
            provider.headers().clone(),
            http,
        )?);

        let jwt = match &spec.jwt {
            Some(jwt) => Some(Arc::new(JwtHandler::from_spec(jwt)?)),
            None => client.jwt.clone(),
        };
        if jwt.is_none() && !spec.enable_introspection {
            return Err(AuthError::CreateComponent(format!(
                "context {:?} has neither jwt keys nor introspection",
                spec.name
            )));
        }

        let request_object = spec
            .request_object
            .as_ref()
            .map(|ro| RequestObjectGenerator::new(ro, client.clone(), provider.clone()))
            .transpose()?;

        let jarm = match (&spec.jarm, &jwt) {
            (Some(jarm), Some(jwt)) => Some(JarmValidator::new(
                jarm,
                provider.clone(),
                client.id.clone(),
                jwt.clone(),
            )?),
            (Some(_), None) => {
                return Err(AuthError::CreateComponent(
                    "jarm needs jwt verification keys".into(),
                ));
            }
            (None, _) => None,
        };

        let name = if spec.name.is_empty() {
            "default".to_string()
        } else {
            spec.name.clone()
        };

        Ok(Self {
            at_parse: ParseProfile::new(&spec.at_parse_options, &client.audience)?,
            idt_parse: ParseProfile::new(&spec.idt_parse_options, &client.id)?,
            redeemer: TokenRedeemer::new(provider.clone(), requester.clone()),
            introspector: Introspector::new(provider.clone(), requester.clone()),
            revoker: Revoker::new(provider.clone(), requester.clone()),
            name,
            provider,
            client,
            requester,
            jwt,
            introspection_enabled: spec.enable_introspection,
            skip_unexpired_at: spec.skip_unexpired_at,
            skip_unexpired_idt: spec.skip_unexpired_idt,
            at_proxy_header: proxy_header(&spec.at_proxy_header)?,
            idt_proxy_header: proxy_header(&spec.idt_proxy_header)?,
            claims_key: spec.claims_key.clone(),
            flags,
            request_object,
            jarm,
            userinfo_check: spec.userinfo_check,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    pub fn client(&self) -> &OAuthClient {
        &self.client
    }

    pub fn redeemer(&self) -> &TokenRedeemer {
        &self.redeemer
    }

    pub fn revoker(&self) -> &Revoker {
        &self.revoker
    }

    pub fn request_object(&self) -> Option<&RequestObjectGenerator> {
        self.request_object.as_ref()
    }

    pub fn jarm(&self) -> Option<&JarmValidator> {
        self.jarm.as_ref()
    }

    pub fn userinfo_check(&self) -> bool {
        self.userinfo_check
    }

    /// Exchanges a grant and wraps the result as tokens owned by this context.
    pub async fn exchange(&self, params: &[(String, String)]) -> Result<OAuthTokens, HttpError> {
        let resp = self.redeemer.redeem(params).await?;
        Ok(OAuthTokens::from_response(&self.name, &resp))
    }

    /// Validates (and where possible heals) a token bundle in place.
    ///
    /// The access token is checked first, refreshing it when it turned
    /// inactive. The ID token is then checked with `options` applied.
    pub async fn validate_tokens(
        &self,
        tokens: &mut OAuthTokens,
        options: &[ValidationOption],
    ) -> Result<(), HttpError> {
        if tokens.is_empty() {
            return Err(HttpError::reauth());
        }
        let now = now_unix();

        let at_due = !self.skip_unexpired_at || tokens.at_exp == 0 || tokens.at_exp <= now;
        if !tokens.at.is_empty() && at_due && !self.flags.skip_at {
            let claims = match self.validate_at(&tokens.at).await {
                Ok(claims) if is_active(&claims) => claims,
                Ok(_) => self.refresh_and_validate(tokens).await?,
                Err(e) if e.is_reauth() => self.refresh_and_validate(tokens).await?,
                Err(e) => return Err(e),
            };
            tokens.at_exp = exp_of(&claims);
            tokens.at_claims = Some(claims);
            tokens.updated = true;
        }

        let idt_due = !self.skip_unexpired_idt || tokens.idt_exp == 0 || tokens.idt_exp <= now;
        if !tokens.idt.is_empty() && idt_due && !self.flags.skip_idt {
            let claims = self.validate_idt(&tokens.idt, options)?;
            tokens.idt_exp = exp_of(&claims);
            tokens.idt_claims = Some(claims);
            tokens.updated = true;
        }

        Ok(())
    }

    async fn refresh_and_validate(&self, tokens: &mut OAuthTokens) -> Result<Claims, HttpError> {
        if tokens.rt.is_empty() {
            tracing::debug!("access token inactive and no refresh token");
            return Err(HttpError::reauth());
        }

        let resp = match self.redeemer.refresh(&tokens.rt).await {
            Ok(resp) => resp,
            Err(e) if e.status.is_server_error() => return Err(e),
            Err(e) => {
                tracing::debug!("refresh rejected: {}", e);
                return Err(HttpError::reauth());
            }
        };
        if resp.access_token.is_empty() {
            tracing::debug!("refresh response carried no access token");
            return Err(HttpError::reauth());
        }

        tokens.at = resp.access_token;
        tokens.rt = resp.refresh_token;
        if !resp.id_token.is_empty() {
            tokens.idt = resp.id_token;
            tokens.idt_exp = 0;
            tokens.idt_claims = None;
        }
        tokens.updated = true;

        match self.validate_at(&tokens.at).await {
            Ok(claims) if is_active(&claims) => Ok(claims),
            Ok(_) => Err(HttpError::reauth()),
            Err(e) => Err(e),
        }
    }

    /// Validates an access token by introspection or as a local JWT.
    /// Locally validated claims get `active: true` so both paths look alike.
    pub async fn validate_at(&self, at: &str) -> Result<Claims, HttpError> {
        if self.introspection_enabled {
            return self.introspector.introspect(at).await;
        }

        let jwt = self.jwt.as_ref().ok_or_else(|| {
            HttpError::internal(AuthError::CreateComponent("no jwt keys configured".into()))
        })?;
        let opts = self.at_parse.options(self.provider.issuer());
        match jwt.parse(at, &opts) {
            Ok(mut claims) => {
                claims.insert("active".into(), Value::Bool(true));
                Ok(claims)
            }
            Err(e) => {
                tracing::debug!("access token rejected: {}", e);
                let has_sub = peek_claims(at).is_some_and(|c| c.contains_key("sub"));
                if has_sub {
                    Err(HttpError::reauth())
                } else {
                    Err(HttpError::invalid_token(e.to_string()))
                }
            }
        }
    }

    pub fn validate_idt(
        &self,
        idt: &str,
        options: &[ValidationOption],
    ) -> Result<Claims, HttpError> {
        let jwt = self.jwt.as_ref().ok_or_else(|| {
            HttpError::internal(AuthError::CreateComponent("no jwt keys configured".into()))
        })?;
        let opts = self.idt_parse.options(self.provider.issuer());
        let claims = jwt.parse(idt, &opts).map_err(|e| {
            tracing::debug!("id token rejected: {}", e);
            HttpError::invalid_token(e.to_string())
        })?;

        if claims.get("sub").and_then(Value::as_str).unwrap_or_default().is_empty() {
            tracing::debug!("id token has no sub");
            return Err(HttpError::invalid_token("id token sub missing"));
        }
        if !claims.contains_key("iat") {
            tracing::debug!("id token has no iat");
            return Err(HttpError::invalid_token("id token iat missing"));
        }

        let multiple_aud = claims
            .get("aud")
            .and_then(Value::as_array)
            .is_some_and(|a| a.len() > 1);
        if multiple_aud || claims.contains_key("azp") {
            let azp = claims.get("azp").and_then(Value::as_str).unwrap_or_default();
            if azp != self.client.id {
                tracing::debug!("id token azp {:?} is not {:?}", azp, self.client.id);
                return Err(HttpError::unauthorized(AuthError::InvalidAzp(azp.to_string()))
                    .with_bearer_challenge());
            }
        }

        let now = now_unix();
        for option in options {
            option.validate(&claims, now)?;
        }
        Ok(claims)
    }

    /// Checks that the userinfo response belongs to the same subject as `idt`.
    pub fn validate_userinfo(&self, userinfo: &[u8], idt: &str) -> Result<(), HttpError> {
        let info: serde_json::Map<String, Value> = serde_json::from_slice(userinfo)
            .map_err(|e| HttpError::internal(AuthError::Unmarshal(e.to_string())))?;
        let sub = info.get("sub").and_then(Value::as_str).ok_or_else(|| {
            HttpError::unauthorized(AuthError::InvalidParameters("userinfo sub missing".into()))
        })?;

        let claims = self.validate_idt(idt, &[])?;
        let idt_sub = claims.get("sub").and_then(Value::as_str).unwrap_or_default();
        if idt_sub.is_empty() || idt_sub != sub {
            tracing::debug!("userinfo sub {:?} differs from id token sub {:?}", sub, idt_sub);
            return Err(HttpError::unauthorized(AuthError::InvalidParameters(
                "userinfo sub does not match id token".into(),
            )));
        }
        Ok(())
    }

    /// Fetches userinfo with the access token and cross-checks it against the ID token.
    pub async fn check_userinfo(&self, tokens: &OAuthTokens) -> Result<(), HttpError> {
        let body = fetch_userinfo(&self.provider, &self.requester, &tokens.at).await?;
        self.validate_userinfo(&body, &tokens.idt)
    }

    /// Makes validated tokens visible to the upstream request: proxy headers
    /// for the upstream service and a [`TokenClaims`] entry for later middleware.
    pub fn attach(&self, req: &mut Request, tokens: &OAuthTokens) {
        if let Some(name) = &self.at_proxy_header
            && !tokens.at.is_empty()
            && let Ok(value) = HeaderValue::from_str(&tokens.at)
        {
            req.headers_mut().insert(name.clone(), value);
        }
        if let Some(name) = &self.idt_proxy_header
            && !tokens.idt.is_empty()
            && let Ok(value) = HeaderValue::from_str(&tokens.idt)
        {
            req.headers_mut().insert(name.clone(), value);
        }
        if !self.claims_key.is_empty() {
            let extensions = req.extensions_mut();
            if extensions.get::<TokenClaims>().is_none() {
                extensions.insert(TokenClaims::default());
            }
            if let Some(stash) = extensions.get_mut::<TokenClaims>() {
                stash.0.insert(self.claims_key.clone(), tokens.clone());
            }
        }
    }
}

fn is_active(claims: &Claims) -> bool {
    claims.get("active").and_then(Value::as_bool).unwrap_or(false)
}

fn exp_of(claims: &Claims) -> i64 {
    claims
        .get("exp")
        .and_then(Value::as_f64)
        .map(|e| e as i64)
        .unwrap_or(0)
}

/// Checks a certificate-bound token (RFC 8705): the SHA-256 thumbprint of the
/// client's leaf certificate must equal `cnf["x5t#S256"]`.
pub fn validate_cert(cnf: &Value, certs: Option<&PeerCertificates>) -> Result<(), AuthError> {
    let expected = cnf
        .get("x5t#S256")
        .and_then(Value::as_str)
        .ok_or_else(|| AuthError::CertificateMismatch("cnf has no x5t#S256".into()))?;
    let leaf = certs
        .and_then(|c| c.0.first())
        .ok_or_else(|| AuthError::CertificateMismatch("no client certificate".into()))?;

    let thumbprint = URL_SAFE_NO_PAD.encode(Sha256::digest(leaf));
    if !constant_time_eq(&thumbprint, expected) {
        return Err(AuthError::CertificateMismatch(format!(
            "thumbprint {} does not match",
            thumbprint
        )));
    }
    Ok(())
}

/// Builds token endpoint parameters from fixed pairs plus handler-wide extras.
pub fn grant_params(pairs: &[(&str, &str)], extra: &Params) -> Params {
    let mut params: Params = pairs
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    params.extend(
        extra
            .iter()
            .filter(|(k, _)| !pairs.iter().any(|(pk, _)| pk == k))
            .cloned(),
    );
    params
}
