//! JWT signing and verification over a static keyring.
//!
//! Key material comes from configuration; fetching JWKS documents is left to
//! whoever builds the [`JwtHandler`].

use crate::config::{JwtHandlerSpec, KeySpec, ParseOptionsSpec};
use crate::error::AuthError;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, decode_header, encode,
};
use serde::Serialize;
use std::collections::HashSet;
use std::str::FromStr;

/// Decoded claim set. Kept untyped because tokens from different providers
/// carry different extension claims.
pub type Claims = serde_json::Map<String, serde_json::Value>;

struct SigningKey {
    kid: Option<String>,
    alg: Algorithm,
    key: EncodingKey,
}

struct VerifyingKey {
    kid: Option<String>,
    alg: Algorithm,
    key: DecodingKey,
}

pub struct JwtHandler {
    signer: Option<SigningKey>,
    verifiers: Vec<VerifyingKey>,
}

impl std::fmt::Debug for JwtHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtHandler")
            .field("signer", &self.signer.as_ref().map(|s| (s.alg, s.kid.clone())))
            .field(
                "verifiers",
                &self
                    .verifiers
                    .iter()
                    .map(|v| (v.alg, v.kid.clone()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// What a token must satisfy to be accepted by [`JwtHandler::parse`].
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub leeway_secs: u64,
    /// Accepted `alg` header values. Empty accepts any algorithm in the keyring.
    pub algorithms: Vec<Algorithm>,
    pub exp_required: bool,
    pub iat_required: bool,
}

impl ParseOptions {
    pub fn from_spec(
        spec: &ParseOptionsSpec,
        issuer: &str,
        audience: &str,
    ) -> Result<Self, AuthError> {
        let algorithms = spec
            .valid_methods
            .iter()
            .map(|m| parse_algorithm(m))
            .collect::<Result<Vec<_>, _>>()?;

        let mut opts = Self {
            issuer: None,
            audience: None,
            leeway_secs: 0,
            algorithms,
            exp_required: !spec.exp_optional,
            iat_required: spec.iat_required,
        };
        if !spec.skip_issuer_check && !issuer.is_empty() {
            opts.issuer = Some(issuer.to_string());
        }
        if !spec.skip_audience_check && !audience.is_empty() {
            opts.audience = Some(audience.to_string());
        }
        // only a positive leeway is meaningful
        if spec.leeway_secs > 0 {
            opts.leeway_secs = spec.leeway_secs as u64;
        }
        Ok(opts)
    }

    fn validation(&self, alg: Algorithm) -> Validation {
        let mut v = Validation::new(alg);
        v.leeway = self.leeway_secs;
        v.validate_exp = true;
        v.validate_nbf = true;
        v.required_spec_claims = HashSet::new();
        if self.exp_required {
            v.required_spec_claims.insert("exp".to_string());
        }
        match &self.issuer {
            Some(iss) => v.set_issuer(&[iss]),
            None => v.iss = None,
        }
        match &self.audience {
            Some(aud) => v.set_audience(&[aud]),
            None => v.validate_aud = false,
        }
        v
    }
}

pub fn parse_algorithm(name: &str) -> Result<Algorithm, AuthError> {
    Algorithm::from_str(name)
        .map_err(|_| AuthError::CreateComponent(format!("unsupported jwt algorithm {:?}", name)))
}

fn is_hmac(alg: Algorithm) -> bool {
    matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512)
}

fn is_ec(alg: Algorithm) -> bool {
    matches!(alg, Algorithm::ES256 | Algorithm::ES384)
}

fn is_ed(alg: Algorithm) -> bool {
    matches!(alg, Algorithm::EdDSA)
}

fn decoding_key(spec: &KeySpec, alg: Algorithm) -> Result<Option<DecodingKey>, AuthError> {
    let err = |e: jsonwebtoken::errors::Error| {
        AuthError::CreateComponent(format!("invalid verification key {:?}: {}", spec.kid, e))
    };
    if is_hmac(alg) {
        if spec.secret.is_empty() {
            return Ok(None);
        }
        return Ok(Some(DecodingKey::from_secret(spec.secret.as_bytes())));
    }
    if spec.public_key_pem.is_empty() {
        return Ok(None);
    }
    let pem = spec.public_key_pem.as_bytes();
    let key = if is_ec(alg) {
        DecodingKey::from_ec_pem(pem).map_err(err)?
    } else if is_ed(alg) {
        DecodingKey::from_ed_pem(pem).map_err(err)?
    } else {
        DecodingKey::from_rsa_pem(pem).map_err(err)?
    };
    Ok(Some(key))
}

fn encoding_key(spec: &KeySpec, alg: Algorithm) -> Result<Option<EncodingKey>, AuthError> {
    let err = |e: jsonwebtoken::errors::Error| {
        AuthError::CreateComponent(format!("invalid signing key {:?}: {}", spec.kid, e))
    };
    if is_hmac(alg) {
        if spec.secret.is_empty() {
            return Ok(None);
        }
        return Ok(Some(EncodingKey::from_secret(spec.secret.as_bytes())));
    }
    if spec.private_key_pem.is_empty() {
        return Ok(None);
    }
    let pem = spec.private_key_pem.as_bytes();
    let key = if is_ec(alg) {
        EncodingKey::from_ec_pem(pem).map_err(err)?
    } else if is_ed(alg) {
        EncodingKey::from_ed_pem(pem).map_err(err)?
    } else {
        EncodingKey::from_rsa_pem(pem).map_err(err)?
    };
    Ok(Some(key))
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

impl JwtHandler {
    /// Builds the keyring. The first key with private material (or an HMAC
    /// secret) becomes the signing key.
    pub fn from_spec(spec: &JwtHandlerSpec) -> Result<Self, AuthError> {
        let mut signer = None;
        let mut verifiers = Vec::new();

        for key in &spec.keys {
            let alg = parse_algorithm(&key.algorithm)?;
            if let Some(dk) = decoding_key(key, alg)? {
                verifiers.push(VerifyingKey {
                    kid: non_empty(&key.kid),
                    alg,
                    key: dk,
                });
            }
            if signer.is_none()
                && let Some(ek) = encoding_key(key, alg)?
            {
                signer = Some(SigningKey {
                    kid: non_empty(&key.kid),
                    alg,
                    key: ek,
                });
            }
        }

        if signer.is_none() && verifiers.is_empty() {
            return Err(AuthError::CreateComponent(
                "jwt handler has no usable keys".to_string(),
            ));
        }

        Ok(Self { signer, verifiers })
    }

    /// Shared-secret keyring, handy for `client_secret_jwt` and tests.
    pub fn hmac(kid: Option<&str>, alg: Algorithm, secret: &[u8]) -> Self {
        Self {
            signer: Some(SigningKey {
                kid: kid.map(str::to_string),
                alg,
                key: EncodingKey::from_secret(secret),
            }),
            verifiers: vec![VerifyingKey {
                kid: kid.map(str::to_string),
                alg,
                key: DecodingKey::from_secret(secret),
            }],
        }
    }

    pub fn can_sign(&self) -> bool {
        self.signer.is_some()
    }

    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String, AuthError> {
        self.sign_typed(claims, "JWT")
    }

    /// Signs with an explicit `typ` header, e.g. `oauth-authz-req+jwt`.
    pub fn sign_typed<T: Serialize>(&self, claims: &T, typ: &str) -> Result<String, AuthError> {
        let signer = self.signer.as_ref().ok_or_else(|| {
            AuthError::CreateComponent("jwt handler has no signing key".to_string())
        })?;
        let mut header = Header::new(signer.alg);
        header.kid = signer.kid.clone();
        header.typ = Some(typ.to_string());
        encode(&header, claims, &signer.key)
            .map_err(|e| AuthError::CreateRequest(format!("failed to sign jwt: {}", e)))
    }

    /// Verifies signature and registered claims and returns the claim set.
    pub fn parse(&self, token: &str, opts: &ParseOptions) -> Result<Claims, AuthError> {
        let header =
            decode_header(token).map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        if !opts.algorithms.is_empty() && !opts.algorithms.contains(&header.alg) {
            return Err(AuthError::InvalidToken(format!(
                "signing method {:?} not allowed",
                header.alg
            )));
        }

        let candidates = self.verifiers.iter().filter(|k| {
            k.alg == header.alg
                && match (&header.kid, &k.kid) {
                    (Some(want), Some(have)) => want == have,
                    _ => true,
                }
        });

        let mut last_err = None;
        for key in candidates {
            match decode::<Claims>(token, &key.key, &opts.validation(key.alg)) {
                Ok(data) => {
                    if opts.iat_required && !data.claims.contains_key("iat") {
                        return Err(AuthError::InvalidToken("iat claim missing".to_string()));
                    }
                    return Ok(data.claims);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(AuthError::InvalidToken(match last_err {
            Some(e) => e.to_string(),
            None => format!("no key for alg {:?} kid {:?}", header.alg, header.kid),
        }))
    }
}

/// Reads the payload of a compact JWS without verifying it.
/// Only for deciding how to report a failed parse.
pub fn peek_claims(token: &str) -> Option<Claims> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&bytes).ok()
}

pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
