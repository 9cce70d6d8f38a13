//! Fixtures shared by the unit tests.

use crate::config::{
    ClientSpec, JwtHandlerSpec, KeySpec, OAuthContextSpec, ProviderSpec, ValidationFlags,
};
use crate::context::OAuthContext;
use crate::jwt::{JwtHandler, now_unix};
use jsonwebtoken::Algorithm;
use serde_json::{Value, json};

pub const KEY: &str = "unit-test-hmac-key-unit-test-hmac-key";
pub const ISSUER: &str = "https://idp.example";
pub const CLIENT_ID: &str = "app";
pub const AUDIENCE: &str = "api";

pub fn mint(claims: Value) -> String {
    JwtHandler::hmac(None, Algorithm::HS256, KEY.as_bytes())
        .sign(&claims)
        .unwrap()
}

pub fn access_token(exp: i64) -> String {
    mint(json!({
        "iss": ISSUER,
        "aud": AUDIENCE,
        "azp": CLIENT_ID,
        "sub": "alice",
        "iat": now_unix(),
        "exp": exp,
    }))
}

/// A valid ID token for `alice`. Keys in `overrides` replace the defaults;
/// a `null` override removes the claim.
pub fn id_token(overrides: Value) -> String {
    let now = now_unix();
    let mut claims = json!({
        "iss": ISSUER,
        "aud": CLIENT_ID,
        "sub": "alice",
        "iat": now,
        "exp": now + 600,
    });
    if let (Some(base), Some(extra)) = (claims.as_object_mut(), overrides.as_object()) {
        for (k, v) in extra {
            if v.is_null() {
                base.remove(k);
            } else {
                base.insert(k.clone(), v.clone());
            }
        }
    }
    mint(claims)
}

pub fn context_spec(server: Option<&str>) -> OAuthContextSpec {
    OAuthContextSpec {
        name: "default".into(),
        provider: ProviderSpec {
            issuer: ISSUER.into(),
            base_url: server.unwrap_or("http://127.0.0.1:9").to_string(),
            authorization_endpoint: "/authorize".into(),
            token_endpoint: "/token".into(),
            userinfo_endpoint: "/userinfo".into(),
            introspect_endpoint: "/introspect".into(),
            revocation_endpoint: "/revoke".into(),
            ..Default::default()
        },
        client: ClientSpec {
            id: CLIENT_ID.into(),
            secret: "s3cret".into(),
            audience: AUDIENCE.into(),
            scopes: vec!["openid".into()],
            ..Default::default()
        },
        jwt: Some(JwtHandlerSpec {
            keys: vec![KeySpec {
                algorithm: "HS256".into(),
                secret: KEY.into(),
                ..Default::default()
            }],
        }),
        ..Default::default()
    }
}

pub fn context(server: Option<&str>, tweak: impl FnOnce(&mut OAuthContextSpec)) -> OAuthContext {
    context_with_flags(server, tweak, ValidationFlags::default())
}

pub fn context_with_flags(
    server: Option<&str>,
    tweak: impl FnOnce(&mut OAuthContextSpec),
    flags: ValidationFlags,
) -> OAuthContext {
    let mut spec = context_spec(server);
    tweak(&mut spec);
    OAuthContext::new(&spec, flags).unwrap()
}
