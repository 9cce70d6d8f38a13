use crate::client::Params;
use crate::config::PkceMethod;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Random bytes behind each state, nonce and code verifier.
const ENTROPY_BYTES: usize = 84;

/// Values binding an authorization request to its callback.
/// `method` and `challenge` are derived and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrfStates {
    #[serde(rename = "State", default)]
    pub state: String,
    #[serde(rename = "Nonce", default)]
    pub nonce: String,
    #[serde(rename = "Verifier", default)]
    pub verifier: String,
    #[serde(skip)]
    pub method: String,
    #[serde(skip)]
    pub challenge: String,
}

impl CsrfStates {
    /// Appends the non-empty values as authorization request parameters.
    pub fn set(&self, query: &mut Params) {
        for (key, value) in [
            ("state", &self.state),
            ("nonce", &self.nonce),
            ("code_challenge_method", &self.method),
            ("code_challenge", &self.challenge),
        ] {
            if !value.is_empty() {
                query.push((key.to_string(), value.clone()));
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CsrfStateGenerator {
    pub disable_state: bool,
    pub disable_nonce: bool,
    pub disable_pkce: bool,
    pub pkce_method: PkceMethod,
}

fn random_value() -> String {
    let mut buf = [0u8; ENTROPY_BYTES];
    rand::rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

pub fn s256_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

impl CsrfStateGenerator {
    pub fn generate(&self) -> CsrfStates {
        let mut states = CsrfStates::default();
        if !self.disable_state {
            states.state = random_value();
        }
        if !self.disable_nonce {
            states.nonce = random_value();
        }
        if !self.disable_pkce {
            states.verifier = random_value();
            match self.pkce_method {
                PkceMethod::Plain => {
                    states.method = "plain".to_string();
                    states.challenge = states.verifier.clone();
                }
                PkceMethod::S256 => {
                    states.method = "S256".to_string();
                    states.challenge = s256_challenge(&states.verifier);
                }
            }
        }
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_enabled_s256() {
        let states = CsrfStateGenerator::default().generate();
        assert_eq!(states.state.len(), 112);
        assert_eq!(states.nonce.len(), 112);
        assert_eq!(states.verifier.len(), 112);
        assert_eq!(states.method, "S256");
        assert_eq!(states.challenge, s256_challenge(&states.verifier));
        assert_ne!(states.state, states.nonce);
        assert_eq!(URL_SAFE_NO_PAD.decode(&states.state).unwrap().len(), ENTROPY_BYTES);
    }

    #[test]
    fn test_plain_challenge_is_verifier() {
        let states = CsrfStateGenerator {
            pkce_method: PkceMethod::Plain,
            ..Default::default()
        }
        .generate();
        assert_eq!(states.method, "plain");
        assert_eq!(states.challenge, states.verifier);
    }

    #[test]
    fn test_disabled_values_are_empty() {
        let states = CsrfStateGenerator {
            disable_state: true,
            disable_nonce: true,
            disable_pkce: true,
            pkce_method: PkceMethod::S256,
        }
        .generate();
        assert_eq!(states, CsrfStates::default());

        let mut query = Vec::new();
        states.set(&mut query);
        assert!(query.is_empty());
    }

    #[test]
    fn test_known_s256_vector() {
        // RFC 7636 appendix B
        assert_eq!(
            s256_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_set_and_persisted_shape() {
        let states = CsrfStateGenerator {
            disable_nonce: true,
            ..Default::default()
        }
        .generate();
        let mut query = Vec::new();
        states.set(&mut query);
        let keys: Vec<&str> = query.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["state", "code_challenge_method", "code_challenge"]);

        let json = serde_json::to_value(&states).unwrap();
        assert!(json.get("challenge").is_none());
        let back: CsrfStates = serde_json::from_value(json).unwrap();
        assert_eq!(back.verifier, states.verifier);
        assert!(back.challenge.is_empty());
    }
}
