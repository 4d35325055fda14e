//! Handshake identity. Verification itself is an external collaborator: we
//! hand a credential token to an `IdentityVerifier` and get back a stable
//! user id or a refusal. The file-backed verifier below is what dev and
//! single-node deployments run with; anything talking to a real identity
//! provider implements the same trait outside the core.

use std::collections::HashMap;
use std::fs;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::ServerError;
use crate::game::UserId;

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Resolves a handshake credential to a user id, or rejects.
    async fn verify_token(&self, token: &str) -> Result<UserId, ServerError>;

    /// Whether the legacy `userId` handshake field is accepted as-is.
    fn allows_legacy_user_id(&self) -> bool {
        false
    }
}

#[derive(Deserialize)]
struct TokenFile {
    /// token -> user id
    tokens: HashMap<String, String>,
    #[serde(default)]
    allow_legacy_user_id: bool,
}

/// Verifier backed by a static TOML token table.
pub struct TrustedTokenVerifier {
    tokens: HashMap<String, UserId>,
    allow_legacy: bool,
}

impl TrustedTokenVerifier {
    pub fn from_file(path: &str) -> Result<TrustedTokenVerifier, String> {
        let text = fs::read_to_string(path)
            .map_err(|_| format!("could not read token file at path: {path}"))?;
        let file: TokenFile = toml::from_str(&text)
            .map_err(|e| format!("could not parse token file at path: {path}\nCaused by: {e:?}"))?;
        Ok(TrustedTokenVerifier {
            tokens: file
                .tokens
                .into_iter()
                .map(|(token, user)| (token, UserId(user)))
                .collect(),
            allow_legacy: file.allow_legacy_user_id,
        })
    }

    /// Accepts every `userId` handshake without a token table. Dev mode only.
    pub fn permissive() -> TrustedTokenVerifier {
        TrustedTokenVerifier {
            tokens: HashMap::new(),
            allow_legacy: true,
        }
    }
}

#[async_trait]
impl IdentityVerifier for TrustedTokenVerifier {
    async fn verify_token(&self, token: &str) -> Result<UserId, ServerError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(ServerError::NotAllowed)
    }

    fn allows_legacy_user_id(&self) -> bool {
        self.allow_legacy
    }
}
