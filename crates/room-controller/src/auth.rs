//! Identity-collaborator seam.
//!
//! Credential issuance lives outside this core: an external identity
//! service hands clients a session token carrying a user id, a display
//! name, and optionally an elevated role claim. The controller only
//! verifies tokens through [`AuthVerifier`] during the signaling
//! handshake.

use async_trait::async_trait;
use common::{Role, UserId};
use thiserror::Error;
use uuid::Uuid;

/// Claims extracted from a verified session token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub user_id: UserId,
    pub display_name: String,
    /// Elevated role asserted by the identity collaborator (e.g. a
    /// scheduled co-host). `None` means the room decides.
    pub role_claim: Option<Role>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid token")]
    InvalidToken,
}

/// Verifies session tokens issued by the identity collaborator.
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError>;
}

/// Development-only verifier accepting `"<uuid>:<name>[:co_host]"`
/// tokens. Real deployments plug in the identity collaborator's
/// verifier instead.
#[derive(Debug, Default)]
pub struct InsecureDevVerifier;

#[async_trait]
impl AuthVerifier for InsecureDevVerifier {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let mut parts = token.splitn(3, ':');
        let user_id = parts
            .next()
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .map(UserId)
            .ok_or(AuthError::InvalidToken)?;
        let display_name = match parts.next() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return Err(AuthError::InvalidToken),
        };
        let role_claim = match parts.next() {
            Some("co_host") => Some(Role::CoHost),
            Some(_) | None => None,
        };

        Ok(Claims {
            user_id,
            display_name,
            role_claim,
        })
    }
}
