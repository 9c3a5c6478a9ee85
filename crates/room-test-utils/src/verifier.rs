//! Static token verifier: the identity collaborator for tests.

use async_trait::async_trait;
use common::{Role, UserId};
use room_controller::auth::{AuthError, AuthVerifier, Claims};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Verifier backed by a registered token→claims map. Unknown tokens
/// are rejected, like an identity service would.
#[derive(Debug, Default)]
pub struct StaticVerifier {
    users: Mutex<HashMap<String, Claims>>,
}

impl StaticVerifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user and return their (token, user id) pair.
    pub fn register(&self, display_name: &str, role_claim: Option<Role>) -> (String, UserId) {
        let token = Uuid::new_v4().to_string();
        let user_id = UserId::new();
        self.lock().insert(
            token.clone(),
            Claims {
                user_id,
                display_name: display_name.to_string(),
                role_claim,
            },
        );
        (token, user_id)
    }

    /// Invalidate a token (for auth-failure tests).
    pub fn revoke(&self, token: &str) {
        self.lock().remove(token);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Claims>> {
        self.users
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl AuthVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        self.lock().get(token).cloned().ok_or(AuthError::InvalidToken)
    }
}
