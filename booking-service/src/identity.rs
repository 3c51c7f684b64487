use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use shared::*;
use std::sync::Arc;
use tracing::debug;
use crate::store::SeatStore;

/// Turns request credentials into a verified caller.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate(&self, bearer_token: &str) -> Result<Caller, BookingError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User email.
    pub sub: String,
    pub exp: usize,
}

/// Verifies HS256 access tokens and resolves the subject against the user store.
pub struct JwtIdentity {
    key: DecodingKey,
    validation: Validation,
    store: Arc<dyn SeatStore>,
}

impl JwtIdentity {
    pub fn new(secret: &str, store: Arc<dyn SeatStore>) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            store,
        }
    }
}

#[async_trait]
impl IdentityProvider for JwtIdentity {
    async fn authenticate(&self, bearer_token: &str) -> Result<Caller, BookingError> {
        let claims = decode::<Claims>(bearer_token, &self.key, &self.validation)
            .map_err(|e| {
                debug!("Rejected token: {}", e);
                BookingError::Unauthorized
            })?
            .claims;

        let user = self
            .store
            .find_user_by_email(&claims.sub)
            .await?
            .ok_or(BookingError::Unauthorized)?;

        if !user.is_active {
            return Err(BookingError::Forbidden);
        }

        Ok(Caller {
            user_id: user.id,
            role: user.role,
        })
    }
}

#[cfg(test)]
pub(crate) fn issue_token(secret: &str, email: &str) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let claims = Claims {
        sub: email.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
}
