//! Session token verification. Tokens are issued by the identity service and
//! bind one account to one device.

use crate::error::{AppError, AppResult};
use crate::models::{DeviceId, UserId};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: UserId,
    pub device_id: DeviceId,
    pub exp: i64,
}

/// Verified subject of a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub device_id: DeviceId,
}

pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> AppResult<Identity>;
}

pub struct JwtTokenVerifier {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
}

impl JwtTokenVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Mint a token for `user` on `device`, valid for `ttl_secs`.
    pub fn issue(&self, user: UserId, device: &str, ttl_secs: i64) -> AppResult<String> {
        let claims = Claims {
            sub: user,
            device_id: device.to_string(),
            exp: Utc::now().timestamp() + ttl_secs,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).map_err(|e| {
            tracing::error!(error = %e, "failed to sign token");
            AppError::Internal
        })
    }
}

impl TokenVerifier for JwtTokenVerifier {
    fn verify(&self, token: &str) -> AppResult<Identity> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "token rejected");
            AppError::Unauthorized
        })?;
        if data.claims.device_id.trim().is_empty() {
            return Err(AppError::Unauthorized);
        }
        Ok(Identity {
            user_id: data.claims.sub,
            device_id: data.claims.device_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn issued_token_verifies() {
        let verifier = JwtTokenVerifier::new("secret");
        let user = Uuid::new_v4();
        let token = verifier.issue(user, "phone-1", 60).unwrap();
        assert_eq!(
            verifier.verify(&token).unwrap(),
            Identity {
                user_id: user,
                device_id: "phone-1".into()
            }
        );
    }

    #[test]
    fn expired_or_foreign_tokens_are_unauthorized() {
        let verifier = JwtTokenVerifier::new("secret");
        let expired = verifier.issue(Uuid::new_v4(), "phone", -10).unwrap();
        assert!(matches!(verifier.verify(&expired), Err(AppError::Unauthorized)));

        let other = JwtTokenVerifier::new("other-secret");
        let foreign = other.issue(Uuid::new_v4(), "phone", 60).unwrap();
        assert!(matches!(verifier.verify(&foreign), Err(AppError::Unauthorized)));

        assert!(matches!(verifier.verify("not-a-jwt"), Err(AppError::Unauthorized)));
    }

    #[test]
    fn blank_device_is_rejected() {
        let verifier = JwtTokenVerifier::new("secret");
        let token = verifier.issue(Uuid::new_v4(), "  ", 60).unwrap();
        assert!(verifier.verify(&token).is_err());
    }
}
