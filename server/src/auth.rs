//! Bearer-token verification for the connection handshake.
//!
//! Tokens have the shape `v1.<user id>.<expiry unix secs>.<hex signature>`
//! where the signature is HMAC-SHA256 over the first three segments with
//! the shared secret. The gate only verifies; issuance belongs to the auth
//! collaborator, and `sign` exists for tests and operational tooling.

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::GameError;
use crate::hex;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_PREFIX: &str = "v1";

#[derive(Debug, Clone)]
pub struct Claims {
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

pub struct AuthGate {
    secret: Vec<u8>,
}

impl AuthGate {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        AuthGate { secret: secret.into() }
    }

    /// Verify signature and expiry, producing the stable user id.
    pub fn verify(&self, token: &str) -> Result<Claims, GameError> {
        let mut parts = token.split('.');
        let (Some(prefix), Some(user), Some(expiry), Some(sig), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(GameError::Unauthorised);
        };
        if prefix != TOKEN_PREFIX {
            return Err(GameError::Unauthorised);
        }
        let user_id = Uuid::parse_str(user).map_err(|_| GameError::Unauthorised)?;
        let expires: i64 = expiry.parse().map_err(|_| GameError::Unauthorised)?;
        let signature = hex::decode(sig).ok_or(GameError::Unauthorised)?;

        let mut mac = self.mac();
        mac.update(format!("{prefix}.{user}.{expiry}").as_bytes());
        mac.verify_slice(&signature).map_err(|_| GameError::Unauthorised)?;

        let expires_at = Utc
            .timestamp_opt(expires, 0)
            .single()
            .ok_or(GameError::Unauthorised)?;
        if expires_at <= Utc::now() {
            return Err(GameError::Unauthorised);
        }
        Ok(Claims { user_id, expires_at })
    }

    /// Mint a token for the given user.
    pub fn sign(&self, user_id: Uuid, expires_at: DateTime<Utc>) -> String {
        let payload = format!("{TOKEN_PREFIX}.{user_id}.{}", expires_at.timestamp());
        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes().as_slice());
        format!("{payload}.{signature}")
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length.
        HmacSha256::new_from_slice(&self.secret).expect("HMAC key length")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn gate() -> AuthGate {
        AuthGate::new(b"test-secret".to_vec())
    }

    #[test]
    fn signed_token_verifies() {
        let user = Uuid::new_v4();
        let token = gate().sign(user, Utc::now() + Duration::hours(1));
        let claims = gate().verify(&token).unwrap();
        assert_eq!(claims.user_id, user);
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = gate().sign(Uuid::new_v4(), Utc::now() - Duration::seconds(1));
        assert_eq!(gate().verify(&token).unwrap_err(), GameError::Unauthorised);
    }

    #[test]
    fn tampered_token_is_rejected() {
        let user = Uuid::new_v4();
        let token = gate().sign(user, Utc::now() + Duration::hours(1));
        let other = Uuid::new_v4();
        let forged = token.replacen(&user.to_string(), &other.to_string(), 1);
        assert_eq!(gate().verify(&forged).unwrap_err(), GameError::Unauthorised);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = gate().sign(Uuid::new_v4(), Utc::now() + Duration::hours(1));
        let other = AuthGate::new(b"other-secret".to_vec());
        assert_eq!(other.verify(&token).unwrap_err(), GameError::Unauthorised);
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(gate().verify("").unwrap_err(), GameError::Unauthorised);
        assert_eq!(gate().verify("v1.not-a-uuid.0.00").unwrap_err(), GameError::Unauthorised);
        assert_eq!(gate().verify("v2.a.b.c.d").unwrap_err(), GameError::Unauthorised);
    }
}
