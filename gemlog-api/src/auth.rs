use anyhow::Context;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};

use crate::{Error, Time, UserId, Uuid};

pub const SESSION_VALIDITY_DAYS: i64 = 7;

pub const BCRYPT_COST: u32 = 10;

/// Signed session token, handed out at login and sent back as a bearer token
#[derive(Clone, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(transparent)]
pub struct AuthToken(pub String);

#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct Claims {
    id: Uuid,
    iat: i64,
    exp: i64,
}

/// Key used to sign and check session tokens
///
/// Built once from the configured secret; there is no fallback secret.
#[derive(Clone)]
pub struct SessionKey {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl SessionKey {
    pub fn new(secret: &[u8]) -> SessionKey {
        SessionKey {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    pub fn issue(&self, user: UserId, now: Time) -> anyhow::Result<AuthToken> {
        let claims = Claims {
            id: user.0,
            iat: now.timestamp(),
            exp: (now + chrono::Duration::days(SESSION_VALIDITY_DAYS)).timestamp(),
        };
        let token = jsonwebtoken::encode(&Header::default(), &claims, &self.encoding)
            .with_context(|| format!("signing session token for {:?}", user))?;
        Ok(AuthToken(token))
    }

    pub fn verify(&self, token: &str) -> Result<UserId, Error> {
        match jsonwebtoken::decode::<Claims>(token, &self.decoding, &Validation::default()) {
            Ok(data) => Ok(UserId(data.claims.id)),
            Err(err) => {
                tracing::debug!(?err, "session token verification failed");
                Err(Error::unauthenticated("Invalid token"))
            }
        }
    }
}

pub fn hash_password(password: &str, cost: u32) -> anyhow::Result<String> {
    bcrypt::hash(password, cost).context("hashing password")
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}
