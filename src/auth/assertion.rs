//! App identity and the short-lived signed assertions it produces.
//!
//! GitHub rejects app JWTs whose lifetime exceeds ten minutes; the monitor
//! only ever uses an assertion once, immediately, so a one-minute lifetime is
//! plenty.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::error::{MonitorError, Result};

/// Lifetime of a signed assertion, in seconds.
pub const ASSERTION_LIFETIME_SECS: i64 = 60;

/// Anything that can mint an app assertion.  The token manager only depends
/// on this trait so tests can swap in a canned signer.
pub trait AssertionSigner: Send + Sync {
    fn sign_assertion(&self, now: DateTime<Utc>) -> Result<String>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iat: i64,
    exp: i64,
    iss: String,
}

/// The app id plus the RSA key it signs with.  Loaded once at startup.
#[derive(Clone)]
pub struct AppIdentity {
    id: String,
    key: EncodingKey,
}

impl fmt::Debug for AppIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppIdentity")
            .field("id", &self.id)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl AppIdentity {
    pub fn from_pem(id: impl Into<String>, pem: &[u8]) -> Result<Self> {
        let key = EncodingKey::from_rsa_pem(pem)?;
        Ok(Self { id: id.into(), key })
    }

    /// Read a PEM encoded RSA private key from disk.
    pub fn load(id: impl Into<String>, path: &Path) -> Result<Self> {
        let pem = std::fs::read(path).map_err(|e| MonitorError::KeyLoad {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_pem(id, &pem).map_err(|e| MonitorError::KeyLoad {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl AssertionSigner for AppIdentity {
    fn sign_assertion(&self, now: DateTime<Utc>) -> Result<String> {
        let claims = Claims {
            iat: now.timestamp(),
            exp: (now + Duration::seconds(ASSERTION_LIFETIME_SECS)).timestamp(),
            iss: self.id.clone(),
        };
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &self.key,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation};

    const PRIVATE_KEY: &str = include_str!("../../testdata/app-key.pem");
    const PUBLIC_KEY: &str = include_str!("../../testdata/app-key.pub.pem");

    #[test]
    fn assertion_is_rs256_with_one_minute_lifetime() {
        let identity = AppIdentity::from_pem("12345", PRIVATE_KEY.as_bytes()).unwrap();
        let now = Utc::now();
        let jwt = identity.sign_assertion(now).unwrap();

        let header = jsonwebtoken::decode_header(&jwt).unwrap();
        assert_eq!(header.alg, Algorithm::RS256);

        let key = DecodingKey::from_rsa_pem(PUBLIC_KEY.as_bytes()).unwrap();
        let data = jsonwebtoken::decode::<Claims>(&jwt, &key, &Validation::new(Algorithm::RS256))
            .unwrap();
        assert_eq!(data.claims.iss, "12345");
        assert_eq!(data.claims.iat, now.timestamp());
        assert_eq!(data.claims.exp - data.claims.iat, ASSERTION_LIFETIME_SECS);
    }

    #[test]
    fn garbage_key_is_rejected() {
        let err = AppIdentity::from_pem("1", b"not a key").unwrap_err();
        assert!(matches!(err, MonitorError::Signing(_)));
    }

    #[test]
    fn missing_key_file_is_key_load_error() {
        let err = AppIdentity::load("1", Path::new("/nonexistent/app.pem")).unwrap_err();
        assert!(matches!(err, MonitorError::KeyLoad { .. }));
    }

    #[test]
    fn debug_output_hides_the_key() {
        let identity = AppIdentity::from_pem("7", PRIVATE_KEY.as_bytes()).unwrap();
        let debug = format!("{identity:?}");
        assert!(debug.contains("redacted"));
        assert!(!debug.contains("PRIVATE"));
    }
}
