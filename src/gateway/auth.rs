//! Authentication utilities for the exchange API
//!
//! Implements HMAC-SHA256 request signing. The API secret is stored
//! base64-encoded; the signature is computed over
//! `timestamp + method + path + body` and base64-encoded back.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Sign a REST request.
///
/// `timestamp` is unix seconds as a decimal string; `path` includes the
/// leading slash and any query string.
pub fn sign_request(secret: &str, timestamp: &str, method: &str, path: &str, body: &str) -> String {
    let key = BASE64
        .decode(secret)
        .unwrap_or_else(|_| secret.as_bytes().to_vec());
    let mut mac = HmacSha256::new_from_slice(&key).expect("HMAC can take key of any size");
    mac.update(timestamp.as_bytes());
    mac.update(method.as_bytes());
    mac.update(path.as_bytes());
    mac.update(body.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Sign a WebSocket channel subscription: `timestamp + channel + product_ids`.
pub fn sign_subscription(secret: &str, timestamp: &str, channel: &str, product_ids: &[String]) -> String {
    let key = BASE64
        .decode(secret)
        .unwrap_or_else(|_| secret.as_bytes().to_vec());
    let mut mac = HmacSha256::new_from_slice(&key).expect("HMAC can take key of any size");
    mac.update(timestamp.as_bytes());
    mac.update(channel.as_bytes());
    mac.update(product_ids.join(",").as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// API credentials container
#[derive(Debug, Clone)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Create credentials from environment variables
    ///
    /// Looks for `EXCHANGE_API_KEY` and `EXCHANGE_API_SECRET`
    pub fn from_env() -> Result<Self, std::env::VarError> {
        let api_key = std::env::var("EXCHANGE_API_KEY")?;
        let api_secret = std::env::var("EXCHANGE_API_SECRET")?;
        Ok(Self::new(api_key, api_secret))
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn api_secret(&self) -> &str {
        &self.api_secret
    }

    pub fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> String {
        sign_request(&self.api_secret, timestamp, method, path, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_request_is_base64() {
        let signature = sign_request("test_secret", "1234567890", "GET", "/api/orders", "");
        assert!(BASE64.decode(&signature).is_ok());
        // SHA256 digest is 32 bytes
        assert_eq!(BASE64.decode(&signature).unwrap().len(), 32);
    }

    #[test]
    fn test_sign_consistency() {
        let sig1 = sign_request("s", "1", "POST", "/api/orders", "{}");
        let sig2 = sign_request("s", "1", "POST", "/api/orders", "{}");
        assert_eq!(sig1, sig2);
    }

    #[test]
    fn test_different_inputs_produce_different_signatures() {
        let base = sign_request("s", "1", "POST", "/api/orders", "{}");
        assert_ne!(base, sign_request("other", "1", "POST", "/api/orders", "{}"));
        assert_ne!(base, sign_request("s", "2", "POST", "/api/orders", "{}"));
        assert_ne!(base, sign_request("s", "1", "GET", "/api/orders", "{}"));
        assert_ne!(base, sign_request("s", "1", "POST", "/api/fills", "{}"));
        assert_ne!(base, sign_request("s", "1", "POST", "/api/orders", "[]"));
    }

    #[test]
    fn test_credentials_sign_matches_free_function() {
        let creds = Credentials::new("my_key", "my_secret");
        assert_eq!(
            creds.sign("1", "GET", "/p", ""),
            sign_request("my_secret", "1", "GET", "/p", "")
        );
        assert_eq!(creds.api_key(), "my_key");
    }
}
