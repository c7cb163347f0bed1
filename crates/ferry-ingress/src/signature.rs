//! Webhook delivery signature validation.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

use crate::error::DispatchError;

type HmacSha256 = Hmac<Sha256>;

/// Validates the provider's HMAC-SHA256 signature header against a
/// per-installation shared secret.
///
/// The header carries `sha256=<hex>`; verification recomputes the MAC
/// over the raw body and compares in constant time.
pub struct SignatureValidator {
    secret: SecretString,
}

impl SignatureValidator {
    /// Wraps the installation's webhook secret.
    #[must_use]
    pub const fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    /// Verifies `header` against `body`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::InvalidSignatureFormat`] when the header is not
    /// `sha256=<hex>`, [`DispatchError::InvalidSignature`] when the MAC
    /// does not match.
    pub fn verify(&self, body: &[u8], header: &str) -> Result<(), DispatchError> {
        let encoded = header.strip_prefix("sha256=").ok_or_else(|| {
            DispatchError::InvalidSignatureFormat("expected sha256= prefix".to_owned())
        })?;
        let claimed = hex::decode(encoded)
            .map_err(|_| DispatchError::InvalidSignatureFormat("non-hex digest".to_owned()))?;

        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .expect("HMAC key of any length is accepted");
        mac.update(body);
        // verify_slice compares in constant time.
        mac.verify_slice(&claimed)
            .map_err(|_| DispatchError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signature_for(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn accepts_valid_signature() {
        let validator = SignatureValidator::new(SecretString::from("topsecret"));
        let body = b"{\"action\":\"created\"}";
        let header = signature_for("topsecret", body);
        assert!(validator.verify(body, &header).is_ok());
    }

    #[test]
    fn rejects_wrong_secret() {
        let validator = SignatureValidator::new(SecretString::from("topsecret"));
        let body = b"payload";
        let header = signature_for("othersecret", body);
        assert!(matches!(
            validator.verify(body, &header),
            Err(DispatchError::InvalidSignature)
        ));
    }

    #[test]
    fn rejects_tampered_body() {
        let validator = SignatureValidator::new(SecretString::from("topsecret"));
        let header = signature_for("topsecret", b"payload");
        assert!(matches!(
            validator.verify(b"payload2", &header),
            Err(DispatchError::InvalidSignature)
        ));
    }

    #[test]
    fn rejects_missing_prefix() {
        let validator = SignatureValidator::new(SecretString::from("topsecret"));
        assert!(matches!(
            validator.verify(b"x", "deadbeef"),
            Err(DispatchError::InvalidSignatureFormat(_))
        ));
    }

    #[test]
    fn rejects_non_hex_digest() {
        let validator = SignatureValidator::new(SecretString::from("topsecret"));
        assert!(matches!(
            validator.verify(b"x", "sha256=zzzz"),
            Err(DispatchError::InvalidSignatureFormat(_))
        ));
    }
}
