//! PKCE (RFC 7636) helpers, S256 only.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

use crate::token::generate_token;

pub const CHALLENGE_METHOD: &str = "S256";

/// Fresh code verifier: 43 base64url characters from 32 random bytes.
///
/// # Errors
/// Returns an error if the OS RNG is unavailable.
pub fn generate_verifier() -> Result<String, rand::Error> {
    generate_token()
}

/// `base64url(SHA-256(verifier))` without padding.
#[must_use]
pub fn challenge_s256(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rfc7636_appendix_b_vector() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            challenge_s256(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn verifier_length_is_within_rfc_bounds() {
        let verifier = generate_verifier().unwrap();
        assert!((43..=128).contains(&verifier.len()));
    }
}
