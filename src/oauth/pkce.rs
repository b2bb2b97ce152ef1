//! PKCE S256 challenge generation (RFC 7636)
//!
//! The PKCE authorization flow sends a derived `code_challenge` with the
//! authorization request and proves possession of the underlying
//! `code_verifier` during the token exchange. Only the `S256` method is
//! produced here; the `plain` method offers no protection and is never
//! used.

use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// The challenge method sent alongside every challenge from this module.
pub const CHALLENGE_METHOD: &str = "S256";

/// A PKCE challenge pair.
///
/// The `verifier` is persisted by the broker until the token exchange
/// consumes it; the `challenge` travels in the authorization URL.
///
/// # Examples
///
/// ```
/// use mcp_remote::oauth::pkce;
///
/// let pair = pkce::generate().expect("generation is infallible in practice");
/// assert_eq!(pair.verifier.len(), 43);
/// assert_ne!(pair.verifier, pair.challenge);
/// ```
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    /// base64url (no padding) encoding of 32 random bytes; 43 characters.
    pub verifier: String,
    /// base64url (no padding) encoding of `SHA256(verifier)`.
    pub challenge: String,
}

/// Generates a fresh PKCE S256 challenge pair.
///
/// # Errors
///
/// Infallible in practice; the `Result` keeps call sites uniform with the
/// rest of the authorization flow.
pub fn generate() -> Result<PkceChallenge> {
    use rand::RngCore as _;

    let mut random_bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut random_bytes);

    let verifier = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes);

    // RFC 7636 section 4.2: ASCII(BASE64URL(SHA256(ASCII(code_verifier)))).
    let digest = Sha256::digest(verifier.as_bytes());
    let challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest.as_slice());

    Ok(PkceChallenge { verifier, challenge })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verifier_is_43_base64url_characters() {
        let pair = generate().expect("generate");
        assert_eq!(pair.verifier.len(), 43);
        assert!(pair
            .verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert!(!pair.verifier.contains('='));
    }

    #[test]
    fn test_challenge_is_s256_of_verifier() {
        let pair = generate().expect("generate");
        let digest = Sha256::digest(pair.verifier.as_bytes());
        let expected = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest.as_slice());
        assert_eq!(pair.challenge, expected);
    }

    #[test]
    fn test_successive_pairs_are_unique() {
        let a = generate().expect("first");
        let b = generate().expect("second");
        assert_ne!(a.verifier, b.verifier);
        assert_ne!(a.challenge, b.challenge);
    }

    /// RFC 7636 Appendix B:
    ///   code_verifier  = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"
    ///   code_challenge = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
    #[test]
    fn test_s256_known_answer_rfc7636_appendix_b() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let digest = Sha256::digest(verifier.as_bytes());
        let challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest.as_slice());
        assert_eq!(challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }
}
