// PKCE helper for authorization-code flows (RFC 7636, S256 only)

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Minimum / maximum verifier length permitted by RFC 7636
const MIN_VERIFIER_LEN: usize = 43;
const MAX_VERIFIER_LEN: usize = 128;

/// Generate a code verifier: 32 random bytes, base64url without padding
/// (43 characters, 256 bits of entropy).
pub fn generate_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compute the S256 challenge for a verifier.
pub fn challenge_s256(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Validate a verifier against a previously issued challenge.
///
/// The comparison is constant-time; malformed verifiers are rejected before
/// hashing.
pub fn verify(verifier: &str, challenge: &str) -> bool {
    if verifier.len() < MIN_VERIFIER_LEN || verifier.len() > MAX_VERIFIER_LEN {
        return false;
    }
    if !verifier
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~'))
    {
        return false;
    }

    let expected = challenge_s256(verifier);
    expected.as_bytes().ct_eq(challenge.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_verifier_shape() {
        let verifier = generate_verifier();
        assert_eq!(verifier.len(), 43);
        assert!(verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_')));
    }

    #[test]
    fn test_verify_roundtrip() {
        let verifier = generate_verifier();
        let challenge = challenge_s256(&verifier);
        assert!(verify(&verifier, &challenge));
    }

    #[test]
    fn test_verify_rejects_wrong_verifier() {
        let challenge = challenge_s256(&generate_verifier());
        assert!(!verify(&generate_verifier(), &challenge));
    }

    #[test]
    fn test_verify_rejects_malformed_verifier() {
        let challenge = challenge_s256("x");
        assert!(!verify("too-short", &challenge));
        assert!(!verify(&"a".repeat(129), &challenge));
        assert!(!verify(&format!("{}!", "a".repeat(42)), &challenge));
    }

    #[test]
    fn test_rfc7636_appendix_b_vector() {
        // Test vector from RFC 7636 appendix B
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let challenge = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";
        assert_eq!(challenge_s256(verifier), challenge);
        assert!(verify(verifier, challenge));
    }
}
