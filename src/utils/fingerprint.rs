// Session fingerprinting
// Binds a session to the context it was created from

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Generate a stable session fingerprint from the creation context.
///
/// The fingerprint is a full SHA-256 hex digest over the user id, the
/// initial user agent, and (when IP binding is enabled) the initial IP.
/// Validation recomputes the hash from the current request context and
/// compares in constant time.
pub fn generate_session_fingerprint(
    user_id: &str,
    user_agent: Option<&str>,
    ip_address: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b"|");
    hasher.update(user_agent.unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(ip_address.unwrap_or("").as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Constant-time string equality for fingerprints and similar digests.
pub fn fingerprints_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
