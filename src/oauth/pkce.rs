//! PKCE (RFC 7636) and state token generation.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// The only challenge method this crate sends.
pub const CHALLENGE_METHOD: &str = "S256";

/// 32 random bytes, base64url without padding (43 characters).
fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Opaque, unguessable OAuth `state` value.
pub fn generate_state() -> String {
    random_token()
}

/// Verifier kept on the session until token exchange.
pub fn generate_code_verifier() -> String {
    random_token()
}

/// `BASE64URL(SHA256(verifier))`
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}
