//! URL-safe random tokens for job ids, auth codes, and client tokens.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

/// Returns a random URL-safe string of the given length.
///
/// Job ids double as EC2 client tokens, which are capped at 64 characters,
/// so callers ask for exactly the length they need.
pub fn generate(length: usize) -> String {
    let mut bytes = vec![0u8; length];
    OsRng.fill_bytes(&mut bytes);

    // base64 expands 3 bytes to 4 chars, so encoding `length` bytes always
    // yields at least `length` characters.
    let mut encoded = URL_SAFE_NO_PAD.encode(&bytes);
    encoded.truncate(length);
    encoded
}
