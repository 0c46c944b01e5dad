use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Filename-safe SHA-256 digest of `input`, URL-safe base64 with padding.
pub fn url_safe_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    URL_SAFE.encode(digest)
}
