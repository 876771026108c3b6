use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Compute the content fingerprint of a payload: the URL-safe base64 encoding of the
/// SHA-256 digest of its canonical JSON serialization.
///
/// Object keys are serialized in sorted order, so two payloads holding the same data
/// always hash to the same value regardless of how they were built.
pub fn fingerprint(payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical(payload).as_bytes());
    URL_SAFE.encode(hasher.finalize())
}

fn canonical(payload: &Value) -> String {
    // serde_json::Map is a BTreeMap unless `preserve_order` is enabled, which would
    // break the sorted-key guarantee.
    payload.to_string()
}
