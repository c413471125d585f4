use sha2::{Digest, Sha256};

/// Returns the lowercase hex sha256 digest of `content`.
pub fn sha256_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Builds a fallback message identity from content plus an observation timestamp.
///
/// Used when the host never assigned a stable identity to a message; the
/// timestamp keeps re-edited content from colliding with its earlier form.
pub fn fallback_message_identity(content: &str, timestamp_unix_ms: u64) -> String {
    let digest = sha256_hex(content);
    format!("hash:{}:{timestamp_unix_ms}", &digest[..16])
}
