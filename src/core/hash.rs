use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Stable finding row id; enforces one row per (asset, plugin, session).
pub fn finding_id(fingerprint: &str, plugin_id: &str, session_id: &str) -> String {
    let payload = format!("{}|{}|{}", fingerprint, plugin_id, session_id);
    format!("find_{}", sha256_hex(payload.as_bytes()))
}

pub fn session_id(source_hash: &str) -> String {
    format!("scan_{}", sha256_hex(source_hash.as_bytes()))
}

pub fn snapshot_id(session_id: &str) -> String {
    format!("snap_{}", sha256_hex(session_id.as_bytes()))
}

pub fn hash_file(path: &std::path::Path) -> anyhow::Result<String> {
    let data = std::fs::read(path)?;
    Ok(sha256_hex(&data))
}
