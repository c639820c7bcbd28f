use sha2::{Digest, Sha256};
use uuid::Uuid;

const MAX_MESSAGE_CHARS: usize = 500;

pub fn uuid_v7_without_dashes() -> String {
    Uuid::now_v7().simple().to_string()
}

pub fn prefixed_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid_v7_without_dashes())
}

pub fn sha256_hex(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Joins identifiers into a `:`-separated storage key. `%` and `:` inside a
/// part are percent-encoded so distinct part lists never share a key.
pub fn join_key_parts<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut key = String::new();
    for (index, part) in parts.into_iter().enumerate() {
        if index > 0 {
            key.push(':');
        }
        for ch in part.chars() {
            match ch {
                '%' => key.push_str("%25"),
                ':' => key.push_str("%3A"),
                other => key.push(other),
            }
        }
    }
    key
}

/// Human-readable error text bounded for storage on run and item records.
pub fn truncate_message(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.chars().count() <= MAX_MESSAGE_CHARS {
        return trimmed.to_string();
    }
    let mut truncated: String = trimmed.chars().take(MAX_MESSAGE_CHARS - 3).collect();
    truncated.push_str("...");
    truncated
}
