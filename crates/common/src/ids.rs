//! Opaque identifier helpers.

/// Mint a new entity id (UUIDv4, lowercase hyphenated).
#[must_use]
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Mint a short hex token of `n` bytes (2n hex chars).
#[must_use]
pub fn short_hex(n: usize) -> String {
    let id = uuid::Uuid::new_v4();
    let hex: String = id.as_bytes().iter().map(|b| format!("{b:02x}")).collect();
    hex[..(n * 2).min(hex.len())].to_string()
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ids_are_unique() {
        assert_ne!(new_id(), new_id());
    }

    #[test]
    fn short_hex_length() {
        assert_eq!(short_hex(4).len(), 8);
        assert!(short_hex(4).chars().all(|c| c.is_ascii_hexdigit()));
    }
}
