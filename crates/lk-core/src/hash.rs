//! Content hashes for subscription records
//!
//! Uses 64-bit xxHash over a sorted line set, so the hash depends only on the
//! set contents and never on insertion order.
//!
//! # Encoding
//!
//! Every line is fed to the hasher followed by a `\n` separator, which keeps
//! `["ab", "c"]` and `["a", "bc"]` apart. The digest is rendered as 16
//! lower-case hex digits, the form stored inside the records.

use std::collections::BTreeMap;
use std::hash::Hasher;

use twox_hash::XxHash64;

use crate::types::meta_keys;

const HASH_SEED: u64 = 0x9e37_79b9_7f4a_7c15; // Golden ratio

/// Hash an arbitrary collection of lines.
/// The lines are sorted first, so any permutation yields the same digest.
pub fn content_hash<I, S>(lines: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut sorted: Vec<S> = lines.into_iter().collect();
    sorted.sort_by(|a, b| a.as_ref().cmp(b.as_ref()));

    let mut hasher = XxHash64::with_seed(HASH_SEED);
    for line in &sorted {
        hasher.write(line.as_ref().as_bytes());
        hasher.write_u8(b'\n');
    }
    format!("{:016x}", hasher.finish())
}

/// Hash all metadata pairs except the stored hash itself.
pub fn metadata_hash(meta: &BTreeMap<String, String>) -> String {
    content_hash(
        meta.iter()
            .filter(|(key, _)| key.as_str() != meta_keys::META_HASH)
            .map(|(key, value)| format!("{}:{}", key, value)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_consistent() {
        let h1 = content_hash(["||ads.example^", "##.banner"]);
        let h2 = content_hash(["||ads.example^", "##.banner"]);
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_content_hash_order_independent() {
        let h1 = content_hash(["a", "b", "c"]);
        let h2 = content_hash(["c", "a", "b"]);
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_content_hash_separates_lines() {
        assert_ne!(content_hash(["ab", "c"]), content_hash(["a", "bc"]));
    }

    #[test]
    fn test_content_hash_detects_changes() {
        assert_ne!(content_hash(["||a.example^"]), content_hash(["||b.example^"]));
    }

    #[test]
    fn test_content_hash_hex_format() {
        let h = content_hash(Vec::<String>::new());
        assert_eq!(h.len(), 16);
        assert!(h.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
    }

    #[test]
    fn test_metadata_hash_ignores_stored_hash() {
        let mut meta = BTreeMap::new();
        meta.insert("title".to_string(), "EasyList".to_string());
        meta.insert("_enabled".to_string(), "true".to_string());
        let before = metadata_hash(&meta);

        meta.insert(meta_keys::META_HASH.to_string(), "0123456789abcdef".to_string());
        assert_eq!(metadata_hash(&meta), before);
    }

    #[test]
    fn test_metadata_hash_covers_values() {
        let mut meta = BTreeMap::new();
        meta.insert("_enabled".to_string(), "true".to_string());
        let enabled = metadata_hash(&meta);
        meta.insert("_enabled".to_string(), "false".to_string());
        assert_ne!(metadata_hash(&meta), enabled);
    }
}
