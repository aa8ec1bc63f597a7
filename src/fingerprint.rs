// 🔑 Fingerprint Generator - content-derived identity for deduplication
//
// NOTE: This is for DEDUPLICATION, not IDENTITY!
// Identity = Transaction.id (UUID), Deduplication = fingerprint.
//
// The base digest covers (user, date, description, amount). Two coffees on
// the same day share a base digest; the reconciliation engine tells them
// apart with an occurrence index.

use crate::models::UserId;
use chrono::NaiveDate;
use sha2::{Digest, Sha256};

/// Field separator inside the hashed payload (ASCII unit separator)
const FIELD_SEP: &str = "\u{1f}";

/// Lowercase, collapse whitespace, strip leading/trailing punctuation
pub fn normalize_description(description: &str) -> String {
    let collapsed = description
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    collapsed
        .trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace())
        .to_string()
}

/// SHA-256 hex over the normalized tuple
pub fn base_fingerprint(user_id: &UserId, date: NaiveDate, description: &str, amount: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_str());
    hasher.update(FIELD_SEP);
    hasher.update(date.format("%Y-%m-%d").to_string());
    hasher.update(FIELD_SEP);
    hasher.update(normalize_description(description));
    hasher.update(FIELD_SEP);
    hasher.update(amount.to_string());
    format!("{:x}", hasher.finalize())
}

/// `base:occurrence`
pub fn final_fingerprint(base: &str, occurrence: u32) -> String {
    format!("{}:{}", base, occurrence)
}

/// Split a final fingerprint back into (base, occurrence)
pub fn split_fingerprint(fingerprint: &str) -> Option<(&str, u32)> {
    let (base, occurrence) = fingerprint.rsplit_once(':')?;
    Some((base, occurrence.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_deterministic() {
        let user = UserId::new("user-1");
        let a = base_fingerprint(&user, d(2024, 1, 5), "Coffee Shop", -450);
        let b = base_fingerprint(&user, d(2024, 1, 5), "Coffee Shop", -450);

        assert_eq!(a, b);
        assert_eq!(a.len(), 64, "SHA-256 hash should be 64 hex characters");
    }

    #[test]
    fn test_case_and_spacing_insensitive() {
        let user = UserId::new("user-1");
        let a = base_fingerprint(&user, d(2024, 1, 5), "Coffee Shop", -450);
        let b = base_fingerprint(&user, d(2024, 1, 5), "  COFFEE   shop.", -450);
        assert_eq!(a, b);
    }

    #[test]
    fn test_each_field_matters() {
        let user = UserId::new("user-1");
        let base = base_fingerprint(&user, d(2024, 1, 5), "Coffee Shop", -450);

        assert_ne!(base, base_fingerprint(&UserId::new("user-2"), d(2024, 1, 5), "Coffee Shop", -450));
        assert_ne!(base, base_fingerprint(&user, d(2024, 1, 6), "Coffee Shop", -450));
        assert_ne!(base, base_fingerprint(&user, d(2024, 1, 5), "Tea Shop", -450));
        assert_ne!(base, base_fingerprint(&user, d(2024, 1, 5), "Coffee Shop", 450));
    }

    #[test]
    fn test_normalize_description() {
        assert_eq!(normalize_description("  **Coffee  Shop!! "), "coffee shop");
        assert_eq!(normalize_description("AMAZON.COM*MK1"), "amazon.com*mk1");
        assert_eq!(normalize_description("..."), "");
    }

    #[test]
    fn test_final_fingerprint_round_trip() {
        let fp = final_fingerprint("abc123", 2);
        assert_eq!(fp, "abc123:2");
        assert_eq!(split_fingerprint(&fp), Some(("abc123", 2)));
        assert_eq!(split_fingerprint("no-index"), None);
    }
}
