//! Deterministic, one-way key fingerprinting for ledger keying.
//!
//! Not an authentication mechanism — only used to give each secret key a
//! stable, short, non-reversible identifier in the rate-limit ledger.

use sha2::{Digest, Sha256};

pub fn fingerprint(api_key: &str) -> String {
    let digest = Sha256::digest(api_key.as_bytes());
    hex::encode(digest)[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_stable_for_equal_keys() {
        assert_eq!(fingerprint("AIzaSyTest"), fingerprint("AIzaSyTest"));
    }

    #[test]
    fn differs_for_different_keys() {
        assert_ne!(fingerprint("AIzaSyTest1"), fingerprint("AIzaSyTest2"));
    }

    #[test]
    fn is_sixteen_hex_chars() {
        let fp = fingerprint("some-secret-key");
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
