//! Canonical signing of update requests
//!
//! The reporting client authenticates each update by signing the request
//! fields with a shared secret: the fields plus the secret are joined as
//! `key=value` pairs in lexicographic key order, MD5-hashed, and the hex
//! digest is reversed character by character. The transform is reproduced
//! here exactly as the client computes it; the server only ever verifies.
//!
//! Note that this is a weak authentication scheme - MD5 is broken as a MAC
//! and reversing the digest string adds nothing. It is kept bit-for-bit
//! for interoperability with deployed clients.

use std::collections::BTreeMap;

/// Compute the signature over a set of request fields.
///
/// The `secret` key is added to the field set before canonicalization and
/// is never transmitted. Iteration order of the input map is irrelevant;
/// the canonical form is sorted by key.
pub fn sign(params: &BTreeMap<String, String>, secret: &str) -> String {
    let mut signed = params.clone();
    signed.insert("secret".to_string(), secret.to_string());

    let canonical = signed
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let digest = format!("{:x}", md5::compute(canonical.as_bytes()));

    digest.chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_sign_known_vector() {
        // md5("a=1&b=2&secret=x") reversed
        assert_eq!(
            "50b0eb0e0f73f881ed249bfcbc013c82",
            sign(&params(&[("a", "1"), ("b", "2")]), "x")
        );
    }

    #[test]
    fn test_sign_full_update_vector() {
        let fields = params(&[
            ("name", "host.example"),
            ("value", "2001:db8::1"),
            ("type", "AAAA"),
            ("ttl", "5"),
            ("timestamp", "1000"),
        ]);

        assert_eq!(
            "2ccdcd2c4f80d174cbcb1d6b4e133495",
            sign(&fields, "s3cr3t")
        );
    }

    #[test]
    fn test_sign_is_order_independent() {
        let forward = params(&[("a", "1"), ("b", "2"), ("c", "3")]);

        let mut reverse = BTreeMap::new();
        reverse.insert("c".to_string(), "3".to_string());
        reverse.insert("b".to_string(), "2".to_string());
        reverse.insert("a".to_string(), "1".to_string());

        assert_eq!(sign(&forward, "x"), sign(&reverse, "x"));
    }

    #[test]
    fn test_sign_depends_on_secret() {
        let fields = params(&[("a", "1")]);

        assert_ne!(sign(&fields, "x"), sign(&fields, "y"));
    }
}
