//! Cache Keys and Invalidation Patterns
//!
//! A [`CacheKey`] pairs the caller's logical key with a fixed-length
//! SHA-256 digest. The digest is only used in-process: L1 indexes entries
//! by it and refresh dedup tracks it. Shared tiers store the readable
//! logical key under a namespace and tier prefix
//! (`{namespace}:{tier}:{logical}`), since glob invalidation has to match
//! logical keys in Redis and Postgres.
//!
//! Invalidation patterns are globs over logical keys: `*` matches any run
//! of characters, `?` matches one character, `\` escapes the next
//! character. A [`KeyPattern`] renders that glob for each tier's dialect:
//! an anchored regex for L1, a Redis `MATCH` glob for L2/L3 and a SQL
//! `LIKE` pattern for L4.

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::Tier;
use crate::error::{GatewayError, GatewayResult};

/// Digest length in bytes
pub const DIGEST_LEN: usize = 16;

/// Cache key: logical key plus its digest
///
/// The digest keys in-process structures; [`storage_key`](Self::storage_key)
/// is built from the logical key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    digest: [u8; DIGEST_LEN],
    logical: Arc<str>,
}

impl CacheKey {
    /// Derive a key from a logical key string
    pub fn new(logical: impl AsRef<str>) -> Self {
        let logical = logical.as_ref();
        let hash = Sha256::digest(logical.as_bytes());
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&hash[..DIGEST_LEN]);
        Self {
            digest,
            logical: Arc::from(logical),
        }
    }

    /// Fixed-length digest
    #[must_use]
    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    /// Digest as lowercase hex
    #[must_use]
    pub fn hex(&self) -> String {
        hex::encode(self.digest)
    }

    /// The logical key this was derived from
    #[must_use]
    pub fn logical(&self) -> &str {
        &self.logical
    }

    /// Storage key in a shared tier, built from the logical key
    #[must_use]
    pub fn storage_key(&self, namespace: &str, tier: Tier) -> String {
        format!("{}:{}:{}", namespace, tier.label(), self.logical)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheKey")
            .field("logical", &self.logical)
            .field("digest", &self.hex())
            .finish()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.logical)
    }
}

/// Stable digest of a request: a key plus its serialized arguments
///
/// Two calls with the same key and equal arguments produce the same
/// digest; used to key single-flight groups around provider calls.
///
/// # Errors
///
/// Returns `GatewayError::Serialization` if `args` cannot be serialized.
pub fn request_digest<A: Serialize + ?Sized>(key: &str, args: &A) -> GatewayResult<String> {
    let encoded = serde_json::to_vec(args)?;
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update([0u8]);
    hasher.update(&encoded);
    Ok(hex::encode(hasher.finalize()))
}

// ============================================================================
// Key Patterns
// ============================================================================

/// Glob over logical keys
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyPattern {
    glob: String,
}

/// Pieces of a parsed glob
enum Token {
    Any,
    One,
    Lit(char),
}

impl KeyPattern {
    /// Parse a glob
    ///
    /// Characters that Redis treats as class syntax are escaped so every
    /// dialect agrees on what matches.
    pub fn new(glob: impl AsRef<str>) -> Self {
        let mut normalized = String::new();
        for token in tokenize(glob.as_ref()) {
            push_token(&mut normalized, &token);
        }
        Self { glob: normalized }
    }

    /// A pattern matching exactly `key`
    pub fn literal(key: impl AsRef<str>) -> Self {
        let mut glob = String::new();
        for c in key.as_ref().chars() {
            push_token(&mut glob, &Token::Lit(c));
        }
        Self { glob }
    }

    /// Normalized glob (Redis `MATCH` compatible)
    #[must_use]
    pub fn as_glob(&self) -> &str {
        &self.glob
    }

    /// This pattern under a literal prefix
    #[must_use]
    pub fn with_prefix(&self, prefix: &str) -> Self {
        let mut glob = Self::literal(prefix).glob;
        glob.push_str(&self.glob);
        Self { glob }
    }

    /// Pattern for a shared tier's storage keys
    #[must_use]
    pub fn for_tier(&self, namespace: &str, tier: Tier) -> Self {
        self.with_prefix(&format!("{}:{}:", namespace, tier.label()))
    }

    /// Anchored regex equivalent
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::InvalidPattern` if the regex cannot be built.
    pub fn to_regex(&self) -> GatewayResult<Regex> {
        let mut re = String::from("(?s)^");
        for token in tokenize(&self.glob) {
            match token {
                Token::Any => re.push_str(".*"),
                Token::One => re.push('.'),
                Token::Lit(c) => re.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
            }
        }
        re.push('$');
        Regex::new(&re).map_err(|e| GatewayError::InvalidPattern(e.to_string()))
    }

    /// SQL `LIKE` equivalent, using `\` as the escape character
    #[must_use]
    pub fn to_like(&self) -> String {
        let mut like = String::new();
        for token in tokenize(&self.glob) {
            match token {
                Token::Any => like.push('%'),
                Token::One => like.push('_'),
                Token::Lit(c @ ('%' | '_' | '\\')) => {
                    like.push('\\');
                    like.push(c);
                }
                Token::Lit(c) => like.push(c),
            }
        }
        like
    }

    /// Whether `candidate` matches this pattern
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        self.to_regex().is_ok_and(|re| re.is_match(candidate))
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.glob)
    }
}

fn tokenize(glob: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = glob.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => tokens.push(Token::Any),
            '?' => tokens.push(Token::One),
            // Trailing backslash is a literal backslash
            '\\' => tokens.push(Token::Lit(chars.next().unwrap_or('\\'))),
            other => tokens.push(Token::Lit(other)),
        }
    }
    tokens
}

fn push_token(out: &mut String, token: &Token) {
    match token {
        Token::Any => out.push('*'),
        Token::One => out.push('?'),
        Token::Lit(c @ ('*' | '?' | '\\' | '[' | ']' | '^')) => {
            out.push('\\');
            out.push(*c);
        }
        Token::Lit(c) => out.push(*c),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_key_digest_is_stable_and_fixed_length() {
        let a = CacheKey::new("user:42");
        let b = CacheKey::new("user:42");
        let c = CacheKey::new("user:43");

        assert_eq!(a, b);
        assert_ne!(a.digest(), c.digest());
        assert_eq!(a.hex().len(), DIGEST_LEN * 2);
        assert_eq!(a.logical(), "user:42");
    }

    #[test]
    fn test_storage_key() {
        let key = CacheKey::new("user:42");
        assert_eq!(key.storage_key("gw", Tier::L2), "gw:l2:user:42");
        assert_eq!(key.storage_key("gw", Tier::L4), "gw:l4:user:42");
    }

    #[test]
    fn test_shared_tiers_keep_logical_key_while_digest_stays_fixed() {
        let logical = format!("search:{}", "q".repeat(300));
        let key = CacheKey::new(&logical);

        assert_eq!(key.digest().len(), DIGEST_LEN);
        let stored = key.storage_key("gw", Tier::L3);
        assert_eq!(stored, format!("gw:l3:{logical}"));
        assert!(!stored.contains(&key.hex()));

        // Patterns written against logical keys reach the stored form
        let pattern = KeyPattern::new("search:*");
        assert!(pattern.to_regex().unwrap().is_match(key.logical()));
        assert_eq!(pattern.for_tier("gw", Tier::L3).as_glob(), "gw:l3:search:*");
    }

    #[test]
    fn test_request_digest() {
        let a = request_digest("search", &("rust", 10)).unwrap();
        let b = request_digest("search", &("rust", 10)).unwrap();
        let c = request_digest("search", &("rust", 11)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_pattern_regex() {
        let pattern = KeyPattern::new("user:*");
        assert!(pattern.matches("user:42"));
        assert!(pattern.matches("user:"));
        assert!(!pattern.matches("users:42"));
        assert!(!pattern.matches("admin:user:42"));

        let one = KeyPattern::new("user:?");
        assert!(one.matches("user:7"));
        assert!(!one.matches("user:42"));
    }

    #[test]
    fn test_literal_pattern_escapes_wildcards() {
        let pattern = KeyPattern::literal("odd*key[1]");
        assert_eq!(pattern.as_glob(), "odd\\*key\\[1\\]");
        assert!(pattern.matches("odd*key[1]"));
        assert!(!pattern.matches("oddXkey[1]"));
    }

    #[test]
    fn test_pattern_for_tier() {
        let pattern = KeyPattern::new("user:*").for_tier("gw", Tier::L3);
        assert_eq!(pattern.as_glob(), "gw:l3:user:*");
        assert!(pattern.matches("gw:l3:user:42"));
    }

    #[test]
    fn test_pattern_to_like() {
        assert_eq!(KeyPattern::new("user:*").to_like(), "user:%");
        assert_eq!(KeyPattern::new("a_b?%").to_like(), "a\\_b_\\%");
    }
}
