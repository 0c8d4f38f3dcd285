//! Core data structures shared across challenge detection, analysis, and solving layers.

use std::collections::BTreeMap;
use std::time::Duration;

/// Cookie name/value pairs, ordered by name so formatting stays stable.
pub type CookieJar = BTreeMap<String, String>;

/// The only proof-of-work algorithm the solver understands.
pub const SUPPORTED_ALGORITHM: &str = "fast";

/// Hex digits in a SHA-256 digest; no higher difficulty can be met.
pub const MAX_DIFFICULTY: u32 = 64;

/// Smallest elapsed time reported back to the challenge endpoint.
pub const MIN_REPORTED_ELAPSED_MS: u64 = 100;

/// Proof-of-work parameters extracted from a challenge page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeDescriptor {
    pub challenge: String,
    pub algorithm: String,
    pub difficulty: u32,
    /// Path prefix the protected application is mounted under (may be empty).
    pub base_prefix: String,
}

impl ChallengeDescriptor {
    pub fn new(challenge: impl Into<String>, difficulty: u32) -> Self {
        Self {
            challenge: challenge.into(),
            algorithm: SUPPORTED_ALGORITHM.to_string(),
            difficulty,
            base_prefix: String::new(),
        }
    }

    pub fn with_base_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.base_prefix = prefix.into();
        self
    }

    /// Whether `digest` starts with `difficulty` zero hex digits.
    pub fn is_satisfied_by(&self, digest: &str) -> bool {
        digest.bytes().take_while(|b| *b == b'0').count() >= self.difficulty as usize
    }
}

/// Accepted proof-of-work answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Solution {
    pub hash: String,
    pub nonce: u64,
    pub elapsed: Duration,
}

impl Solution {
    /// Elapsed time as submitted, floored so it resembles a browser solve.
    pub fn reported_elapsed_ms(&self) -> u64 {
        (self.elapsed.as_millis() as u64).max(MIN_REPORTED_ELAPSED_MS)
    }
}

/// What the pass-challenge endpoint answered.
#[derive(Debug, Clone)]
pub struct SubmissionResult {
    pub status: u16,
    pub cookies: CookieJar,
    pub redirect_location: Option<String>,
    /// Leading part of the response body kept for diagnostics.
    pub body_prefix: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reported_elapsed_is_floored() {
        let quick = Solution {
            hash: "00ab".into(),
            nonce: 1,
            elapsed: Duration::from_millis(3),
        };
        assert_eq!(quick.reported_elapsed_ms(), 100);

        let slow = Solution {
            elapsed: Duration::from_millis(2_500),
            ..quick
        };
        assert_eq!(slow.reported_elapsed_ms(), 2_500);
    }

    #[test]
    fn difficulty_counts_leading_zero_digits() {
        let descriptor = ChallengeDescriptor::new("abc", 4);
        assert!(descriptor.is_satisfied_by("0000af"));
        assert!(descriptor.is_satisfied_by("00000f"));
        assert!(!descriptor.is_satisfied_by("000af0"));
        assert!(ChallengeDescriptor::new("abc", 0).is_satisfied_by("ff"));
        assert!(!ChallengeDescriptor::new("abc", u32::MAX).is_satisfied_by(&"0".repeat(64)));
    }
}
