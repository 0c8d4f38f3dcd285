//! Hash-prefix proof-of-work search.
//!
//! Scans nonces upward from zero and accepts the first whose digest of
//! `challenge ++ nonce` starts with `difficulty` zero hex digits, so the result
//! is deterministic and minimal for a given descriptor.

use std::sync::Arc;
use std::time::Instant;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::challenges::core::types::MAX_DIFFICULTY;
use crate::challenges::core::{ChallengeDescriptor, Solution};

/// Hard cap on the nonce search.
pub const DEFAULT_MAX_ITERATIONS: u64 = 10_000_000;

const PROGRESS_INTERVAL: u64 = 100_000;

/// Digest function used by the search, abstracted so tests can script hits.
pub trait ChallengeHasher: Send + Sync {
    /// Lowercase hex digest of `input`.
    fn digest_hex(&self, input: &str) -> String;
}

/// SHA-256, the digest the challenge page itself uses.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Hasher;

impl ChallengeHasher for Sha256Hasher {
    fn digest_hex(&self, input: &str) -> String {
        hex::encode(Sha256::digest(input.as_bytes()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SolveError {
    #[error("no nonce satisfied difficulty {difficulty} within {iterations} iterations")]
    Exhausted { difficulty: u32, iterations: u64 },
    #[error("difficulty {0} can never be met by a sha-256 hex digest")]
    Unsatisfiable(u32),
    #[error("solver task aborted: {0}")]
    Aborted(String),
}

/// Bounded nonce search over a pluggable hasher.
#[derive(Clone)]
pub struct ProofOfWorkSolver {
    hasher: Arc<dyn ChallengeHasher>,
    max_iterations: u64,
}

impl ProofOfWorkSolver {
    pub fn new() -> Self {
        Self {
            hasher: Arc::new(Sha256Hasher),
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn ChallengeHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn max_iterations(&self) -> u64 {
        self.max_iterations
    }

    pub fn solve(&self, descriptor: &ChallengeDescriptor) -> Result<Solution, SolveError> {
        if descriptor.difficulty > MAX_DIFFICULTY {
            return Err(SolveError::Unsatisfiable(descriptor.difficulty));
        }
        let started = Instant::now();
        let mut input = String::with_capacity(descriptor.challenge.len() + 20);

        for nonce in 0..self.max_iterations {
            input.clear();
            input.push_str(&descriptor.challenge);
            input.push_str(&nonce.to_string());

            let hash = self.hasher.digest_hex(&input);
            if descriptor.is_satisfied_by(&hash) {
                let elapsed = started.elapsed();
                log::debug!(
                    "proof-of-work solved: difficulty={} nonce={nonce} in {:?}",
                    descriptor.difficulty,
                    elapsed
                );
                return Ok(Solution {
                    hash,
                    nonce,
                    elapsed,
                });
            }

            if nonce > 0 && nonce % PROGRESS_INTERVAL == 0 {
                log::debug!("proof-of-work: {nonce} nonces tried");
            }
        }

        Err(SolveError::Exhausted {
            difficulty: descriptor.difficulty,
            iterations: self.max_iterations,
        })
    }

    /// Run the search on the blocking pool so a long solve never stalls the runtime.
    pub async fn solve_blocking(
        &self,
        descriptor: &ChallengeDescriptor,
    ) -> Result<Solution, SolveError> {
        let solver = self.clone();
        let descriptor = descriptor.clone();
        tokio::task::spawn_blocking(move || solver.solve(&descriptor))
            .await
            .map_err(|err| SolveError::Aborted(err.to_string()))?
    }
}

impl Default for ProofOfWorkSolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Only inputs ending in the given nonce produce a zero-prefixed digest.
    struct ScriptedHasher {
        winning_suffix: &'static str,
    }

    impl ChallengeHasher for ScriptedHasher {
        fn digest_hex(&self, input: &str) -> String {
            if input.ends_with(self.winning_suffix) {
                "0f".repeat(32)
            } else {
                "f0".repeat(32)
            }
        }
    }

    #[test]
    fn returns_first_nonce_accepted_by_hasher() {
        let solver = ProofOfWorkSolver::new().with_hasher(Arc::new(ScriptedHasher {
            winning_suffix: "abc3",
        }));
        let solution = solver.solve(&ChallengeDescriptor::new("abc", 1)).unwrap();
        assert_eq!(solution.nonce, 3);
    }

    #[test]
    fn sha256_solution_is_valid_and_minimal() {
        let descriptor = ChallengeDescriptor::new("e3b0c44298fc1c14", 2);
        let solution = ProofOfWorkSolver::new().solve(&descriptor).unwrap();

        let expected = hex::encode(Sha256::digest(format!("e3b0c44298fc1c14{}", solution.nonce)));
        assert_eq!(solution.hash, expected);
        assert!(solution.hash.starts_with("00"));

        for nonce in 0..solution.nonce {
            let digest = hex::encode(Sha256::digest(format!("e3b0c44298fc1c14{nonce}")));
            assert!(!digest.starts_with("00"), "nonce {nonce} was already valid");
        }
    }

    #[test]
    fn solving_is_deterministic() {
        let descriptor = ChallengeDescriptor::new("deterministic", 2);
        let solver = ProofOfWorkSolver::new();
        let first = solver.solve(&descriptor).unwrap();
        let second = solver.solve(&descriptor).unwrap();
        assert_eq!(first.nonce, second.nonce);
        assert_eq!(first.hash, second.hash);
    }

    #[test]
    fn exhausts_at_iteration_cap() {
        let solver = ProofOfWorkSolver::new()
            .with_hasher(Arc::new(ScriptedHasher {
                winning_suffix: "never",
            }))
            .with_max_iterations(50);
        assert_eq!(
            solver.solve(&ChallengeDescriptor::new("abc", 1)),
            Err(SolveError::Exhausted {
                difficulty: 1,
                iterations: 50
            })
        );
    }

    #[test]
    fn unreachable_difficulty_fails_without_searching() {
        let solver = ProofOfWorkSolver::new().with_hasher(Arc::new(ScriptedHasher {
            winning_suffix: "0",
        }));
        assert_eq!(
            solver.solve(&ChallengeDescriptor::new("abc", 4_000_000_000)),
            Err(SolveError::Unsatisfiable(4_000_000_000))
        );
    }

    #[tokio::test]
    async fn blocking_solve_matches_inline_solve() {
        let descriptor = ChallengeDescriptor::new("abc", 1);
        let solver = ProofOfWorkSolver::new();
        let inline = solver.solve(&descriptor).unwrap();
        let pooled = solver.solve_blocking(&descriptor).await.unwrap();
        assert_eq!(inline.nonce, pooled.nonce);
    }
}
