//! Challenge solver module registry.
//!
//! `proof_of_work` holds the pure nonce search, `anubis` drives the full
//! fetch, solve and submit flow around it.

pub mod anubis;
pub mod proof_of_work;

pub use anubis::{
    AnubisSolver, ChallengeError, ChallengeOutcome, SubmissionVerdict, SubmitError,
    classify_submission,
};
pub use proof_of_work::{
    ChallengeHasher, DEFAULT_MAX_ITERATIONS, ProofOfWorkSolver, Sha256Hasher, SolveError,
};
