//! Challenge page parsing helpers and utilities.
//!
//! Provides the building blocks needed to inspect an Anubis challenge page and
//! extract the parameters required by the proof-of-work solver.

use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use super::types::{ChallengeDescriptor, MAX_DIFFICULTY, SUPPORTED_ALGORITHM, Solution};

/// Path of the solution endpoint, relative to the base prefix.
pub const PASS_CHALLENGE_PATH: &str = "/.within.website/x/cmd/anubis/api/pass-challenge";

const DEFAULT_DIFFICULTY: u32 = 2;

static CHALLENGE_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("script#anubis_challenge").expect("invalid challenge selector")
});

static BASE_PREFIX_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("script#anubis_base_prefix").expect("invalid base prefix selector")
});

/// Outcomes when parsing a challenge page fails.
#[derive(Debug, Error)]
pub enum ChallengeParseError {
    #[error("challenge script not found")]
    MissingScript,
    #[error("challenge script is not valid json: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("challenge script has no challenge string")]
    MissingChallenge,
    #[error("unsupported proof-of-work algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("difficulty {0} exceeds the 64 hex digits of a digest")]
    DifficultyOutOfRange(u32),
    #[error("base prefix script is not a json string: {0}")]
    InvalidBasePrefix(#[source] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct RawChallenge {
    challenge: Option<String>,
    #[serde(default)]
    rules: RawRules,
}

#[derive(Debug, Deserialize)]
struct RawRules {
    #[serde(default = "default_algorithm")]
    algorithm: String,
    #[serde(default = "default_difficulty")]
    difficulty: u32,
}

impl Default for RawRules {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            difficulty: DEFAULT_DIFFICULTY,
        }
    }
}

fn default_algorithm() -> String {
    SUPPORTED_ALGORITHM.to_string()
}

fn default_difficulty() -> u32 {
    DEFAULT_DIFFICULTY
}

/// Extract the challenge descriptor from the embedded script tags.
///
/// Fails closed on anything but the supported algorithm.
pub fn parse_anubis_challenge(html: &str) -> Result<ChallengeDescriptor, ChallengeParseError> {
    let document = Html::parse_document(html);

    let script = document
        .select(&CHALLENGE_SELECTOR)
        .next()
        .ok_or(ChallengeParseError::MissingScript)?;
    let payload: String = script.text().collect();
    let raw: RawChallenge =
        serde_json::from_str(payload.trim()).map_err(ChallengeParseError::InvalidJson)?;

    let challenge = raw
        .challenge
        .filter(|value| !value.is_empty())
        .ok_or(ChallengeParseError::MissingChallenge)?;

    if raw.rules.algorithm != SUPPORTED_ALGORITHM {
        return Err(ChallengeParseError::UnsupportedAlgorithm(raw.rules.algorithm));
    }
    if raw.rules.difficulty > MAX_DIFFICULTY {
        return Err(ChallengeParseError::DifficultyOutOfRange(raw.rules.difficulty));
    }

    let base_prefix = match document.select(&BASE_PREFIX_SELECTOR).next() {
        Some(element) => {
            let text: String = element.text().collect();
            let text = text.trim();
            if text.is_empty() {
                String::new()
            } else {
                serde_json::from_str::<String>(text)
                    .map_err(ChallengeParseError::InvalidBasePrefix)?
            }
        }
        None => String::new(),
    };

    Ok(ChallengeDescriptor {
        challenge,
        algorithm: raw.rules.algorithm,
        difficulty: raw.rules.difficulty,
        base_prefix,
    })
}

/// Scheme + host (+ port) of a URL.
pub fn origin_from_url(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    let mut origin = format!("{}://{}", url.scheme(), host);
    if let Some(port) = url.port() {
        origin.push(':');
        origin.push_str(&port.to_string());
    }
    Some(origin)
}

/// Build the pass-challenge URL for a solved descriptor.
pub fn build_submission_url(
    original: &Url,
    descriptor: &ChallengeDescriptor,
    solution: &Solution,
) -> Url {
    let mut url = original.clone();
    let prefix = descriptor.base_prefix.trim_end_matches('/');
    let prefix = if prefix.is_empty() || prefix.starts_with('/') {
        prefix.to_string()
    } else {
        format!("/{prefix}")
    };

    url.set_path(&format!("{prefix}{PASS_CHALLENGE_PATH}"));
    url.set_query(None);
    url.set_fragment(None);
    url.query_pairs_mut()
        .append_pair("response", &solution.hash)
        .append_pair("nonce", &solution.nonce.to_string())
        .append_pair("redir", original.as_str())
        .append_pair("elapsedTime", &solution.reported_elapsed_ms().to_string());

    url
}
