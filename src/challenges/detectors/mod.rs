//! Challenge detection module.
//!
//! Provides pattern-based identification of proof-of-work challenge pages,
//! rate limiting and origin overload responses.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

use crate::modules::endpoints::RequestOutcome;

/// High level response categories recognised by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeType {
    /// An Anubis proof-of-work interstitial.
    ProofOfWork,
    /// HTTP 429 from the mirror.
    RateLimited,
    /// The origin behind the mirror is overloaded ("backend temporarily unavailable").
    BackendOverloaded,
}

/// Detection output returned to the fetch loop.
#[derive(Debug, Clone)]
pub struct ChallengeDetection {
    pub pattern_id: &'static str,
    pub challenge_type: ChallengeType,
    pub status_code: u16,
    pub matched_indicators: Vec<String>,
}

/// Pattern definition used to match responses against known signatures.
struct ChallengePattern {
    id: &'static str,
    challenge_type: ChallengeType,
    patterns: Vec<Regex>,
}

impl ChallengePattern {
    fn new(id: &'static str, challenge_type: ChallengeType, raw_patterns: &[&str]) -> Self {
        let patterns = raw_patterns.iter().map(|pattern| build_regex(pattern)).collect();
        Self {
            id,
            challenge_type,
            patterns,
        }
    }

    fn matches(&self, body: &str) -> Vec<String> {
        self.patterns
            .iter()
            .filter_map(|re| re.find(body).map(|m| m.as_str().to_string()))
            .collect()
    }
}

static CHALLENGE_PATTERN: Lazy<ChallengePattern> = Lazy::new(|| {
    ChallengePattern::new(
        "anubis_pow",
        ChallengeType::ProofOfWork,
        &[
            r#"id\s*=\s*["']?anubis_challenge"#,
            r"Making sure you(?:'|&#39;|&#x27;|’)re not a bot!",
        ],
    )
});

static OVERLOAD_PATTERN: Lazy<ChallengePattern> = Lazy::new(|| {
    ChallengePattern::new(
        "backend_overloaded",
        ChallengeType::BackendOverloaded,
        &[r"backend temporarily unavailable", r"retrying"],
    )
});

static SUCCESS_RE: Lazy<Regex> = Lazy::new(|| build_regex(r"success|passed"));

/// Stateless detector over response status and body.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChallengeDetector;

impl ChallengeDetector {
    pub fn new() -> Self {
        Self
    }

    /// True if the page carries the challenge script or the interstitial banner.
    pub fn is_challenge_page(html: &str) -> bool {
        CHALLENGE_PATTERN.patterns.iter().any(|re| re.is_match(html))
    }

    /// True if the body says the origin is overloaded and the request should be retried.
    pub fn is_backend_overloaded(body: &str) -> bool {
        OVERLOAD_PATTERN.patterns.iter().any(|re| re.is_match(body))
    }

    /// True if a 200 submission body reports the challenge as passed.
    pub fn indicates_success(body: &str) -> bool {
        SUCCESS_RE.is_match(body)
    }

    /// Classify a response; `None` means a normal page.
    pub fn detect(&self, status: u16, body: &str) -> Option<ChallengeDetection> {
        if status == 429 {
            return Some(ChallengeDetection {
                pattern_id: "http_429",
                challenge_type: ChallengeType::RateLimited,
                status_code: status,
                matched_indicators: vec!["status 429".to_string()],
            });
        }

        for pattern in [&*CHALLENGE_PATTERN, &*OVERLOAD_PATTERN] {
            // Overload markers only count on error-ish pages, "retrying" is too common otherwise.
            if pattern.challenge_type == ChallengeType::BackendOverloaded
                && status < 500
                && body.len() > 4_096
            {
                continue;
            }
            let matched = pattern.matches(body);
            if !matched.is_empty() {
                return Some(ChallengeDetection {
                    pattern_id: pattern.id,
                    challenge_type: pattern.challenge_type,
                    status_code: status,
                    matched_indicators: matched,
                });
            }
        }

        None
    }

    /// Map a response onto the outcome recorded by the rotator and credential cache.
    pub fn classify(&self, status: u16, body: &str) -> RequestOutcome {
        match self.detect(status, body).map(|d| d.challenge_type) {
            Some(ChallengeType::RateLimited) | Some(ChallengeType::BackendOverloaded) => {
                RequestOutcome::RateLimited
            }
            Some(ChallengeType::ProofOfWork) => RequestOutcome::ChallengePresented,
            None if status == 502 || status == 504 => RequestOutcome::Timeout,
            None if status >= 400 => RequestOutcome::OtherError,
            None => RequestOutcome::Success,
        }
    }
}

fn build_regex(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .unwrap_or_else(|err| panic!("invalid detector regex {pattern}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_script_marker_and_banner() {
        assert!(ChallengeDetector::is_challenge_page(
            r#"<script id="anubis_challenge" type="application/json">{}</script>"#
        ));
        assert!(ChallengeDetector::is_challenge_page(
            "<h1 id=\"title\">Making sure you&#39;re not a bot!</h1>"
        ));
        assert!(!ChallengeDetector::is_challenge_page("<html><body>timeline</body></html>"));
    }

    #[test]
    fn classifies_outcomes() {
        let detector = ChallengeDetector::new();
        assert_eq!(detector.classify(429, ""), RequestOutcome::RateLimited);
        assert_eq!(
            detector.classify(200, "Backend temporarily unavailable, retrying"),
            RequestOutcome::RateLimited
        );
        assert_eq!(
            detector.classify(200, r#"<script id="anubis_challenge">"#),
            RequestOutcome::ChallengePresented
        );
        assert_eq!(detector.classify(502, "bad gateway"), RequestOutcome::Timeout);
        assert_eq!(detector.classify(404, "not found"), RequestOutcome::OtherError);
        assert_eq!(detector.classify(200, "<html>tweets</html>"), RequestOutcome::Success);
    }

    #[test]
    fn long_pages_mentioning_retrying_are_not_overload() {
        let detector = ChallengeDetector::new();
        let page = format!("<html>{}retrying later</html>", "x".repeat(5_000));
        assert!(detector.detect(200, &page).is_none());
    }

    #[test]
    fn recognises_success_markers() {
        assert!(ChallengeDetector::indicates_success("Challenge PASSED"));
        assert!(!ChallengeDetector::indicates_success("invalid response"));
    }
}
