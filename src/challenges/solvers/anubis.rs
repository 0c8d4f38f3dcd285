//! Solver for the Anubis proof-of-work interstitial.
//!
//! Re-fetches the protected page for a fresh challenge, solves it, submits the
//! answer to the pass-challenge endpoint through the same egress path and
//! reports what the server answered.

use std::sync::Arc;

use thiserror::Error;
use url::Url;

use crate::challenges::core::{
    ChallengeDescriptor, ChallengeHttpClient, ChallengeParseError, CookieJar, HttpRequest,
    Solution, SubmissionResult, TransportError, build_submission_url,
    execute_challenge_submission, parse_anubis_challenge,
};
use crate::challenges::detectors::ChallengeDetector;
use crate::challenges::user_agents::BrowserProfile;
use crate::modules::proxy::EgressPath;

use super::proof_of_work::{ChallengeHasher, ProofOfWorkSolver, SolveError};

/// How the pass-challenge endpoint judged a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionVerdict {
    Passed,
    /// Solved correctly but the origin is overloaded; try again later.
    Retryable,
    /// 200 without cookies or a success marker.
    Inconclusive,
    Rejected,
}

/// Classify a submission response.
pub fn classify_submission(result: &SubmissionResult) -> SubmissionVerdict {
    match result.status {
        302 => SubmissionVerdict::Passed,
        200 if ChallengeDetector::is_backend_overloaded(&result.body_prefix) => {
            SubmissionVerdict::Retryable
        }
        200 if !result.cookies.is_empty() => SubmissionVerdict::Passed,
        200 if ChallengeDetector::indicates_success(&result.body_prefix) => {
            SubmissionVerdict::Passed
        }
        200 => SubmissionVerdict::Inconclusive,
        _ => SubmissionVerdict::Rejected,
    }
}

/// Result of [`AnubisSolver::solve_and_apply`].
#[derive(Debug, Clone)]
pub enum ChallengeOutcome {
    /// The fresh page carried no challenge. Holds whatever cookies that page set.
    NotRequired { cookies: CookieJar },
    Solved {
        cookies: CookieJar,
        redirect_location: Option<String>,
        solution: Solution,
    },
    Retryable { status: u16 },
    Inconclusive { status: u16 },
    Rejected { status: u16 },
}

impl ChallengeOutcome {
    /// Cookies to attach to follow-up requests, if the outcome produced any usable session.
    pub fn session_cookies(&self) -> Option<&CookieJar> {
        match self {
            ChallengeOutcome::NotRequired { cookies } | ChallengeOutcome::Solved { cookies, .. } => {
                Some(cookies)
            }
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.session_cookies().is_some()
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("pass-challenge request failed: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("fresh challenge fetch failed: {0}")]
    FreshFetch(#[source] TransportError),
    #[error(transparent)]
    Parse(#[from] ChallengeParseError),
    #[error(transparent)]
    Solve(#[from] SolveError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
}

impl ChallengeError {
    /// Network failure underneath the challenge flow, if any.
    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            ChallengeError::FreshFetch(err) | ChallengeError::Submit(SubmitError::Transport(err)) => {
                Some(err)
            }
            _ => None,
        }
    }
}

/// Detects, solves and submits Anubis challenges.
pub struct AnubisSolver {
    client: Arc<dyn ChallengeHttpClient>,
    pow: ProofOfWorkSolver,
    profile: BrowserProfile,
}

impl AnubisSolver {
    pub fn new(client: Arc<dyn ChallengeHttpClient>) -> Self {
        Self {
            client,
            pow: ProofOfWorkSolver::new(),
            profile: BrowserProfile::default(),
        }
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn ChallengeHasher>) -> Self {
        self.pow = self.pow.with_hasher(hasher);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.pow = self.pow.with_max_iterations(max_iterations);
        self
    }

    pub fn with_profile(mut self, profile: BrowserProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn profile(&self) -> &BrowserProfile {
        &self.profile
    }

    pub fn detect(&self, html: &str) -> bool {
        ChallengeDetector::is_challenge_page(html)
    }

    pub fn parse(&self, html: &str) -> Result<ChallengeDescriptor, ChallengeParseError> {
        parse_anubis_challenge(html)
    }

    pub fn solve(&self, descriptor: &ChallengeDescriptor) -> Result<Solution, SolveError> {
        self.pow.solve(descriptor)
    }

    /// Submit a solution. `challenge_cookies` are the cookies the challenge page set.
    pub async fn submit(
        &self,
        original_url: &Url,
        descriptor: &ChallengeDescriptor,
        solution: &Solution,
        egress: &EgressPath,
        challenge_cookies: &CookieJar,
    ) -> Result<SubmissionResult, SubmitError> {
        let url = build_submission_url(original_url, descriptor, solution);
        log::debug!("submitting challenge answer via {egress}: nonce={}", solution.nonce);

        let request = HttpRequest::get(url)
            .with_headers(self.profile.submission_headers(original_url.as_str()))
            .via(egress.clone())
            .with_cookies(challenge_cookies);

        Ok(execute_challenge_submission(self.client.as_ref(), request).await?)
    }

    /// Solve the challenge guarding `url` and return the session it yields.
    ///
    /// With `force_fresh` (or without `html`) the page is fetched again first,
    /// since a challenge embedded in an older response may already be stale.
    pub async fn solve_and_apply(
        &self,
        url: &Url,
        html: Option<&str>,
        egress: &EgressPath,
        force_fresh: bool,
    ) -> Result<ChallengeOutcome, ChallengeError> {
        let (page, page_cookies) = match html {
            Some(html) if !force_fresh => (html.to_string(), CookieJar::new()),
            _ => self.fetch_fresh(url, egress).await?,
        };

        if !self.detect(&page) {
            log::debug!("fresh fetch of {url} via {egress} shows no challenge");
            return Ok(ChallengeOutcome::NotRequired {
                cookies: page_cookies,
            });
        }

        let descriptor = self.parse(&page)?;
        let solution = match self.pow.solve_blocking(&descriptor).await {
            Ok(solution) => solution,
            Err(err) => {
                log::error!("challenge for {url} unsolved: {err}");
                return Err(err.into());
            }
        };

        let result = self
            .submit(url, &descriptor, &solution, egress, &page_cookies)
            .await?;

        let outcome = match classify_submission(&result) {
            SubmissionVerdict::Passed => {
                let mut cookies = page_cookies;
                cookies.extend(result.cookies);
                log::info!(
                    "challenge passed for {url} via {egress} (difficulty {}, nonce {}, {} cookies)",
                    descriptor.difficulty,
                    solution.nonce,
                    cookies.len()
                );
                ChallengeOutcome::Solved {
                    cookies,
                    redirect_location: result.redirect_location,
                    solution,
                }
            }
            SubmissionVerdict::Retryable => {
                log::warn!("challenge solved for {url} but origin is overloaded");
                ChallengeOutcome::Retryable {
                    status: result.status,
                }
            }
            SubmissionVerdict::Inconclusive => {
                log::warn!("challenge submission for {url} returned 200 without session");
                ChallengeOutcome::Inconclusive {
                    status: result.status,
                }
            }
            SubmissionVerdict::Rejected => {
                log::error!(
                    "challenge submission for {url} rejected with status {}: {}",
                    result.status,
                    result.body_prefix.chars().take(120).collect::<String>()
                );
                ChallengeOutcome::Rejected {
                    status: result.status,
                }
            }
        };

        Ok(outcome)
    }

    async fn fetch_fresh(
        &self,
        url: &Url,
        egress: &EgressPath,
    ) -> Result<(String, CookieJar), ChallengeError> {
        let request = HttpRequest::get(url.clone())
            .with_headers(self.profile.navigation_headers())
            .via(egress.clone());
        let response = self
            .client
            .send(&request)
            .await
            .map_err(ChallengeError::FreshFetch)?;
        Ok((response.text().into_owned(), response.cookies()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::header::{COOKIE, HeaderMap, HeaderValue, LOCATION, REFERER, SET_COOKIE};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use crate::challenges::core::{ChallengeHttpResponse, PASS_CHALLENGE_PATH};

    const CHALLENGE_PAGE: &str = r#"<html><head><title>Making sure you're not a bot!</title>
        <script id="anubis_challenge" type="application/json">{"challenge":"9a7f","rules":{"algorithm":"fast","difficulty":1}}</script>
        </head></html>"#;

    struct ScriptedClient {
        responses: Mutex<VecDeque<ChallengeHttpResponse>>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<ChallengeHttpResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<HttpRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ChallengeHttpClient for ScriptedClient {
        async fn send(
            &self,
            request: &HttpRequest,
        ) -> Result<ChallengeHttpResponse, TransportError> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected request"))
        }
    }

    fn response(status: u16, body: &str, set_cookies: &[&'static str]) -> ChallengeHttpResponse {
        let mut headers = HeaderMap::new();
        for cookie in set_cookies {
            headers.append(SET_COOKIE, HeaderValue::from_static(cookie));
        }
        ChallengeHttpResponse {
            status,
            headers,
            body: Bytes::from(body.to_string()),
            url: Url::parse("https://mirror.example/").unwrap(),
            is_redirect: status == 302,
        }
    }

    fn target() -> Url {
        Url::parse("https://mirror.example/search?q=rust").unwrap()
    }

    #[tokio::test]
    async fn fresh_challenge_is_solved_and_submitted_with_page_cookies() {
        let mut pass = response(302, "", &["techaro.lol-anubis-auth=jwt; Path=/"]);
        pass.headers
            .insert(LOCATION, HeaderValue::from_static("/search?q=rust"));
        let client = ScriptedClient::new(vec![
            response(
                200,
                CHALLENGE_PAGE,
                &["techaro.lol-anubis-cookie-verification=v1; Path=/"],
            ),
            pass,
        ]);
        let solver = AnubisSolver::new(client.clone());

        let outcome = solver
            .solve_and_apply(&target(), Some("stale page"), &EgressPath::Direct, true)
            .await
            .unwrap();

        let ChallengeOutcome::Solved {
            cookies,
            redirect_location,
            solution,
        } = outcome
        else {
            panic!("expected solved outcome");
        };
        assert_eq!(cookies.get("techaro.lol-anubis-auth").map(String::as_str), Some("jwt"));
        assert_eq!(redirect_location.as_deref(), Some("/search?q=rust"));
        assert!(solution.hash.starts_with('0'));

        let requests = client.requests();
        assert_eq!(requests.len(), 2);
        let submission = &requests[1];
        assert_eq!(submission.url.path(), PASS_CHALLENGE_PATH);
        assert!(!submission.allow_redirects);
        assert_eq!(submission.headers.get(REFERER).unwrap(), target().as_str());
        assert_eq!(
            submission.headers.get(COOKIE).unwrap(),
            "techaro.lol-anubis-cookie-verification=v1"
        );
    }

    #[tokio::test]
    async fn page_without_challenge_needs_no_solve() {
        let client = ScriptedClient::new(vec![response(200, "<html>timeline</html>", &[])]);
        let solver = AnubisSolver::new(client.clone());

        let outcome = solver
            .solve_and_apply(&target(), None, &EgressPath::Direct, true)
            .await
            .unwrap();

        assert!(matches!(outcome, ChallengeOutcome::NotRequired { ref cookies } if cookies.is_empty()));
        assert!(outcome.is_success());
        assert_eq!(client.requests().len(), 1);
    }

    #[tokio::test]
    async fn supplied_html_is_used_when_fresh_fetch_disabled() {
        let client = ScriptedClient::new(vec![response(
            200,
            "Backend temporarily unavailable, retrying",
            &[],
        )]);
        let solver = AnubisSolver::new(client.clone());

        let outcome = solver
            .solve_and_apply(&target(), Some(CHALLENGE_PAGE), &EgressPath::Direct, false)
            .await
            .unwrap();

        assert!(matches!(outcome, ChallengeOutcome::Retryable { status: 200 }));
        assert_eq!(client.requests().len(), 1);
    }

    #[tokio::test]
    async fn forbidden_submission_is_rejected() {
        let client = ScriptedClient::new(vec![
            response(200, CHALLENGE_PAGE, &[]),
            response(403, "invalid response", &[]),
        ]);
        let solver = AnubisSolver::new(client);

        let outcome = solver
            .solve_and_apply(&target(), None, &EgressPath::Direct, true)
            .await
            .unwrap();
        assert!(matches!(outcome, ChallengeOutcome::Rejected { status: 403 }));
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn malformed_challenge_is_a_parse_error() {
        let client = ScriptedClient::new(vec![response(
            200,
            r#"<script id="anubis_challenge">{broken</script>"#,
            &[],
        )]);
        let solver = AnubisSolver::new(client);

        let err = solver
            .solve_and_apply(&target(), None, &EgressPath::Direct, true)
            .await
            .unwrap_err();
        assert!(matches!(err, ChallengeError::Parse(ChallengeParseError::InvalidJson(_))));
    }

    #[test]
    fn classifies_submission_answers() {
        let result = |status, body: &str, cookies: &[(&str, &str)]| SubmissionResult {
            status,
            cookies: cookies
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            redirect_location: None,
            body_prefix: body.to_string(),
        };

        assert_eq!(classify_submission(&result(302, "", &[])), SubmissionVerdict::Passed);
        assert_eq!(
            classify_submission(&result(200, "", &[("anubis-auth", "x")])),
            SubmissionVerdict::Passed
        );
        assert_eq!(
            classify_submission(&result(200, "Challenge passed", &[])),
            SubmissionVerdict::Passed
        );
        assert_eq!(
            classify_submission(&result(200, "backend temporarily unavailable", &[("a", "b")])),
            SubmissionVerdict::Retryable
        );
        assert_eq!(classify_submission(&result(200, "hmm", &[])), SubmissionVerdict::Inconclusive);
        assert_eq!(classify_submission(&result(403, "", &[])), SubmissionVerdict::Rejected);
    }
}
