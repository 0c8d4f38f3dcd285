//! Core utilities shared by challenge detectors, analyzers, and solvers.

pub mod analysis;
pub mod cookies;
pub mod executor;
pub mod reqwest_client;
pub mod timing;
pub mod types;

pub use analysis::{
    ChallengeParseError, PASS_CHALLENGE_PATH, build_submission_url, origin_from_url,
    parse_anubis_challenge,
};
pub use cookies::{
    anti_bot_cookies, format_cookie_string, merge_cookie_string, parse_cookie_string,
    parse_set_cookie_headers,
};
pub use executor::{
    ChallengeHttpClient, ChallengeHttpResponse, HttpRequest, TransportError, TransportErrorKind,
    execute_challenge_submission,
};
pub use reqwest_client::ReqwestChallengeHttpClient;
pub use timing::FailoverBackoff;
pub use types::{ChallengeDescriptor, CookieJar, Solution, SubmissionResult};
