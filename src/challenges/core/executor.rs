//! Transport contract and challenge submission execution.
//!
//! Every network call in the crate (page fetches, credential probes, solution
//! submissions) goes through [`ChallengeHttpClient`], which keeps the solver,
//! the credential cache and the fetcher testable against stub transports.

use std::borrow::Cow;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{COOKIE, HeaderMap, HeaderValue, LOCATION};
use http::Method;
use thiserror::Error;
use url::Url;

use super::cookies::{format_cookie_string, parse_set_cookie_headers};
use super::types::{CookieJar, SubmissionResult};
use crate::modules::proxy::EgressPath;

/// Number of body characters kept on a [`SubmissionResult`].
const BODY_PREFIX_LEN: usize = 500;

/// Contract that abstracts the underlying HTTP transport.
///
/// Implementations route each request through the egress path it names and
/// must not share cookies between paths.
#[async_trait]
pub trait ChallengeHttpClient: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<ChallengeHttpResponse, TransportError>;
}

/// Outgoing request description.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
    pub egress: EgressPath,
    pub allow_redirects: bool,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            egress: EgressPath::Direct,
            allow_redirects: true,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: Option<Vec<u8>>) -> Self {
        self.body = body;
        self
    }

    pub fn via(mut self, egress: EgressPath) -> Self {
        self.egress = egress;
        self
    }

    pub fn with_redirects(mut self, allow: bool) -> Self {
        self.allow_redirects = allow;
        self
    }

    /// Replace the `Cookie` header. Empty jars remove it.
    pub fn with_cookies(mut self, cookies: &CookieJar) -> Self {
        self.set_cookie_header(&format_cookie_string(cookies));
        self
    }

    pub fn set_cookie_header(&mut self, cookies: &str) {
        if cookies.is_empty() {
            self.headers.remove(COOKIE);
        } else if let Ok(value) = HeaderValue::from_str(cookies) {
            self.headers.insert(COOKIE, value);
        }
    }
}

/// Minimal response representation returned by the transport abstraction.
#[derive(Debug, Clone)]
pub struct ChallengeHttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub url: Url,
    pub is_redirect: bool,
}

impl ChallengeHttpResponse {
    pub fn location(&self) -> Option<&str> {
        self.headers
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Cookies the server set on this response.
    pub fn cookies(&self) -> CookieJar {
        parse_set_cookie_headers(&self.headers)
    }
}

/// Transport-layer failure categories reported by the HTTP client itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// Connection refused, reset, aborted or dropped mid-flight.
    Connection,
    Timeout,
    Tls,
    Dns,
    /// Malformed or truncated response.
    Protocol,
    /// The request could not be built (bad URL, header, proxy).
    Request,
    Other,
}

impl TransportErrorKind {
    /// Whether retrying through another endpoint or egress may succeed.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            TransportErrorKind::Connection
                | TransportErrorKind::Timeout
                | TransportErrorKind::Tls
                | TransportErrorKind::Dns
                | TransportErrorKind::Protocol
        )
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportErrorKind::Connection => "connection",
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Tls => "tls",
            TransportErrorKind::Dns => "dns",
            TransportErrorKind::Protocol => "protocol",
            TransportErrorKind::Request => "request",
            TransportErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind} error: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Send a prepared pass-challenge request and package the answer.
///
/// Redirects are never followed here: the 302 carrying the session cookies is
/// the success signal.
pub async fn execute_challenge_submission(
    client: &dyn ChallengeHttpClient,
    request: HttpRequest,
) -> Result<SubmissionResult, TransportError> {
    let request = request.with_redirects(false);
    let response = client.send(&request).await?;

    let redirect_location = if response.status == 302 {
        response.location().map(str::to_string)
    } else {
        None
    };
    let body_prefix: String = response.text().chars().take(BODY_PREFIX_LEN).collect();

    Ok(SubmissionResult {
        status: response.status,
        cookies: response.cookies(),
        redirect_location,
        body_prefix,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::SET_COOKIE;
    use std::sync::Mutex;

    struct StubClient {
        response: ChallengeHttpResponse,
        seen: Mutex<Vec<HttpRequest>>,
    }

    #[async_trait]
    impl ChallengeHttpClient for StubClient {
        async fn send(
            &self,
            request: &HttpRequest,
        ) -> Result<ChallengeHttpResponse, TransportError> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(self.response.clone())
        }
    }

    #[tokio::test]
    async fn submission_captures_redirect_and_cookies() {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, HeaderValue::from_static("/search?q=x"));
        headers.insert(SET_COOKIE, HeaderValue::from_static("anubis-auth=jwt; Path=/"));
        let client = StubClient {
            response: ChallengeHttpResponse {
                status: 302,
                headers,
                body: Bytes::new(),
                url: Url::parse("https://mirror.example/").unwrap(),
                is_redirect: true,
            },
            seen: Mutex::new(Vec::new()),
        };

        let request = HttpRequest::get(Url::parse("https://mirror.example/pass").unwrap());
        let result = execute_challenge_submission(&client, request).await.unwrap();

        assert_eq!(result.status, 302);
        assert_eq!(result.redirect_location.as_deref(), Some("/search?q=x"));
        assert_eq!(result.cookies.get("anubis-auth").map(String::as_str), Some("jwt"));
        assert!(!client.seen.lock().unwrap()[0].allow_redirects);
    }

    #[test]
    fn classifies_transient_kinds() {
        assert!(TransportErrorKind::Timeout.is_transient());
        assert!(TransportErrorKind::Dns.is_transient());
        assert!(!TransportErrorKind::Request.is_transient());
        assert!(!TransportErrorKind::Other.is_transient());
    }
}
