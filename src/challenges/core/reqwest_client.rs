//! Reqwest-based implementation of the `ChallengeHttpClient` trait.
//!
//! Keeps one `reqwest::Client` per egress path (and redirect policy) so
//! connection pools and TLS sessions are never shared between proxies, and
//! maps reqwest's own error flags onto [`TransportErrorKind`].

use std::collections::HashMap;
use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header::HeaderMap, redirect::Policy};
use tokio::sync::Mutex;

use super::{ChallengeHttpClient, ChallengeHttpResponse, HttpRequest, TransportError, TransportErrorKind};
use crate::modules::proxy::EgressPath;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Reqwest-backed transport keyed by egress path.
pub struct ReqwestChallengeHttpClient {
    timeout: Duration,
    default_headers: HeaderMap,
    clients: Mutex<HashMap<(EgressPath, bool), Client>>,
}

impl ReqwestChallengeHttpClient {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
            default_headers: HeaderMap::new(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Headers applied to every request unless the request overrides them.
    pub fn with_default_headers(mut self, headers: HeaderMap) -> Self {
        self.default_headers = headers;
        self
    }

    async fn client(
        &self,
        egress: &EgressPath,
        allow_redirects: bool,
    ) -> Result<Client, TransportError> {
        let mut guard = self.clients.lock().await;
        let key = (egress.clone(), allow_redirects);
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }

        let policy = if allow_redirects {
            Policy::limited(10)
        } else {
            Policy::none()
        };

        // Cookies are managed per egress by the credential cache, not by reqwest.
        let mut builder = Client::builder()
            .redirect(policy)
            .timeout(self.timeout)
            .default_headers(self.default_headers.clone());

        if let Some(proxy_url) = egress.proxy_url() {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(|err| {
                TransportError::new(
                    TransportErrorKind::Request,
                    format!("invalid proxy {egress}: {err}"),
                )
            })?;
            builder = builder.proxy(proxy);
        } else {
            builder = builder.no_proxy();
        }

        let client = builder
            .build()
            .map_err(|err| TransportError::new(TransportErrorKind::Request, err.to_string()))?;
        log::debug!("created http client for egress {egress} (redirects={allow_redirects})");
        guard.insert(key, client.clone());
        Ok(client)
    }
}

impl Default for ReqwestChallengeHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChallengeHttpClient for ReqwestChallengeHttpClient {
    async fn send(&self, request: &HttpRequest) -> Result<ChallengeHttpResponse, TransportError> {
        let client = self.client(&request.egress, request.allow_redirects).await?;

        let mut builder = client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(into_transport_error)?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await.map_err(into_transport_error)?;

        Ok(ChallengeHttpResponse {
            status: status.as_u16(),
            headers,
            body,
            url,
            is_redirect: status.is_redirection(),
        })
    }
}

fn into_transport_error(err: reqwest::Error) -> TransportError {
    TransportError::new(classify_reqwest_error(&err), err.to_string())
}

/// Map a reqwest error onto a transport category using the client's flags and
/// the I/O error kinds in its source chain.
pub fn classify_reqwest_error(err: &reqwest::Error) -> TransportErrorKind {
    if err.is_builder() {
        return TransportErrorKind::Request;
    }
    if err.is_timeout() {
        return TransportErrorKind::Timeout;
    }

    if let Some(kind) = io_error_kind(err) {
        match kind {
            io::ErrorKind::TimedOut => return TransportErrorKind::Timeout,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::AddrNotAvailable => return TransportErrorKind::Connection,
            _ => {}
        }
    }

    if err.is_connect() {
        return TransportErrorKind::Connection;
    }
    if err.is_body() || err.is_decode() || err.is_redirect() || err.is_request() {
        return TransportErrorKind::Protocol;
    }
    TransportErrorKind::Other
}

fn io_error_kind(err: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        source = inner.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use url::Url;

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn refused_connection_is_connection_error() {
        let port = unused_port().await;
        let url = Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap();
        let client = ReqwestChallengeHttpClient::new().with_timeout(Duration::from_secs(5));

        let err = client.send(&HttpRequest::get(url)).await.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Connection);
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn malformed_proxy_is_request_error() {
        let url = Url::parse("http://127.0.0.1/").unwrap();
        let request = HttpRequest::get(url).via(EgressPath::proxy("http://[not-a-proxy"));

        let err = ReqwestChallengeHttpClient::new()
            .send(&request)
            .await
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Request);
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn silent_server_is_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            // Hold the connection open without ever answering.
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let url = Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap();
        let client = ReqwestChallengeHttpClient::new().with_timeout(Duration::from_millis(100));

        let err = client.send(&HttpRequest::get(url)).await.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Timeout);
        server.abort();
    }
}
