//! Retry loop with endpoint failover.
//!
//! [`ResilientFetcher::execute`] sends one request, retrying transient
//! transport failures with linear backoff and, when allowed, moving the
//! request to another mirror between attempts. Every outcome is reported to
//! the endpoint rotator, and a 429 invalidates the credential of the egress
//! path that received it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use http::header::{HOST, HeaderValue, ORIGIN, REFERER};
use thiserror::Error;
use url::Url;

use crate::challenges::core::{
    ChallengeHttpClient, ChallengeHttpResponse, FailoverBackoff, HttpRequest, TransportError,
    TransportErrorKind, origin_from_url,
};
use crate::challenges::detectors::ChallengeDetector;
use crate::challenges::solvers::ChallengeError;
use crate::modules::credentials::CredentialCache;
use crate::modules::endpoints::{EndpointRotator, RequestOutcome};
use crate::modules::events::{
    AttemptEvent, CredentialAction, CredentialEvent, EventDispatcher, FetchEvent, ResponseEvent,
    RetryEvent,
};

#[derive(Debug, Error)]
pub enum FetchError {
    /// Non-transient failure, surfaced without retrying.
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("request failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: TransportError },
    #[error(transparent)]
    Challenge(#[from] ChallengeError),
    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid header {0}")]
    InvalidHeader(String),
}

impl FetchError {
    /// Last transport failure behind this error, if any.
    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            FetchError::Transport(err) | FetchError::Exhausted { last: err, .. } => Some(err),
            FetchError::Challenge(err) => err.transport(),
            _ => None,
        }
    }
}

/// Response together with the URL that produced it.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub response: ChallengeHttpResponse,
    /// Request URL after any endpoint switch.
    pub url: Url,
    pub attempts: u32,
    pub outcome: RequestOutcome,
}

pub struct ResilientFetcher {
    client: Arc<dyn ChallengeHttpClient>,
    rotator: Option<Arc<EndpointRotator>>,
    credentials: Option<Arc<CredentialCache>>,
    backoff: FailoverBackoff,
    detector: ChallengeDetector,
    events: EventDispatcher,
}

impl ResilientFetcher {
    pub fn new(client: Arc<dyn ChallengeHttpClient>) -> Self {
        Self {
            client,
            rotator: None,
            credentials: None,
            backoff: FailoverBackoff::default(),
            detector: ChallengeDetector::new(),
            events: EventDispatcher::with_logging(),
        }
    }

    pub fn with_rotator(mut self, rotator: Arc<EndpointRotator>) -> Self {
        self.rotator = Some(rotator);
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<CredentialCache>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_backoff(mut self, backoff: FailoverBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }

    pub fn client(&self) -> &Arc<dyn ChallengeHttpClient> {
        &self.client
    }

    pub fn rotator(&self) -> Option<&Arc<EndpointRotator>> {
        self.rotator.as_ref()
    }

    pub fn backoff(&self) -> &FailoverBackoff {
        &self.backoff
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    pub fn detector(&self) -> &ChallengeDetector {
        &self.detector
    }

    /// Send `request`, retrying transient failures up to `max_retries` attempts in total.
    pub async fn execute(
        &self,
        mut request: HttpRequest,
        max_retries: u32,
        switch_on_network_error: bool,
    ) -> Result<Fetched, FetchError> {
        let max_attempts = max_retries.max(1);
        let mut last_error = None;

        for attempt in 0..max_attempts {
            self.events.dispatch(FetchEvent::Attempt(AttemptEvent {
                method: request.method.clone(),
                url: request.url.clone(),
                egress: request.egress.clone(),
                attempt,
                timestamp: Utc::now(),
            }));

            let started = Instant::now();
            let result = self.client.send(&request).await;
            let latency = started.elapsed();

            let err = match result {
                Ok(response) => {
                    let outcome = self.detector.classify(response.status, &response.text());
                    self.report(&request, Some(response.status), outcome, latency);
                    if response.status == 429 {
                        self.invalidate_credential(&request);
                    }
                    return Ok(Fetched {
                        response,
                        url: request.url,
                        attempts: attempt + 1,
                        outcome,
                    });
                }
                Err(err) => err,
            };

            let outcome = if err.is_transient() {
                RequestOutcome::Timeout
            } else {
                RequestOutcome::OtherError
            };
            self.report(&request, None, outcome, latency);

            if !err.is_transient() {
                log::warn!("{} {} failed: {err}", request.method, request.url);
                return Err(FetchError::Transport(err));
            }

            if attempt + 1 == max_attempts {
                last_error = Some(err);
                break;
            }

            let next_endpoint = if switch_on_network_error {
                self.switch_endpoint(&mut request)
            } else {
                None
            };
            let delay = self.backoff.delay_for(attempt);
            self.events.dispatch(FetchEvent::Retry(RetryEvent {
                url: request.url.clone(),
                attempt,
                reason: err.to_string(),
                next_endpoint,
                scheduled_after: delay,
                timestamp: Utc::now(),
            }));
            last_error = Some(err);
            sleep(delay).await;
        }

        let last = last_error.unwrap_or_else(|| {
            TransportError::new(TransportErrorKind::Other, "no attempt was made")
        });
        log::warn!(
            "giving up on {} {} after {max_attempts} attempts: {last}",
            request.method,
            request.url
        );
        Err(FetchError::Exhausted {
            attempts: max_attempts,
            last,
        })
    }

    /// Move `request` to a different endpoint. Returns the new endpoint, if any.
    pub fn switch_endpoint(&self, request: &mut HttpRequest) -> Option<Url> {
        let rotator = self.rotator.as_ref()?;
        if rotator.len() < 2 {
            return None;
        }
        let endpoint = rotator.get_replacement(&request.url);
        rewrite_endpoint(request, &endpoint);
        log::debug!("switched request to endpoint {endpoint}");
        Some(endpoint)
    }

    fn report(
        &self,
        request: &HttpRequest,
        status: Option<u16>,
        outcome: RequestOutcome,
        latency: Duration,
    ) {
        if let Some(ref rotator) = self.rotator {
            rotator.record(&request.url, outcome, latency);
        }
        self.events.dispatch(FetchEvent::Response(ResponseEvent {
            url: request.url.clone(),
            egress: request.egress.clone(),
            status,
            outcome,
            latency,
            timestamp: Utc::now(),
        }));
    }

    fn invalidate_credential(&self, request: &HttpRequest) {
        if let Some(ref credentials) = self.credentials {
            credentials.invalidate(&request.egress);
            self.events.dispatch(FetchEvent::Credential(CredentialEvent {
                egress: request.egress.clone(),
                action: CredentialAction::Invalidated,
                timestamp: Utc::now(),
            }));
        }
    }
}

/// Routes solver traffic through a [`ResilientFetcher`] so challenge fetches
/// and submissions get the same retries and health records as page loads.
///
/// Requests stay on the endpoint that issued the challenge, since a session
/// minted by one mirror is useless on another.
pub struct FailoverClient {
    fetcher: Arc<ResilientFetcher>,
    max_retries: u32,
}

impl FailoverClient {
    pub fn new(fetcher: Arc<ResilientFetcher>, max_retries: u32) -> Self {
        Self {
            fetcher,
            max_retries,
        }
    }
}

#[async_trait]
impl ChallengeHttpClient for FailoverClient {
    async fn send(&self, request: &HttpRequest) -> Result<ChallengeHttpResponse, TransportError> {
        match self
            .fetcher
            .execute(request.clone(), self.max_retries, false)
            .await
        {
            Ok(fetched) => Ok(fetched.response),
            Err(err) => Err(err
                .transport()
                .cloned()
                .unwrap_or_else(|| TransportError::new(TransportErrorKind::Other, err.to_string()))),
        }
    }
}

async fn sleep(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Move `url` onto `endpoint`, keeping path and query. Returns `false` and
/// leaves `url` untouched if any part could not be replaced.
pub fn rebase_url(url: &mut Url, endpoint: &Url) -> bool {
    let mut rebased = url.clone();
    if rebased.scheme() != endpoint.scheme() && rebased.set_scheme(endpoint.scheme()).is_err() {
        log::debug!("cannot switch scheme of {url} to {}", endpoint.scheme());
        return false;
    }
    if let Err(err) = rebased.set_host(endpoint.host_str()) {
        log::debug!("cannot switch host of {url}: {err}");
        return false;
    }
    if rebased.set_port(endpoint.port()).is_err() {
        log::debug!("cannot switch port of {url}");
        return false;
    }
    *url = rebased;
    true
}

/// Point `request` at `endpoint` and fix up headers that name the old host.
pub fn rewrite_endpoint(request: &mut HttpRequest, endpoint: &Url) {
    let old_origin = origin_from_url(&request.url);
    if !rebase_url(&mut request.url, endpoint) {
        return;
    }
    let url = &request.url;

    let Some(new_origin) = origin_from_url(url) else {
        return;
    };
    let host = match url.port() {
        Some(port) => format!("{}:{port}", url.host_str().unwrap_or_default()),
        None => url.host_str().unwrap_or_default().to_string(),
    };

    if request.headers.contains_key(HOST)
        && let Ok(value) = HeaderValue::from_str(&host)
    {
        request.headers.insert(HOST, value);
    }
    if request.headers.contains_key(ORIGIN)
        && let Ok(value) = HeaderValue::from_str(&new_origin)
    {
        request.headers.insert(ORIGIN, value);
    }

    let Some(old_origin) = old_origin else {
        return;
    };
    let rewritten_referer = request
        .headers
        .get(REFERER)
        .and_then(|value| value.to_str().ok())
        .and_then(|referer| referer.strip_prefix(old_origin.as_str()))
        .map(|rest| format!("{new_origin}{rest}"));
    if let Some(referer) = rewritten_referer
        && let Ok(value) = HeaderValue::from_str(&referer)
    {
        request.headers.insert(REFERER, value);
    }
}
