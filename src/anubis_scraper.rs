//! High level scraper orchestration.
//!
//! Wires the Anubis solver, per-egress credential cache, endpoint rotator and
//! failover fetcher together behind a single `fetch` call that transparently
//! attaches session cookies, solves challenges and moves between mirrors.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use http::HeaderMap;
use http::header::COOKIE;
use thiserror::Error;
use url::Url;

use crate::challenges::core::cookies::apply_set_cookie;
use crate::challenges::core::{
	ChallengeHttpClient, ChallengeHttpResponse, CookieJar, FailoverBackoff, HttpRequest,
	ReqwestChallengeHttpClient, TransportError, anti_bot_cookies, format_cookie_string,
	merge_cookie_string, parse_cookie_string,
};
use crate::challenges::solvers::{AnubisSolver, ChallengeHasher, ChallengeOutcome};
use crate::challenges::user_agents::{BrowserProfile, UserAgentError};
use crate::config::{ConfigError, ScraperConfig};
use crate::fetcher::{FailoverClient, FetchError, ResilientFetcher, rebase_url};
use crate::modules::clock::{Clock, SystemClock};
use crate::modules::credentials::{
	CacheStats, CredentialCache, CredentialError, CredentialProbe, CredentialSource,
	CredentialStore, ProbeError, ProbeOutcome, RedbCredentialStore, StoreError,
};
use crate::modules::endpoints::{EndpointError, EndpointRotator, EndpointSnapshot, RequestOutcome};
use crate::modules::events::{
	ChallengeEvent, CredentialAction, CredentialEvent, ErrorEvent, EventDispatcher, EventHandler,
	FetchEvent, RetryEvent,
};
use crate::modules::proxy::{EgressPath, parse_egress_list};

/// Result alias used across the orchestration layer.
pub type ScraperResult<T> = Result<T, ScraperError>;

/// High-level error surfaced by the orchestrator.
#[derive(Debug, Error)]
pub enum ScraperError {
	#[error(transparent)]
	Fetch(#[from] FetchError),
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
	#[error("endpoint list error: {0}")]
	Endpoint(#[from] EndpointError),
	#[error("credential store error: {0}")]
	Store(#[from] StoreError),
	#[error("user-agent initialisation failed: {0}")]
	UserAgent(#[from] UserAgentError),
	#[error("url parse error: {0}")]
	Url(#[from] url::ParseError),
	#[error("challenge submission rejected with status {status}")]
	ChallengeRejected { status: u16 },
	#[error("gave up after {attempts} attempts (last status {last_status:?})")]
	Exhausted {
		attempts: u32,
		last_status: Option<u16>,
	},
}

/// Read-only HTTP response returned by the scraper.
#[derive(Debug, Clone)]
pub struct FetchResponse {
	status: u16,
	headers: HeaderMap,
	body: Bytes,
	url: Url,
	cookies: CookieJar,
	egress: EgressPath,
}

impl FetchResponse {
	fn new(
		response: ChallengeHttpResponse,
		url: Url,
		mut cookies: CookieJar,
		egress: EgressPath,
	) -> Self {
		for raw in response.headers.get_all(http::header::SET_COOKIE) {
			if let Ok(raw) = raw.to_str() {
				apply_set_cookie(&mut cookies, raw);
			}
		}
		Self {
			status: response.status,
			headers: response.headers,
			body: response.body,
			url,
			cookies,
			egress,
		}
	}

	pub fn status(&self) -> u16 {
		self.status
	}

	/// Request URL after any endpoint switch.
	pub fn url(&self) -> &Url {
		&self.url
	}

	pub fn headers(&self) -> &HeaderMap {
		&self.headers
	}

	pub fn bytes(&self) -> Bytes {
		self.body.clone()
	}

	/// Body decoded as UTF-8, replacing invalid sequences.
	pub fn text(&self) -> Cow<'_, str> {
		String::from_utf8_lossy(&self.body)
	}

	/// Session cookies sent with the request plus anything the response set.
	pub fn cookies(&self) -> &CookieJar {
		&self.cookies
	}

	pub fn cookie_header(&self) -> String {
		format_cookie_string(&self.cookies)
	}

	pub fn egress(&self) -> &EgressPath {
		&self.egress
	}
}

/// Builder for [`AnubisScraper`].
pub struct AnubisScraperBuilder {
	config: ScraperConfig,
	client: Option<Arc<dyn ChallengeHttpClient>>,
	clock: Option<Arc<dyn Clock>>,
	store: Option<Arc<dyn CredentialStore>>,
	hasher: Option<Arc<dyn ChallengeHasher>>,
	backoff: Option<FailoverBackoff>,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl AnubisScraperBuilder {
	pub fn new() -> Self {
		Self {
			config: ScraperConfig::default(),
			client: None,
			clock: None,
			store: None,
			hasher: None,
			backoff: None,
			handlers: Vec::new(),
		}
	}

	pub fn with_config(mut self, config: ScraperConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_endpoints<I, S>(mut self, endpoints: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.config.rotation.endpoints = endpoints.into_iter().map(Into::into).collect();
		self
	}

	/// Proxy URLs to spread requests over; `NO_PROXY` stands for a direct connection.
	pub fn with_egress<I, S>(mut self, egress: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.config.credentials.egress = egress.into_iter().map(Into::into).collect();
		self
	}

	pub fn with_cooldown(mut self, enabled: bool) -> Self {
		self.config.rotation.cooldown_enabled = enabled;
		self
	}

	pub fn with_max_retries(mut self, retries: u32) -> Self {
		self.config.retry.max_retries = retries.max(1);
		self
	}

	/// Override the backoff derived from the retry config.
	pub fn with_backoff(mut self, backoff: FailoverBackoff) -> Self {
		self.backoff = Some(backoff);
		self
	}

	pub fn with_client(mut self, client: Arc<dyn ChallengeHttpClient>) -> Self {
		self.client = Some(client);
		self
	}

	pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = Some(clock);
		self
	}

	pub fn with_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
		self.store = Some(store);
		self
	}

	pub fn with_hasher(mut self, hasher: Arc<dyn ChallengeHasher>) -> Self {
		self.hasher = Some(hasher);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
		self.config.solver.user_agent = Some(user_agent.into());
		self
	}

	pub fn with_max_iterations(mut self, iterations: u64) -> Self {
		self.config.solver.max_iterations = iterations;
		self
	}

	pub fn with_force_fresh(mut self, force_fresh: bool) -> Self {
		self.config.solver.force_fresh = force_fresh;
		self
	}

	pub fn build(self) -> ScraperResult<AnubisScraper> {
		self.config.validate()?;
		let config = self.config;

		let profile = match config.solver.user_agent {
			Some(ref user_agent) => BrowserProfile::custom(user_agent.clone())?,
			None => BrowserProfile::default(),
		};
		let client: Arc<dyn ChallengeHttpClient> = match self.client {
			Some(client) => client,
			None => Arc::new(
				ReqwestChallengeHttpClient::new().with_timeout(config.retry.request_timeout()),
			),
		};
		let clock: Arc<dyn Clock> = match self.clock {
			Some(clock) => clock,
			None => Arc::new(SystemClock),
		};

		let rotator = if config.rotation.endpoints.is_empty() {
			None
		} else {
			let rotator = EndpointRotator::new(&config.rotation.endpoints)?
				.with_policy(config.rotation.policy())
				.with_clock(clock.clone());
			Some(Arc::new(rotator))
		};

		let mut credentials = CredentialCache::new(parse_egress_list(&config.credentials.egress))
			.with_policy(config.credentials.policy())
			.with_clock(clock);
		let store = match (self.store, &config.credentials.store_path) {
			(Some(store), _) => Some(store),
			(None, Some(path)) => {
				Some(Arc::new(RedbCredentialStore::open(path)?) as Arc<dyn CredentialStore>)
			}
			(None, None) => None,
		};
		if let Some(store) = store {
			credentials = credentials.with_store(store)?;
		}
		let credentials = Arc::new(credentials);

		let mut events = EventDispatcher::with_logging();
		for handler in self.handlers {
			events.register_handler(handler);
		}

		let mut fetcher = ResilientFetcher::new(client)
			.with_credentials(credentials.clone())
			.with_backoff(self.backoff.unwrap_or_else(|| config.retry.backoff()))
			.with_events(events.clone());
		if let Some(ref rotator) = rotator {
			fetcher = fetcher.with_rotator(rotator.clone());
		}
		let fetcher = Arc::new(fetcher);

		let solver_client = FailoverClient::new(fetcher.clone(), config.retry.max_retries);
		let mut solver = AnubisSolver::new(Arc::new(solver_client))
			.with_profile(profile.clone())
			.with_max_iterations(config.solver.max_iterations);
		if let Some(hasher) = self.hasher {
			solver = solver.with_hasher(hasher);
		}

		log::info!(
			"scraper ready: {} endpoints, {} egress paths",
			rotator.as_ref().map_or(0, |r| r.len()),
			credentials.egress_paths().len()
		);

		Ok(AnubisScraper {
			config,
			fetcher,
			solver: Arc::new(solver),
			credentials,
			rotator,
			events,
			profile,
		})
	}
}

impl Default for AnubisScraperBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Main scraper orchestrator.
pub struct AnubisScraper {
	config: ScraperConfig,
	fetcher: Arc<ResilientFetcher>,
	solver: Arc<AnubisSolver>,
	credentials: Arc<CredentialCache>,
	rotator: Option<Arc<EndpointRotator>>,
	events: EventDispatcher,
	profile: BrowserProfile,
}

impl AnubisScraper {
	/// Construct a scraper with default configuration.
	pub fn new() -> ScraperResult<Self> {
		Self::builder().build()
	}

	/// Obtain a builder to customise the scraper instance.
	pub fn builder() -> AnubisScraperBuilder {
		AnubisScraperBuilder::new()
	}

	pub fn from_config(config: ScraperConfig) -> ScraperResult<Self> {
		Self::builder().with_config(config).build()
	}

	pub fn config(&self) -> &ScraperConfig {
		&self.config
	}

	pub fn fetcher(&self) -> &ResilientFetcher {
		&self.fetcher
	}

	pub fn solver(&self) -> &AnubisSolver {
		&self.solver
	}

	pub fn credentials(&self) -> &Arc<CredentialCache> {
		&self.credentials
	}

	pub fn rotator(&self) -> Option<&Arc<EndpointRotator>> {
		self.rotator.as_ref()
	}

	pub fn endpoint_statistics(&self) -> Vec<EndpointSnapshot> {
		self.rotator
			.as_ref()
			.map(|rotator| rotator.statistics())
			.unwrap_or_default()
	}

	pub fn credential_stats(&self) -> CacheStats {
		self.credentials.stats()
	}

	/// Perform a GET request with default headers.
	pub async fn get(&self, url: &str) -> ScraperResult<FetchResponse> {
		self.fetch(url, HeaderMap::new(), None).await
	}

	/// GET `path` on the next endpoint chosen by the rotator.
	pub async fn get_path(&self, path: &str) -> ScraperResult<FetchResponse> {
		let url = match self.rotator {
			Some(ref rotator) => rotator.get_next().join(path)?,
			None => Url::parse(path)?,
		};
		self.fetch(url.as_str(), HeaderMap::new(), None).await
	}

	/// Fetch `url`, attaching the session cookies of `egress` (or of the next
	/// egress path in rotation) and solving any challenge on the way.
	pub async fn fetch(
		&self,
		url: &str,
		headers: HeaderMap,
		egress: Option<EgressPath>,
	) -> ScraperResult<FetchResponse> {
		let mut url = Url::parse(url)?;
		let egress = egress.unwrap_or_else(|| self.credentials.next_egress());
		let caller_cookies = headers
			.get(COOKIE)
			.and_then(|value| value.to_str().ok())
			.unwrap_or_default()
			.to_string();
		let base_headers = self.request_headers(&headers);
		let mut session = parse_cookie_string(&self.session_cookies(&egress, &url).await);

		let retry = &self.config.retry;
		let max_attempts = retry.max_logical_attempts.max(1);
		let mut last_status = None;

		for attempt in 0..max_attempts {
			let mut request = HttpRequest::get(url.clone())
				.with_headers(base_headers.clone())
				.via(egress.clone());
			request.set_cookie_header(&merge_cookie_string(&caller_cookies, &session));

			let fetched = match self
				.fetcher
				.execute(request, retry.max_retries, retry.switch_on_network_error)
				.await
			{
				Ok(fetched) => fetched,
				Err(err) => {
					self.events.dispatch(FetchEvent::Error(ErrorEvent {
						url: url.clone(),
						error: err.to_string(),
						timestamp: Utc::now(),
					}));
					return Err(err.into());
				}
			};
			url = fetched.url;
			let status = fetched.response.status;
			last_status = Some(status);

			match fetched.outcome {
				RequestOutcome::Success | RequestOutcome::OtherError => {
					return Ok(FetchResponse::new(fetched.response, url, session, egress));
				}
				RequestOutcome::RateLimited | RequestOutcome::Timeout => {
					let next_endpoint = self.switch_endpoint(&mut url);
					self.events.dispatch(FetchEvent::Retry(RetryEvent {
						url: url.clone(),
						attempt,
						reason: format!("{:?} (status {status})", fetched.outcome),
						next_endpoint,
						scheduled_after: std::time::Duration::ZERO,
						timestamp: Utc::now(),
					}));
					if status == 429 {
						session = parse_cookie_string(&self.session_cookies(&egress, &url).await);
					}
				}
				RequestOutcome::ChallengePresented => {
					let body = fetched.response.text().into_owned();
					let outcome = match self
						.solver
						.solve_and_apply(&url, Some(&body), &egress, self.config.solver.force_fresh)
						.await
					{
						Ok(outcome) => outcome,
						Err(err) if err.transport().is_some_and(TransportError::is_transient) => {
							// The mirror went away mid-challenge; count it as a failed attempt.
							let next_endpoint = self.switch_endpoint(&mut url);
							let delay = self.fetcher.backoff().delay_for(attempt);
							self.events.dispatch(FetchEvent::Retry(RetryEvent {
								url: url.clone(),
								attempt,
								reason: err.to_string(),
								next_endpoint,
								scheduled_after: delay,
								timestamp: Utc::now(),
							}));
							if !delay.is_zero() {
								tokio::time::sleep(delay).await;
							}
							continue;
						}
						Err(err) => return Err(FetchError::from(err).into()),
					};
					self.report_challenge(&url, &egress, &outcome);

					match outcome {
						ChallengeOutcome::Solved { cookies, .. } => {
							session.extend(cookies);
							self.remember(&egress, CredentialSource::Solved, &session);
						}
						ChallengeOutcome::NotRequired { cookies } => {
							let captured = !anti_bot_cookies(&cookies).is_empty();
							session.extend(cookies);
							if captured {
								self.remember(&egress, CredentialSource::Captured, &session);
							}
						}
						ChallengeOutcome::Retryable { .. } => {
							let delay = self.fetcher.backoff().delay_for(attempt);
							log::info!("challenge backend busy; retrying {url} in {delay:?}");
							if !delay.is_zero() {
								tokio::time::sleep(delay).await;
							}
						}
						ChallengeOutcome::Inconclusive { status } => {
							log::warn!("challenge submission for {url} inconclusive (status {status})");
						}
						ChallengeOutcome::Rejected { status } => {
							self.credentials.mark_failed(&egress);
							return Err(ScraperError::ChallengeRejected { status });
						}
					}
				}
			}
		}

		log::warn!("giving up on {url} via {egress} after {max_attempts} attempts");
		Err(ScraperError::Exhausted {
			attempts: max_attempts,
			last_status,
		})
	}

	/// Navigation headers from the browser profile, overridden by `caller`.
	fn request_headers(&self, caller: &HeaderMap) -> HeaderMap {
		let mut headers = self.profile.navigation_headers();
		for name in caller.keys() {
			if name == COOKIE {
				continue;
			}
			headers.remove(name);
			for value in caller.get_all(name) {
				headers.append(name.clone(), value.clone());
			}
		}
		headers
	}

	async fn session_cookies(&self, egress: &EgressPath, url: &Url) -> String {
		let probe = ChallengeProbe {
			scraper: self,
			base: url.clone(),
		};
		match self.credentials.get_or_refresh(egress, &probe).await {
			Ok(cookies) => cookies,
			Err(CredentialError::Throttled { retry_in, .. }) => {
				log::debug!("no fresh credential for {egress} for another {retry_in:?}");
				String::new()
			}
			Err(err) => {
				log::warn!("continuing without credential for {egress}: {err}");
				self.events.dispatch(FetchEvent::Credential(CredentialEvent {
					egress: egress.clone(),
					action: CredentialAction::Failed,
					timestamp: Utc::now(),
				}));
				String::new()
			}
		}
	}

	fn remember(&self, egress: &EgressPath, source: CredentialSource, cookies: &CookieJar) {
		self.credentials.store(egress, source, cookies);
		self.events.dispatch(FetchEvent::Credential(CredentialEvent {
			egress: egress.clone(),
			action: CredentialAction::Refreshed,
			timestamp: Utc::now(),
		}));
	}

	fn switch_endpoint(&self, url: &mut Url) -> Option<Url> {
		let rotator = self.rotator.as_ref()?;
		if rotator.len() < 2 {
			return None;
		}
		let endpoint = rotator.get_replacement(url);
		rebase_url(url, &endpoint).then_some(endpoint)
	}

	fn report_challenge(&self, url: &Url, egress: &EgressPath, outcome: &ChallengeOutcome) {
		let detail = match outcome {
			ChallengeOutcome::NotRequired { .. } => "not required".to_string(),
			ChallengeOutcome::Solved { solution, .. } => {
				format!("solved with nonce {} in {:?}", solution.nonce, solution.elapsed)
			}
			ChallengeOutcome::Retryable { status } => format!("backend busy (status {status})"),
			ChallengeOutcome::Inconclusive { status } => format!("inconclusive (status {status})"),
			ChallengeOutcome::Rejected { status } => format!("rejected (status {status})"),
		};
		self.events.dispatch(FetchEvent::Challenge(ChallengeEvent {
			url: url.clone(),
			egress: egress.clone(),
			success: outcome.is_success(),
			detail,
			timestamp: Utc::now(),
		}));
	}
}

/// Refreshes a credential by requesting a page known to trigger the challenge.
struct ChallengeProbe<'a> {
	scraper: &'a AnubisScraper,
	base: Url,
}

#[async_trait]
impl<'a> CredentialProbe for ChallengeProbe<'a> {
	async fn probe(&self, egress: &EgressPath) -> Result<ProbeOutcome, ProbeError> {
		let scraper = self.scraper;
		let url = self
			.base
			.join(&scraper.config.credentials.probe_path)
			.map_err(|err| ProbeError::Failed(err.to_string()))?;
		let request = HttpRequest::get(url.clone())
			.with_headers(scraper.profile.navigation_headers())
			.via(egress.clone());

		let retry = &scraper.config.retry;
		let fetched = scraper
			.fetcher
			.execute(request, retry.max_retries, retry.switch_on_network_error)
			.await
			.map_err(|err| ProbeError::Failed(err.to_string()))?;

		if fetched.outcome == RequestOutcome::ChallengePresented {
			let body = fetched.response.text().into_owned();
			let outcome = scraper
				.solver
				.solve_and_apply(&fetched.url, Some(&body), egress, scraper.config.solver.force_fresh)
				.await
				.map_err(|err| ProbeError::Failed(err.to_string()))?;
			scraper.report_challenge(&fetched.url, egress, &outcome);
			return match outcome {
				ChallengeOutcome::Solved { cookies, .. } => Ok(ProbeOutcome::Solved(cookies)),
				ChallengeOutcome::NotRequired { cookies } if !anti_bot_cookies(&cookies).is_empty() => {
					Ok(ProbeOutcome::Captured(cookies))
				}
				ChallengeOutcome::NotRequired { .. } => Ok(ProbeOutcome::NoChallenge),
				ChallengeOutcome::Rejected { status } => Err(ProbeError::Rejected(status)),
				ChallengeOutcome::Retryable { status } | ChallengeOutcome::Inconclusive { status } => {
					Err(ProbeError::Failed(format!("challenge not settled (status {status})")))
				}
			};
		}

		let cookies = anti_bot_cookies(&fetched.response.cookies());
		if !cookies.is_empty() {
			Ok(ProbeOutcome::Captured(cookies))
		} else if fetched.response.status >= 400 {
			Err(ProbeError::Failed(format!(
				"probe {url} answered {}",
				fetched.response.status
			)))
		} else {
			Ok(ProbeOutcome::NoChallenge)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use http::HeaderValue;
	use http::header::{ACCEPT, USER_AGENT};

	#[test]
	fn build_rejects_invalid_config() {
		let mut config = ScraperConfig::default();
		config.retry.max_logical_attempts = 0;
		assert!(matches!(
			AnubisScraper::from_config(config),
			Err(ScraperError::Config(_))
		));
	}

	#[test]
	fn build_rejects_empty_user_agent() {
		assert!(matches!(
			AnubisScraper::builder().with_user_agent("").build(),
			Err(ScraperError::UserAgent(_))
		));
	}

	#[test]
	fn builder_wires_rotator_and_egress() {
		let scraper = AnubisScraper::builder()
			.with_endpoints(["mirror-a.example", "mirror-b.example"])
			.with_egress(["NO_PROXY", "http://10.0.0.1:3128"])
			.build()
			.unwrap();
		assert_eq!(scraper.rotator().map(|r| r.len()), Some(2));
		assert_eq!(scraper.credentials().egress_paths().len(), 2);
		assert_eq!(scraper.endpoint_statistics().len(), 2);
		assert_eq!(scraper.credential_stats().cached, 0);
	}

	#[test]
	fn caller_headers_override_profile() {
		let scraper = AnubisScraper::new().unwrap();
		let mut caller = HeaderMap::new();
		caller.insert(ACCEPT, HeaderValue::from_static("application/json"));
		caller.insert(COOKIE, HeaderValue::from_static("a=1"));

		let headers = scraper.request_headers(&caller);
		assert_eq!(headers.get(ACCEPT).unwrap(), "application/json");
		assert!(headers.get(USER_AGENT).is_some());
		assert!(headers.get(COOKIE).is_none());
	}

	#[test]
	fn response_merges_set_cookie_into_session() {
		let mut headers = HeaderMap::new();
		headers.append(
			http::header::SET_COOKIE,
			HeaderValue::from_static("guest=1; Path=/"),
		);
		headers.append(
			http::header::SET_COOKIE,
			HeaderValue::from_static("stale=x; Max-Age=0"),
		);
		let url = Url::parse("https://mirror.example/").unwrap();
		let response = ChallengeHttpResponse {
			status: 200,
			headers,
			body: Bytes::from_static(b"ok"),
			url: url.clone(),
			is_redirect: false,
		};
		let session = CookieJar::from([
			("techaro.lol-anubis-auth".to_string(), "jwt".to_string()),
			("stale".to_string(), "old".to_string()),
		]);

		let response = FetchResponse::new(response, url, session, EgressPath::Direct);
		assert_eq!(response.status(), 200);
		assert_eq!(response.text(), "ok");
		assert_eq!(response.cookies().get("guest").map(String::as_str), Some("1"));
		assert!(!response.cookies().contains_key("stale"));
		assert_eq!(response.cookie_header(), "guest=1; techaro.lol-anubis-auth=jwt");
	}
}
