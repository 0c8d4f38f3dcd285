//! Upstream endpoint rotation.
//!
//! Hands out redundant mirror endpoints round-robin from a random starting
//! offset and keeps per-endpoint outcome statistics. Rate limits and timeouts
//! are counted and logged but only exclude an endpoint when the cooldown
//! policy is switched on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::challenges::core::origin_from_url;
use crate::modules::clock::{Clock, SystemClock, chrono_duration};

const RATE_LIMIT_DECAY_MINUTES: f64 = 5.0;

/// Classification of a single request, shared by the rotator and the credential cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RequestOutcome {
    Success,
    RateLimited,
    Timeout,
    ChallengePresented,
    OtherError,
}

impl RequestOutcome {
    /// Classify from the success flag and status; a missing status means the
    /// request never got an answer.
    pub fn classify(success: bool, status: Option<u16>) -> Self {
        match status {
            Some(429) => RequestOutcome::RateLimited,
            None | Some(502) | Some(504) => RequestOutcome::Timeout,
            Some(_) if success => RequestOutcome::Success,
            Some(_) => RequestOutcome::OtherError,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, RequestOutcome::Success)
    }
}

/// What to do with endpoints that keep failing.
#[derive(Debug, Clone, PartialEq)]
pub struct RotationPolicy {
    /// Skip rate-limited or timed-out endpoints for `cooldown`. Off by default:
    /// every endpoint stays in rotation whatever happens to it.
    pub cooldown_enabled: bool,
    pub cooldown: Duration,
    /// Consecutive rate limits/timeouts after which a warning is logged.
    pub loud_failure_threshold: u32,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            cooldown_enabled: false,
            cooldown: Duration::from_secs(60),
            loud_failure_threshold: 3,
        }
    }
}

/// Per-endpoint counters.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub endpoint: String,
    pub total_requests: u64,
    pub successes: u64,
    pub rate_limited: u64,
    pub timeouts: u64,
    pub challenges: u64,
    pub other_errors: u64,
    pub consecutive_rate_limits: u32,
    pub consecutive_timeouts: u32,
    /// Incremental mean over all recorded requests, in milliseconds.
    pub avg_latency_ms: f64,
    pub last_used: Option<DateTime<Utc>>,
    pub last_rate_limited: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl EndpointStats {
    fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            total_requests: 0,
            successes: 0,
            rate_limited: 0,
            timeouts: 0,
            challenges: 0,
            other_errors: 0,
            consecutive_rate_limits: 0,
            consecutive_timeouts: 0,
            avg_latency_ms: 0.0,
            last_used: None,
            last_rate_limited: None,
            cooldown_until: None,
        }
    }

    fn record(&mut self, outcome: RequestOutcome, latency: Duration, now: DateTime<Utc>) {
        self.total_requests += 1;
        self.last_used = Some(now);

        let n = self.total_requests as f64;
        let sample = latency.as_secs_f64() * 1_000.0;
        self.avg_latency_ms = (self.avg_latency_ms * (n - 1.0) + sample) / n;

        match outcome {
            RequestOutcome::Success => {
                self.successes += 1;
                self.consecutive_rate_limits = 0;
                self.consecutive_timeouts = 0;
            }
            RequestOutcome::RateLimited => {
                self.rate_limited += 1;
                self.consecutive_rate_limits += 1;
                self.last_rate_limited = Some(now);
            }
            RequestOutcome::Timeout => {
                self.timeouts += 1;
                self.consecutive_timeouts += 1;
            }
            RequestOutcome::ChallengePresented => self.challenges += 1,
            RequestOutcome::OtherError => self.other_errors += 1,
        }
    }

    /// Advisory ranking; never consulted by [`EndpointRotator::get_next`].
    pub fn score(&self, now: DateTime<Utc>) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }

        let attempts = self.total_requests.saturating_sub(self.rate_limited);
        let mut score = if attempts > 0 {
            self.successes as f64 / attempts as f64
        } else {
            0.0
        };

        if let Some(last) = self.last_rate_limited {
            let minutes = (now - last).num_milliseconds().max(0) as f64 / 60_000.0;
            if minutes < RATE_LIMIT_DECAY_MINUTES {
                score -= 0.5 * (RATE_LIMIT_DECAY_MINUTES - minutes) / RATE_LIMIT_DECAY_MINUTES;
            }
        }

        let avg_secs = self.avg_latency_ms / 1_000.0;
        if avg_secs > 1.0 {
            score -= ((avg_secs - 1.0) * 0.1).min(0.3);
        }

        if self.total_requests > 10
            && (self.rate_limited as f64 / self.total_requests as f64) < 0.1
        {
            score += 0.2;
        }

        score.max(0.0)
    }

    fn cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }
}

/// Reporting view of one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    #[serde(flatten)]
    pub stats: EndpointStats,
    pub score: f64,
    pub in_cooldown: bool,
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("at least one endpoint is required")]
    Empty,
    #[error("invalid endpoint {endpoint}: {source}")]
    Invalid {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
    #[error("endpoint {0} has no host")]
    MissingHost(String),
}

/// Round-robin selector over a fixed endpoint list.
pub struct EndpointRotator {
    endpoints: Vec<Url>,
    index: HashMap<String, usize>,
    stats: Vec<Mutex<EndpointStats>>,
    cursor: AtomicUsize,
    policy: RotationPolicy,
    clock: Arc<dyn Clock>,
}

impl EndpointRotator {
    /// Build a rotator; endpoints may be bare hosts (`https` is assumed).
    pub fn new<I, S>(endpoints: I) -> Result<Self, EndpointError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed: Vec<Url> = Vec::new();
        let mut index = HashMap::new();
        for raw in endpoints {
            let url = parse_endpoint(raw.as_ref())?;
            let key = endpoint_key(&url);
            if index.contains_key(&key) {
                continue;
            }
            index.insert(key, parsed.len());
            parsed.push(url);
        }

        if parsed.is_empty() {
            return Err(EndpointError::Empty);
        }

        let start = rand::thread_rng().gen_range(0..parsed.len());
        let stats = parsed
            .iter()
            .map(|url| Mutex::new(EndpointStats::new(&endpoint_key(url))))
            .collect();

        log::debug!("endpoint rotation over {} endpoints starting at {start}", parsed.len());

        Ok(Self {
            endpoints: parsed,
            index,
            stats,
            cursor: AtomicUsize::new(start),
            policy: RotationPolicy::default(),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_policy(mut self, policy: RotationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Pin the starting offset (mostly for tests).
    pub fn with_start_offset(self, offset: usize) -> Self {
        self.cursor.store(offset % self.endpoints.len(), Ordering::Relaxed);
        self
    }

    pub fn policy(&self) -> &RotationPolicy {
        &self.policy
    }

    pub fn endpoints(&self) -> &[Url] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn contains(&self, url: &Url) -> bool {
        self.index.contains_key(&endpoint_key(url))
    }

    /// Next endpoint in round-robin order.
    pub fn get_next(&self) -> Url {
        let n = self.endpoints.len();
        if self.policy.cooldown_enabled {
            let now = self.clock.now();
            for _ in 0..n {
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
                if !self.lock(idx).cooling_down(now) {
                    return self.endpoints[idx].clone();
                }
            }
            log::warn!("all {n} endpoints cooling down; rotating anyway");
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        self.endpoints[idx].clone()
    }

    /// Next endpoint that differs from `current` when there is more than one.
    pub fn get_replacement(&self, current: &Url) -> Url {
        let current_key = endpoint_key(current);
        let mut candidate = self.get_next();
        for _ in 1..self.endpoints.len() {
            if endpoint_key(&candidate) != current_key {
                break;
            }
            candidate = self.get_next();
        }
        candidate
    }

    /// Record a raw result. `status` is `None` when no response arrived.
    pub fn record_outcome(
        &self,
        endpoint: &Url,
        success: bool,
        latency: Duration,
        status: Option<u16>,
    ) {
        self.record(endpoint, RequestOutcome::classify(success, status), latency);
    }

    pub fn record(&self, endpoint: &Url, outcome: RequestOutcome, latency: Duration) {
        let key = endpoint_key(endpoint);
        let Some(&idx) = self.index.get(&key) else {
            log::debug!("ignoring outcome for unknown endpoint {key}");
            return;
        };

        let now = self.clock.now();
        let mut stats = self.lock(idx);
        stats.record(outcome, latency, now);

        let threshold = self.policy.loud_failure_threshold;
        match outcome {
            RequestOutcome::RateLimited => {
                log::warn!(
                    "endpoint {key} rate limited ({} consecutive, {} total)",
                    stats.consecutive_rate_limits,
                    stats.rate_limited
                );
                if stats.consecutive_rate_limits >= threshold {
                    log::warn!(
                        "endpoint {key} hit {} consecutive rate limits; still in rotation",
                        stats.consecutive_rate_limits
                    );
                }
            }
            RequestOutcome::Timeout if stats.consecutive_timeouts >= threshold => {
                log::warn!(
                    "endpoint {key} timed out {} times in a row; still in rotation",
                    stats.consecutive_timeouts
                );
            }
            _ => {}
        }

        if self.policy.cooldown_enabled
            && matches!(outcome, RequestOutcome::RateLimited | RequestOutcome::Timeout)
        {
            stats.cooldown_until = Some(now + chrono_duration(self.policy.cooldown));
            log::info!("endpoint {key} cooling down for {:?}", self.policy.cooldown);
        }
    }

    /// Advisory score, `None` for unknown endpoints.
    pub fn score(&self, endpoint: &Url) -> Option<f64> {
        let idx = *self.index.get(&endpoint_key(endpoint))?;
        Some(self.lock(idx).score(self.clock.now()))
    }

    pub fn statistics(&self) -> Vec<EndpointSnapshot> {
        let now = self.clock.now();
        (0..self.endpoints.len())
            .map(|idx| {
                let stats = self.lock(idx).clone();
                EndpointSnapshot {
                    score: stats.score(now),
                    in_cooldown: stats.cooling_down(now),
                    stats,
                }
            })
            .collect()
    }

    /// Up to `limit` endpoints ordered by descending score.
    pub fn best_endpoints(&self, limit: usize) -> Vec<Url> {
        let now = self.clock.now();
        let mut scored: Vec<(f64, usize)> = (0..self.endpoints.len())
            .map(|idx| (self.lock(idx).score(now), idx))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        scored
            .into_iter()
            .take(limit)
            .map(|(_, idx)| self.endpoints[idx].clone())
            .collect()
    }

    /// Clear statistics for one endpoint, or for all when `endpoint` is `None`.
    pub fn reset(&self, endpoint: Option<&Url>) {
        match endpoint {
            Some(url) => {
                if let Some(&idx) = self.index.get(&endpoint_key(url)) {
                    let mut stats = self.lock(idx);
                    *stats = EndpointStats::new(&stats.endpoint);
                }
            }
            None => {
                for idx in 0..self.endpoints.len() {
                    let mut stats = self.lock(idx);
                    *stats = EndpointStats::new(&stats.endpoint);
                }
            }
        }
    }

    /// Clear consecutive failure counters and any cooldown. Returns `false` for unknown endpoints.
    pub fn force_enable(&self, endpoint: &Url) -> bool {
        let Some(&idx) = self.index.get(&endpoint_key(endpoint)) else {
            return false;
        };
        let mut stats = self.lock(idx);
        stats.consecutive_rate_limits = 0;
        stats.consecutive_timeouts = 0;
        stats.cooldown_until = None;
        log::info!("endpoint {} force-enabled", stats.endpoint);
        true
    }

    fn lock(&self, idx: usize) -> std::sync::MutexGuard<'_, EndpointStats> {
        self.stats[idx].lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_endpoint(raw: &str) -> Result<Url, EndpointError> {
    let trimmed = raw.trim().trim_end_matches('/');
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let mut url = Url::parse(&candidate).map_err(|source| EndpointError::Invalid {
        endpoint: raw.to_string(),
        source,
    })?;
    if url.host_str().is_none() {
        return Err(EndpointError::MissingHost(raw.to_string()));
    }
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// Identity of an endpoint: scheme, host and explicit port.
pub fn endpoint_key(url: &Url) -> String {
    origin_from_url(url).unwrap_or_else(|| url.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::clock::ManualClock;

    fn rotator(endpoints: &[&str]) -> EndpointRotator {
        EndpointRotator::new(endpoints).unwrap()
    }

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[test]
    fn round_robin_visits_each_endpoint_evenly() {
        let rotator = rotator(&["a.example", "b.example", "c.example"]);
        let n = 10;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..n {
            *counts.entry(endpoint_key(&rotator.get_next())).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        for count in counts.values() {
            assert!(*count == n / 3 || *count == n.div_ceil(3), "uneven: {counts:?}");
        }
    }

    #[test]
    fn rate_limits_never_remove_an_endpoint() {
        let rotator = rotator(&["a.example", "b.example", "c.example"]);
        let victim = url("https://a.example/");
        for _ in 0..50 {
            rotator.record_outcome(&victim, false, Duration::from_millis(100), Some(429));
        }

        let seen: Vec<String> = (0..3).map(|_| endpoint_key(&rotator.get_next())).collect();
        assert!(seen.contains(&"https://a.example".to_string()));

        let stats = rotator.statistics();
        let a = stats.iter().find(|s| s.stats.endpoint == "https://a.example").unwrap();
        assert_eq!(a.stats.consecutive_rate_limits, 50);
        assert!(!a.in_cooldown);
    }

    #[test]
    fn cooldown_policy_skips_failing_endpoint_until_all_fail() {
        let clock = Arc::new(ManualClock::default());
        let rotator = rotator(&["a.example", "b.example"])
            .with_policy(RotationPolicy {
                cooldown_enabled: true,
                ..RotationPolicy::default()
            })
            .with_clock(clock.clone())
            .with_start_offset(0);

        let a = url("https://a.example/");
        let b = url("https://b.example/");
        rotator.record_outcome(&a, false, Duration::ZERO, Some(429));
        for _ in 0..4 {
            assert_eq!(rotator.get_next(), b);
        }

        rotator.record_outcome(&b, false, Duration::ZERO, None);
        // Both cooling: rotation continues rather than starving.
        let _ = rotator.get_next();

        clock.advance(Duration::from_secs(61));
        let seen: Vec<Url> = (0..2).map(|_| rotator.get_next()).collect();
        assert!(seen.contains(&a));

        rotator.record_outcome(&a, false, Duration::ZERO, Some(429));
        assert!(rotator.force_enable(&a));
        assert!(!rotator.statistics()[0].in_cooldown);
    }

    #[test]
    fn replacement_differs_from_current() {
        let rotator = rotator(&["a.example", "b.example", "c.example"]);
        let current = url("https://b.example/search?q=x");
        for _ in 0..6 {
            assert_ne!(endpoint_key(&rotator.get_replacement(&current)), "https://b.example");
        }
    }

    #[test]
    fn tracks_rolling_latency_and_counters() {
        let rotator = rotator(&["a.example"]);
        let a = url("https://a.example/");
        rotator.record_outcome(&a, true, Duration::from_millis(100), Some(200));
        rotator.record_outcome(&a, true, Duration::from_millis(300), Some(200));
        rotator.record_outcome(&a, false, Duration::from_millis(500), Some(502));

        let snapshot = rotator.statistics();
        let stats = &snapshot[0].stats;
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.successes, 2);
        assert_eq!(stats.timeouts, 1);
        assert!((stats.avg_latency_ms - 300.0).abs() < 1e-6);

        rotator.record_outcome(&a, true, Duration::from_millis(100), Some(200));
        assert_eq!(rotator.statistics()[0].stats.consecutive_timeouts, 0);
    }

    #[test]
    fn score_penalises_recent_rate_limits_and_decays() {
        let clock = Arc::new(ManualClock::default());
        let rotator = rotator(&["a.example", "b.example"]).with_clock(clock.clone());
        let a = url("https://a.example/");
        let b = url("https://b.example/");

        assert_eq!(rotator.score(&a), Some(1.0));

        rotator.record_outcome(&a, true, Duration::from_millis(200), Some(200));
        rotator.record_outcome(&a, false, Duration::from_millis(200), Some(429));
        rotator.record_outcome(&b, true, Duration::from_millis(200), Some(200));

        // 1 success over 1 non-rate-limited attempt, minus the full fresh penalty.
        assert!((rotator.score(&a).unwrap() - 0.5).abs() < 1e-9);
        assert_eq!(rotator.best_endpoints(1), vec![b.clone()]);

        clock.advance(Duration::from_secs(5 * 60));
        assert!((rotator.score(&a).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn score_rewards_stable_endpoints_and_penalises_latency() {
        let rotator = rotator(&["a.example"]);
        let a = url("https://a.example/");
        for _ in 0..11 {
            rotator.record_outcome(&a, true, Duration::from_millis(3_000), Some(200));
        }
        // 1.0 - min(0.3, 0.2) + 0.2
        assert!((rotator.score(&a).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn reset_clears_statistics() {
        let rotator = rotator(&["a.example", "b.example"]);
        let a = url("https://a.example/");
        rotator.record_outcome(&a, false, Duration::ZERO, Some(429));
        rotator.reset(Some(&a));
        assert_eq!(rotator.score(&a), Some(1.0));
        assert_eq!(rotator.statistics()[0].stats.total_requests, 0);
    }

    #[test]
    fn rejects_empty_and_deduplicates() {
        assert!(matches!(
            EndpointRotator::new(Vec::<String>::new()),
            Err(EndpointError::Empty)
        ));
        let rotator = rotator(&["a.example", "https://a.example/", "http://a.example:8080"]);
        assert_eq!(rotator.len(), 2);
    }

    #[test]
    fn classifies_outcomes_from_status() {
        assert_eq!(RequestOutcome::classify(false, Some(429)), RequestOutcome::RateLimited);
        assert_eq!(RequestOutcome::classify(false, None), RequestOutcome::Timeout);
        assert_eq!(RequestOutcome::classify(false, Some(502)), RequestOutcome::Timeout);
        assert_eq!(RequestOutcome::classify(true, Some(200)), RequestOutcome::Success);
        assert_eq!(RequestOutcome::classify(false, Some(404)), RequestOutcome::OtherError);
    }
}
