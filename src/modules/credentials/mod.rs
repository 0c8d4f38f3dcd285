//! Per-egress session credential cache.
//!
//! Each egress path gets its own cookie string, obtained by probing a page
//! that triggers the challenge. Entries expire by how they were obtained,
//! refreshes are serialized per egress key, and repeated failed refreshes are
//! throttled to a minimum interval.

pub mod store;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::challenges::core::{CookieJar, format_cookie_string};
use crate::modules::clock::{Clock, SystemClock, chrono_duration};
use crate::modules::proxy::EgressPath;

pub use store::{CredentialStore, MemoryCredentialStore, RedbCredentialStore, StoreError};

/// How a credential was obtained; decides its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CredentialSource {
    /// A full challenge was solved.
    Solved,
    /// Anti-bot cookies were set without a challenge.
    Captured,
    /// The probe showed no challenge; the cookie string is empty.
    NoChallenge,
}

/// Cached credential for one egress path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressCredential {
    pub egress_key: String,
    pub egress: EgressPath,
    pub cookies: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub valid: bool,
    pub source: CredentialSource,
}

impl EgressCredential {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.valid && now < self.expires_at
    }
}

/// Lifetimes and throttling.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialPolicy {
    pub solved_ttl: Duration,
    pub captured_ttl: Duration,
    pub no_challenge_ttl: Duration,
    pub min_refresh_interval: Duration,
}

impl CredentialPolicy {
    pub fn ttl_for(&self, source: CredentialSource) -> Duration {
        match source {
            CredentialSource::Solved => self.solved_ttl,
            CredentialSource::Captured => self.captured_ttl,
            CredentialSource::NoChallenge => self.no_challenge_ttl,
        }
    }
}

impl Default for CredentialPolicy {
    fn default() -> Self {
        Self {
            solved_ttl: Duration::from_secs(12 * 3600),
            captured_ttl: Duration::from_secs(6 * 3600),
            no_challenge_ttl: Duration::from_secs(3600),
            min_refresh_interval: Duration::from_secs(300),
        }
    }
}

/// What a probe of an egress path observed.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Solved(CookieJar),
    Captured(CookieJar),
    NoChallenge,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("challenge submission rejected with status {0}")]
    Rejected(u16),
    #[error("{0}")]
    Failed(String),
}

/// Network side of a refresh: probe `egress` and report what happened.
#[async_trait]
pub trait CredentialProbe: Send + Sync {
    async fn probe(&self, egress: &EgressPath) -> Result<ProbeOutcome, ProbeError>;
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("refresh for {egress} throttled; retry in {retry_in:?}")]
    Throttled { egress: String, retry_in: Duration },
    #[error("probe for {egress} failed: {source}")]
    Probe {
        egress: String,
        #[source]
        source: ProbeError,
    },
}

#[derive(Debug, Clone, Copy)]
struct RefreshRecord {
    at: DateTime<Utc>,
    succeeded: bool,
    /// This attempt ran inside the previous attempt's interval.
    early: bool,
}

#[derive(Debug, Default)]
struct CacheState {
    credentials: HashMap<String, EgressCredential>,
    refreshes: HashMap<String, RefreshRecord>,
    failed: HashSet<String>,
    cursor: usize,
}

/// Cache health report.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub egress_paths: usize,
    pub cached: usize,
    pub usable: usize,
    pub expired: usize,
    pub invalidated: usize,
    pub failed: Vec<String>,
    /// True when no non-empty cookie string is shared between egress paths.
    pub unique: bool,
    pub shared_cookies: Vec<Vec<String>>,
}

/// Owns the credential of every egress path.
pub struct CredentialCache {
    egress_paths: Vec<EgressPath>,
    policy: CredentialPolicy,
    clock: Arc<dyn Clock>,
    store: Arc<dyn CredentialStore>,
    state: Mutex<CacheState>,
    refresh_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CredentialCache {
    pub fn new(egress_paths: Vec<EgressPath>) -> Self {
        Self {
            egress_paths,
            policy: CredentialPolicy::default(),
            clock: Arc::new(SystemClock),
            store: Arc::new(MemoryCredentialStore::new()),
            state: Mutex::new(CacheState::default()),
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_policy(mut self, policy: CredentialPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use `store` for persistence and load whatever it already holds.
    pub fn with_store(mut self, store: Arc<dyn CredentialStore>) -> Result<Self, StoreError> {
        let loaded = store.load_all()?;
        let now = self.clock.now();
        {
            let mut state = self.state();
            for credential in loaded {
                if credential.is_usable(now) {
                    state
                        .credentials
                        .insert(credential.egress_key.clone(), credential);
                }
            }
            log::info!("restored {} credentials from store", state.credentials.len());
        }
        self.store = store;
        Ok(self)
    }

    pub fn policy(&self) -> &CredentialPolicy {
        &self.policy
    }

    pub fn egress_paths(&self) -> &[EgressPath] {
        &self.egress_paths
    }

    /// Cookie string for `egress`, probing when nothing usable is cached.
    pub async fn get_or_refresh(
        &self,
        egress: &EgressPath,
        probe: &dyn CredentialProbe,
    ) -> Result<String, CredentialError> {
        let key = egress.key().to_string();
        if let Some(cookies) = self.cached(&key) {
            return Ok(cookies);
        }

        let lock = self.refresh_lock(&key);
        let _flight = lock.lock().await;

        // Another task may have refreshed while we waited.
        if let Some(cookies) = self.cached(&key) {
            return Ok(cookies);
        }

        let now = self.clock.now();
        let early = {
            let state = self.state();
            match state.refreshes.get(&key) {
                Some(record) => {
                    let since = (now - record.at).to_std().unwrap_or_default();
                    if since >= self.policy.min_refresh_interval {
                        false
                    } else if record.succeeded && !record.early {
                        true
                    } else {
                        let retry_in = self.policy.min_refresh_interval - since;
                        log::warn!("credential refresh for {egress} throttled for {retry_in:?}");
                        return Err(CredentialError::Throttled {
                            egress: egress.redacted(),
                            retry_in,
                        });
                    }
                }
                None => false,
            }
        };

        log::debug!("probing credentials for {egress}");
        let result = probe.probe(egress).await;
        let finished = self.clock.now();

        match result {
            Ok(outcome) => {
                let (source, jar) = match outcome {
                    ProbeOutcome::Solved(jar) => (CredentialSource::Solved, jar),
                    ProbeOutcome::Captured(jar) => (CredentialSource::Captured, jar),
                    ProbeOutcome::NoChallenge => (CredentialSource::NoChallenge, CookieJar::new()),
                };
                self.state().refreshes.insert(
                    key.clone(),
                    RefreshRecord {
                        at: now,
                        succeeded: true,
                        early,
                    },
                );
                Ok(self.put(egress, source, &jar, finished).cookies)
            }
            Err(err) => {
                self.state().refreshes.insert(
                    key,
                    RefreshRecord {
                        at: now,
                        succeeded: false,
                        early,
                    },
                );
                log::warn!("credential probe for {egress} failed: {err}");
                self.mark_failed(egress);
                Err(CredentialError::Probe {
                    egress: egress.redacted(),
                    source: err,
                })
            }
        }
    }

    /// Store cookies obtained outside a probe (e.g. a challenge solved mid-fetch).
    pub fn store(
        &self,
        egress: &EgressPath,
        source: CredentialSource,
        cookies: &CookieJar,
    ) -> EgressCredential {
        let now = self.clock.now();
        self.put(egress, source, cookies, now)
    }

    fn put(
        &self,
        egress: &EgressPath,
        source: CredentialSource,
        cookies: &CookieJar,
        now: DateTime<Utc>,
    ) -> EgressCredential {
        let ttl = self.policy.ttl_for(source);
        let credential = EgressCredential {
            egress_key: egress.key().to_string(),
            egress: egress.clone(),
            cookies: format_cookie_string(cookies),
            created_at: now,
            expires_at: now + chrono_duration(ttl),
            valid: true,
            source,
        };

        {
            let mut state = self.state();
            state
                .credentials
                .insert(credential.egress_key.clone(), credential.clone());
            state.failed.remove(&credential.egress_key);
        }
        // The in-memory entry stays authoritative when persistence fails.
        if let Err(err) = self.store.save(&credential) {
            log::warn!("failed to persist credential for {egress}: {err}");
        }

        log::info!(
            "cached {:?} credential for {egress} ({} cookies, ttl {:?})",
            source,
            cookies.len(),
            ttl
        );
        credential
    }

    /// Current credential, usable or not.
    pub fn get(&self, egress: &EgressPath) -> Option<EgressCredential> {
        self.state().credentials.get(egress.key()).cloned()
    }

    /// Drop validity after a rate limit tied to `egress`.
    pub fn invalidate(&self, egress: &EgressPath) {
        let updated = {
            let mut state = self.state();
            state.credentials.get_mut(egress.key()).map(|credential| {
                credential.valid = false;
                credential.clone()
            })
        };
        if let Some(credential) = updated {
            log::info!("invalidated credential for {egress}");
            if let Err(err) = self.store.save(&credential) {
                log::warn!("failed to persist invalidation for {egress}: {err}");
            }
        }
    }

    /// Set `egress` aside from rotation. Clears the set once every path is in it.
    pub fn mark_failed(&self, egress: &EgressPath) {
        let mut state = self.state();
        state.failed.insert(egress.key().to_string());
        log::warn!("egress {egress} marked failed ({} failed)", state.failed.len());

        let all_failed = !self.egress_paths.is_empty()
            && self
                .egress_paths
                .iter()
                .all(|path| state.failed.contains(path.key()));
        if all_failed {
            log::warn!("all egress paths failed; clearing failed set");
            state.failed.clear();
        }
    }

    pub fn is_failed(&self, egress: &EgressPath) -> bool {
        self.state().failed.contains(egress.key())
    }

    pub fn reset_failed(&self) {
        self.state().failed.clear();
    }

    /// Round-robin over configured egress paths, skipping failed ones.
    pub fn next_egress(&self) -> EgressPath {
        if self.egress_paths.is_empty() {
            return EgressPath::Direct;
        }

        let mut state = self.state();
        let n = self.egress_paths.len();
        for _ in 0..n {
            let path = &self.egress_paths[state.cursor % n];
            state.cursor = state.cursor.wrapping_add(1);
            if !state.failed.contains(path.key()) {
                return path.clone();
            }
        }

        // Every path failed; start over with all of them.
        state.failed.clear();
        let path = self.egress_paths[state.cursor % n].clone();
        state.cursor = state.cursor.wrapping_add(1);
        path
    }

    /// Remove expired and invalidated entries. Returns how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let removed: Vec<String> = {
            let mut state = self.state();
            let stale: Vec<String> = state
                .credentials
                .iter()
                .filter(|(_, credential)| !credential.is_usable(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &stale {
                state.credentials.remove(key);
            }
            stale
        };

        for key in &removed {
            if let Err(err) = self.store.remove(key) {
                log::warn!("failed to remove stale credential from store: {err}");
            }
        }
        if !removed.is_empty() {
            log::debug!("removed {} stale credentials", removed.len());
        }
        removed.len()
    }

    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let state = self.state();

        let mut by_cookie: HashMap<&str, Vec<String>> = HashMap::new();
        let mut usable = 0;
        let mut expired = 0;
        let mut invalidated = 0;
        for credential in state.credentials.values() {
            if !credential.valid {
                invalidated += 1;
            } else if now >= credential.expires_at {
                expired += 1;
            } else {
                usable += 1;
            }
            if !credential.cookies.is_empty() {
                by_cookie
                    .entry(credential.cookies.as_str())
                    .or_default()
                    .push(credential.egress.redacted());
            }
        }

        let mut shared_cookies: Vec<Vec<String>> = by_cookie
            .into_values()
            .filter(|paths| paths.len() > 1)
            .map(|mut paths| {
                paths.sort();
                paths
            })
            .collect();
        shared_cookies.sort();

        let mut failed: Vec<String> = state.failed.iter().cloned().collect();
        failed.sort();

        CacheStats {
            egress_paths: self.egress_paths.len(),
            cached: state.credentials.len(),
            usable,
            expired,
            invalidated,
            failed,
            unique: shared_cookies.is_empty(),
            shared_cookies,
        }
    }

    fn cached(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        self.state()
            .credentials
            .get(key)
            .filter(|credential| credential.is_usable(now))
            .map(|credential| credential.cookies.clone())
    }

    fn refresh_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.refresh_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
