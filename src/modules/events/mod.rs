//! Event system for the fetch layer.
//!
//! Provides hooks for logging and custom reactions around fetch attempts,
//! challenge solves and credential refreshes.

use chrono::{DateTime, Utc};
use http::Method;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::endpoints::RequestOutcome;
use super::proxy::EgressPath;

/// A request is about to be sent.
#[derive(Debug, Clone)]
pub struct AttemptEvent {
    pub method: Method,
    pub url: Url,
    pub egress: EgressPath,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

/// A response (or transport failure) came back.
#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub url: Url,
    pub egress: EgressPath,
    pub status: Option<u16>,
    pub outcome: RequestOutcome,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChallengeEvent {
    pub url: Url,
    pub egress: EgressPath,
    pub success: bool,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub url: Url,
    pub attempt: u32,
    pub reason: String,
    pub next_endpoint: Option<Url>,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialAction {
    Refreshed,
    Invalidated,
    Failed,
}

#[derive(Debug, Clone)]
pub struct CredentialEvent {
    pub egress: EgressPath,
    pub action: CredentialAction,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub url: Url,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum FetchEvent {
    Attempt(AttemptEvent),
    Response(ResponseEvent),
    Challenge(ChallengeEvent),
    Retry(RetryEvent),
    Credential(CredentialEvent),
    Error(ErrorEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &FetchEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Dispatcher with a [`LoggingHandler`] already registered.
    pub fn with_logging() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: FetchEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &FetchEvent) {
        match event {
            FetchEvent::Attempt(attempt) => {
                log::debug!(
                    "-> {} {} via {} (attempt {})",
                    attempt.method,
                    attempt.url,
                    attempt.egress,
                    attempt.attempt + 1
                );
            }
            FetchEvent::Response(response) => {
                let status = response
                    .status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".into());
                log::debug!(
                    "<- {} {} {:?} ({:.2}s)",
                    response.url,
                    status,
                    response.outcome,
                    response.latency.as_secs_f64()
                );
            }
            FetchEvent::Challenge(challenge) => {
                log::info!(
                    "challenge {} via {} success={} {}",
                    challenge.url,
                    challenge.egress,
                    challenge.success,
                    challenge.detail
                );
            }
            FetchEvent::Retry(retry) => {
                log::info!(
                    "retry {} attempt {} after {:.2}s: {}",
                    retry.url,
                    retry.attempt + 1,
                    retry.scheduled_after.as_secs_f64(),
                    retry.reason
                );
            }
            FetchEvent::Credential(credential) => {
                log::info!("credential {:?} for {}", credential.action, credential.egress);
            }
            FetchEvent::Error(error) => {
                log::warn!("fetch {} failed: {}", error.url, error.error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler(std::sync::Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &FetchEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::with_logging();
        let counter = Arc::new(CountingHandler(std::sync::Mutex::new(0)));
        dispatcher.register_handler(counter.clone());
        dispatcher.dispatch(FetchEvent::Error(ErrorEvent {
            url: Url::parse("https://mirror.example/").unwrap(),
            error: "timeout".into(),
            timestamp: Utc::now(),
        }));
        dispatcher.dispatch(FetchEvent::Credential(CredentialEvent {
            egress: EgressPath::Direct,
            action: CredentialAction::Invalidated,
            timestamp: Utc::now(),
        }));
        assert_eq!(*counter.0.lock().unwrap(), 2);
    }
}
