//! # anubis-scraper-rs
//!
//! A resilient fetch layer for mirrors that sit behind the Anubis
//! proof-of-work challenge.
//!
//! ## Features
//!
//! - Anubis challenge detection, solving and submission
//! - Session cookies cached per egress path (direct or proxy) with TTLs,
//!   throttled and single-flight refreshes, optional redb persistence
//! - Round-robin endpoint rotation with health scoring and optional cooldowns
//! - Retry loop with linear backoff that moves requests between mirrors
//!
//! ## Example
//!
//! ```no_run
//! use anubis_scraper_rs::AnubisScraper;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let scraper = AnubisScraper::builder()
//!         .with_endpoints(["nitter.example", "mirror.example"])
//!         .build()?;
//!     let response = scraper.get_path("/jack").await?;
//!     println!("Response: {}", response.text());
//!     Ok(())
//! }
//! ```

mod anubis_scraper;

pub mod challenges;
pub mod config;
pub mod fetcher;
pub mod modules;

pub use crate::anubis_scraper::{
    AnubisScraper,
    AnubisScraperBuilder,
    FetchResponse,
    ScraperError,
    ScraperResult,
};

pub use crate::challenges::core::{
    ChallengeDescriptor,
    ChallengeHttpClient,
    ChallengeHttpResponse,
    CookieJar,
    FailoverBackoff,
    HttpRequest,
    ReqwestChallengeHttpClient,
    Solution,
    SubmissionResult,
    TransportError,
    TransportErrorKind,
};

pub use crate::challenges::detectors::{
    ChallengeDetection,
    ChallengeDetector,
    ChallengeType,
};

pub use crate::challenges::solvers::{
    AnubisSolver,
    ChallengeError,
    ChallengeHasher,
    ChallengeOutcome,
    ProofOfWorkSolver,
    Sha256Hasher,
    SolveError,
    SubmissionVerdict,
};

pub use crate::challenges::user_agents::{
    BrowserProfile,
    UserAgentError,
};

pub use crate::config::{
    ConfigError,
    ScraperConfig,
};

pub use crate::fetcher::{
    FetchError,
    Fetched,
    ResilientFetcher,
};

pub use crate::modules::{
    CacheStats,
    Clock,
    CredentialCache,
    CredentialError,
    CredentialPolicy,
    CredentialProbe,
    CredentialSource,
    CredentialStore,
    EgressCredential,
    EgressPath,
    EndpointRotator,
    EndpointSnapshot,
    EndpointStats,
    EventDispatcher,
    EventHandler,
    FetchEvent,
    LoggingHandler,
    ManualClock,
    MemoryCredentialStore,
    RedbCredentialStore,
    RequestOutcome,
    RotationPolicy,
    SystemClock,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
