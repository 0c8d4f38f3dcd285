//! Cross-cutting services module
//!
//! Egress identities, per-egress credentials, endpoint rotation, events and
//! the clock they all share.

pub mod clock;
pub mod credentials;
pub mod endpoints;
pub mod events;
pub mod proxy;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use credentials::{
    CacheStats, CredentialCache, CredentialError, CredentialPolicy, CredentialProbe,
    CredentialSource, CredentialStore, EgressCredential, MemoryCredentialStore, ProbeError,
    ProbeOutcome, RedbCredentialStore, StoreError,
};
pub use endpoints::{
    EndpointError, EndpointRotator, EndpointSnapshot, EndpointStats, RequestOutcome,
    RotationPolicy,
};
pub use events::{
    AttemptEvent, ChallengeEvent, CredentialAction, CredentialEvent, ErrorEvent, EventDispatcher,
    EventHandler, FetchEvent, LoggingHandler, ResponseEvent, RetryEvent,
};
pub use proxy::{DIRECT_EGRESS_KEY, EgressPath, parse_egress_list};
