//! Post-scan enrichment of committed entries.
//!
//! The scan loop dispatches each new identifier to `EnrichmentPool`; workers
//! verify it through the rate-limited `IdentityLookup` and persist it through
//! `EntityStore`. `recovery` replays the same step for a finished session.

pub mod lookup;
pub mod queue;
pub mod rate_limit;
pub mod recovery;
pub mod store;
pub mod worker;

pub use lookup::{HttpIdentityLookup, IdentityLookup, LookupConfig};
pub use queue::EnrichmentTask;
pub use rate_limit::RateLimiter;
pub use recovery::{retry_failed, RecoveryReport};
pub use worker::{
    CloseMode, EnrichmentConfig, EnrichmentContext, EnrichmentPool, EnrichmentSink,
    EnrichmentSummary,
};
