//! # archon-sync
//!
//! Coalescing request queue and the request emitters.
//!
//! Emitters ([`Emitter`]) turn local feature artifacts into one pending
//! [`RequestRecord`] per `(feature, concern)`. The daemon drains the same
//! [`RequestQueue`], with in-flight, retry and dead-letter bookkeeping.

pub mod documents;
pub mod emit;
pub mod error;
pub mod queue;

pub use emit::{EmitError, EmitOutcome, Emitter, SkipReason};
pub use error::SyncError;
pub use queue::{
    Claim, DocumentRef, FailOutcome, Payload, RequestQueue, RequestRecord, RetryPolicy,
    RetryState, WriteOutcome,
};
