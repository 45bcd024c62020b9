//! Idempotency guard
//!
//! Fingerprints each logical action and reserves it before execution so a
//! duplicate worker output, a retried cycle or a race between domains
//! cannot execute it twice.

pub mod fingerprint;
pub mod guard;
pub mod store;

pub use fingerprint::{fingerprint, Fingerprinter};
pub use guard::{IdempotencyGuard, ReservationOutcome};
pub use store::{IdempotencyRecord, IdempotencyStore, InMemoryStore, JsonFileStore, ReservationState};
