//! Shared building blocks: errors, data model, collaborator traits, clock
//! and shutdown signalling

pub mod clock;
pub mod errors;
pub mod shutdown;
pub mod traits;
pub mod types;
