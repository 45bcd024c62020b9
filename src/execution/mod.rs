//! Reference collaborators: paper execution and process-local persistence

pub mod memory;
pub mod paper;

pub use memory::InMemoryPersistence;
pub use paper::PaperExecutor;
