//! Decision workers shipped with the binary

pub mod http;
pub mod idle;

pub use http::HttpDecisionWorker;
pub use idle::IdleWorker;
