//! Hook registry: the admission pipeline decisions pass through
//!
//! Hooks are registered per lifecycle event with a priority; the registry
//! runs them in order, threads modifications through the chain and fails
//! closed when a hook errors or panics.

pub mod builtin;
pub mod registry;
pub mod types;

pub use builtin::{
    register_policy_hooks, AmountCeilingHook, ApprovalThresholdHook, AuditLogHook,
    BalanceFractionHook, DrawdownHook, MaxPositionsHook,
};
pub use registry::{HookExecution, HookRegistry, HookStats};
pub use types::{FnHook, Hook, HookContext, HookEntry, HookEvent, HookPayload, HookResult};
