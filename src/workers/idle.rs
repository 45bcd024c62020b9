use async_trait::async_trait;

use crate::common::errors::Result;
use crate::common::traits::DecisionWorker;
use crate::common::types::{Decision, DomainContext};

/// Worker that always proposes a no-op
///
/// Used for domains without a configured backend, so the scheduler still
/// builds context and tracks no-op streaks for them.
#[derive(Debug, Clone, Default)]
pub struct IdleWorker;

#[async_trait]
impl DecisionWorker for IdleWorker {
    fn name(&self) -> &str {
        "idle"
    }

    async fn produce_decision(&self, context: &DomainContext) -> Result<Option<Decision>> {
        Ok(Some(Decision::no_op(
            &context.domain,
            "no decision backend configured",
        )))
    }
}
