//! Leaf units of work.

use anyhow::Result;
use async_trait::async_trait;

/// A named, idempotent operation against the target system.
///
/// Flows re-run from the start after a failure, so `run` must be safe to call
/// again (create-or-update semantics).
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<()>;
}

#[cfg(test)]
pub use fn_task::FnTask;
