use async_trait::async_trait;
use marmot_domain::PipelineRun;

/// Fired after every terminal run transition. `marmot-notify` registers one
/// to send a user-facing completion notification when the run was manually
/// triggered (spec.md 4.H — `created_by ∈ {"scheduler", "system"}` runs are
/// skipped by the caller, not by the observer itself).
#[async_trait]
pub trait RunObserver: Send + Sync + 'static {
    async fn run_completed(&self, run: &PipelineRun);
}
