use chrono::Utc;

use crate::error::InvalidTransitionError;
use crate::types::{PipelineRun, RunStatus, RunSummary};

impl PipelineRun {
    fn require(&self, expected: RunStatus) -> Result<(), InvalidTransitionError> {
        if self.status != expected {
            return Err(InvalidTransitionError {
                kind: "PipelineRun",
                from: self.status.to_string(),
                to: "<transition rejected>".to_string(),
            });
        }
        Ok(())
    }

    /// `pending -> running`. Terminal states are absorbing; any other
    /// starting point fails.
    pub fn start(&mut self) -> Result<(), InvalidTransitionError> {
        self.require(RunStatus::Pending)?;
        self.status = RunStatus::Running;
        Ok(())
    }

    /// `running -> completed`, recording the final summary.
    pub fn complete(&mut self, summary: RunSummary) -> Result<(), InvalidTransitionError> {
        self.require(RunStatus::Running)?;
        self.status = RunStatus::Completed;
        self.summary = summary;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// `running -> failed`, with the error message truncated to a bounded
    /// length before it's persisted to run history.
    pub fn fail(&mut self, error_message: impl Into<String>) -> Result<(), InvalidTransitionError> {
        self.require(RunStatus::Running)?;
        self.status = RunStatus::Failed;
        self.error_message = Some(truncate(&error_message.into(), 4096));
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// `running -> cancelled`, taken when the run's lease was lost. No
    /// partial results are committed by the caller before this is called.
    pub fn cancel(&mut self) -> Result<(), InvalidTransitionError> {
        self.require(RunStatus::Running)?;
        self.status = RunStatus::Cancelled;
        self.ended_at = Some(Utc::now());
        Ok(())
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        out.push_str("...");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_to_running_to_completed() {
        let mut run = PipelineRun::new_pending("p", "system", None);
        run.start().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        run.complete(RunSummary { total_entities: 3, by_type: Default::default() }).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.ended_at.is_some());
    }

    #[test]
    fn terminal_states_are_absorbing() {
        let mut run = PipelineRun::new_pending("p", "system", None);
        run.start().unwrap();
        run.fail("boom").unwrap();
        assert!(run.complete(RunSummary::default()).is_err());
        assert!(run.cancel().is_err());
        assert!(run.start().is_err());
    }

    #[test]
    fn cannot_start_twice() {
        let mut run = PipelineRun::new_pending("p", "system", None);
        run.start().unwrap();
        assert!(run.start().is_err());
    }

    #[test]
    fn error_message_is_truncated() {
        let mut run = PipelineRun::new_pending("p", "system", None);
        run.start().unwrap();
        let long = "x".repeat(5000);
        run.fail(long).unwrap();
        assert!(run.error_message.unwrap().len() <= 4096);
    }
}
