use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::SchedulerError;

/// `next_run_at = cron.next(now)`, per spec.md 4.G, exposed as a free
/// function so both schedule creation and post-run rescheduling share one
/// implementation.
pub fn next_run_at(cron_expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
    let schedule = Schedule::from_str(cron_expr).map_err(|source| SchedulerError::InvalidCron { expr: cron_expr.to_string(), source })?;
    schedule.after(&after).next().ok_or_else(|| SchedulerError::NoUpcomingRun(cron_expr.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn computes_the_next_occurrence_after_the_given_time() {
        let after = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = next_run_at("0 0 * * * *", after).unwrap();
        assert!(next > after);
    }

    #[test]
    fn invalid_expression_is_rejected() {
        assert!(next_run_at("not a cron expression", Utc::now()).is_err());
    }
}
