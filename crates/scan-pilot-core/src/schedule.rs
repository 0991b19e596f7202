//! Next-run computation for CronJob schedules
//!
//! CronJobs take classic five-field expressions; the `cron` crate wants a
//! leading seconds field, so one is prepended. Day-of-week follows the `cron`
//! crate numbering (1-7 from Sunday) or names (MON-SUN).

use crate::error::ScheduleError;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

/// Expression as understood by the `cron` crate
fn normalize(expr: &str) -> String {
    let expr = expr.trim();
    if expr.starts_with('@') || expr.split_whitespace().count() != 5 {
        expr.to_string()
    } else {
        format!("0 {}", expr)
    }
}

/// First run of `expr` strictly after `after`
pub fn next_run(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    let schedule = Schedule::from_str(&normalize(expr)).map_err(|source| ScheduleError::Parse {
        expr: expr.to_string(),
        source,
    })?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| ScheduleError::Exhausted(expr.to_string()))
}
