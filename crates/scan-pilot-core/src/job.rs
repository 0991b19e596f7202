//! Classification of plugin Jobs

use crate::status::ScanStatus;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;

/// What a Job says about its plugin run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobOutcome {
    /// A terminal condition is true
    pub finished: bool,
    /// `Complete`/`Failed` when finished, `Active` while running, unset when
    /// freshly scheduled
    pub status: Option<ScanStatus>,
    /// Transition time of the terminal condition
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobOutcome {
    pub fn is_active(&self) -> bool {
        self.status == Some(ScanStatus::Active)
    }
}

/// Start time of a Job, if it started
pub fn start_time(job: &Job) -> Option<DateTime<Utc>> {
    job.status
        .as_ref()
        .and_then(|s| s.start_time.as_ref())
        .map(|t| t.0)
}

/// Most recently started Job; Jobs that never started sort last
pub fn latest_job(jobs: &[Job]) -> Option<&Job> {
    jobs.iter().max_by_key(|job| start_time(job))
}

/// Classify a Job.
///
/// `cronjob_active` is whether the owning CronJob currently lists running Jobs.
pub fn classify(job: &Job, cronjob_active: bool) -> JobOutcome {
    let status = job.status.as_ref();

    let terminal = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| {
            conditions.iter().find_map(|c| {
                if c.status != "True" {
                    return None;
                }
                let outcome = match c.type_.as_str() {
                    "Complete" => ScanStatus::Complete,
                    "Failed" => ScanStatus::Failed,
                    _ => return None,
                };
                Some((outcome, c.last_transition_time.as_ref().map(|t| t.0)))
            })
        });

    if let Some((outcome, finished_at)) = terminal {
        return JobOutcome {
            finished: true,
            status: Some(outcome),
            finished_at,
        };
    }

    let running_pods = status.and_then(|s| s.active).unwrap_or(0) > 0;
    if cronjob_active || running_pods {
        return JobOutcome {
            finished: false,
            status: Some(ScanStatus::Active),
            finished_at: None,
        };
    }

    JobOutcome::default()
}
