//! Blocking-style waits on a [Job] with deadlines.

use std::time::{Duration, Instant};

use serde_json::Value;

use crate::job::{Conclusion, Job};

/// How often a running job is re-checked between deadlines.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The deadline a job missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Total time since the job was started.
    Overall(Duration),
    /// Time since the last heartbeat, or since the start when none arrived.
    Heartbeat(Duration),
}

/// Errors from [run_job] and [execute_job].
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The peer stopped answering; nothing is known about the outcome.
    #[error("job {name} is not responsive after {elapsed:?} ({deadline:?} exceeded)")]
    NotResponsive {
        /// Job name.
        name: String,
        /// Time since the job was started.
        elapsed: Duration,
        /// Which deadline was missed.
        deadline: Deadline,
    },

    /// The peer answered with a failure.
    #[error("job {name} failed: {failure}")]
    Failed {
        /// Job name.
        name: String,
        /// Failure detail from the peer.
        failure: Value,
    },

    /// The job was canceled.
    #[error("job {name} was canceled")]
    Canceled {
        /// Job name.
        name: String,
    },
}

impl JobError {
    /// True when the peer went quiet, as opposed to reporting a failure.
    pub fn is_not_responsive(&self) -> bool {
        matches!(self, Self::NotResponsive { .. })
    }
}

/// Start `job` and wait for its conclusion.
///
/// Fails with [JobError::NotResponsive] once `timeout` has passed since the
/// start, or once `heartbeat_timeout` has passed since the last heartbeat
/// (or the start, before the first one). An abandoned job is canceled.
pub async fn run_job(
    job: &Job,
    timeout: Option<Duration>,
    heartbeat_timeout: Option<Duration>,
) -> Result<Conclusion, JobError> {
    job.start();
    let started = Instant::now();
    let mut status = job.watch();

    loop {
        let (conclusion, last_activity) = {
            let status = status.borrow_and_update();
            (status.conclusion.clone(), status.last_activity)
        };
        if let Some(conclusion) = conclusion {
            return Ok(conclusion);
        }

        let now = Instant::now();
        let overall = timeout.map(|timeout| (started + timeout, Deadline::Overall(timeout)));
        let heartbeat = heartbeat_timeout.map(|timeout| (last_activity + timeout, Deadline::Heartbeat(timeout)));
        let nearest = [overall, heartbeat].into_iter().flatten().min_by_key(|(at, _)| *at);

        if let Some((at, deadline)) = nearest {
            if now >= at {
                let elapsed = started.elapsed();
                tracing::warn!(
                    job = job.id(),
                    name = job.name(),
                    elapsed = format!("{:?}", elapsed),
                    deadline = format!("{:?}", deadline),
                    "job is not responsive; canceling"
                );
                job.cancel();
                return Err(JobError::NotResponsive {
                    name: job.name().to_owned(),
                    elapsed,
                    deadline,
                });
            }
        }

        let wake = match nearest {
            Some((at, _)) => at.min(now + POLL_INTERVAL),
            None => now + POLL_INTERVAL,
        };
        tokio::select! {
            _ = status.changed() => {}
            _ = tokio::time::sleep_until(wake.into()) => {}
        }
    }
}

/// [run_job], returning the result of an ended job and turning a failed or
/// canceled one into an error.
pub async fn execute_job(
    job: &Job,
    timeout: Option<Duration>,
    heartbeat_timeout: Option<Duration>,
) -> Result<Value, JobError> {
    match run_job(job, timeout, heartbeat_timeout).await? {
        Conclusion::Ended(result) => Ok(result),
        Conclusion::Failed(failure) => Err(JobError::Failed {
            name: job.name().to_owned(),
            failure,
        }),
        Conclusion::Canceled => Err(JobError::Canceled {
            name: job.name().to_owned(),
        }),
    }
}
