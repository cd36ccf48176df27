//! Asynchronous units of work with an observable lifecycle.
//!
//! A [Job] starts out pending, fires `running` once started, may fire any
//! number of heartbeats, and then makes exactly one terminal transition:
//! ended with a result, failed with a failure payload, or canceled. After
//! that it never changes again.

use std::{fmt, sync::Arc, time::Instant};

use parse_display::Display;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};

/// Events buffered per subscriber before a slow one starts missing them.
const EVENT_CAPACITY: usize = 64;

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
#[display(style = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created, not yet started.
    Pending,
    /// Started and not yet concluded.
    Running,
    /// Concluded; see [Conclusion].
    Stopped,
}

/// How a job concluded.
#[derive(Debug, Clone, PartialEq)]
pub enum Conclusion {
    /// Finished successfully with this result.
    Ended(Value),
    /// Finished unsuccessfully with this failure detail.
    Failed(Value),
    /// Canceled before it could end or fail.
    Canceled,
}

impl Conclusion {
    /// Lowercase name of the conclusion.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ended(_) => "ended",
            Self::Failed(_) => "failed",
            Self::Canceled => "canceled",
        }
    }
}

/// Lifecycle events, in the order they fire.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// The job was started.
    Running,
    /// Progress report from a running job.
    Heartbeat(Value),
    /// The job is being canceled; always followed by `Stopped(Canceled)`.
    Cancel,
    /// The job concluded.
    Stopped(Conclusion),
}

/// Point-in-time view of a job.
#[derive(Debug, Clone)]
pub struct JobStatus {
    /// Lifecycle state.
    pub state: JobState,
    /// Set exactly when `state` is [JobState::Stopped].
    pub conclusion: Option<Conclusion>,
    /// Payload of the most recent heartbeat.
    pub progress: Option<Value>,
    /// Number of heartbeats seen.
    pub heartbeats: u64,
    /// When the job was started. Stays unset for a job concluded while pending.
    pub started_at: Option<Instant>,
    /// When the job last started, heartbeated or concluded.
    pub last_activity: Instant,
}

/// Serializable summary of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobInfo {
    /// Job id.
    pub id: u64,
    /// Job name.
    pub name: String,
    /// Lifecycle state.
    pub state: JobState,
    /// `ended`, `failed` or `canceled` once stopped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conclusion: Option<String>,
    /// Result, if the job ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure detail, if the job failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Value>,
    /// Most recent heartbeat payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Value>,
}

struct Inner {
    id: u64,
    name: String,
    status: watch::Sender<JobStatus>,
    events: broadcast::Sender<JobEvent>,
}

/// Shared handle to one asynchronous operation. Clones refer to the same job.
#[derive(Clone)]
pub struct Job(Arc<Inner>);

impl Job {
    /// Create a pending job.
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        let (status, _) = watch::channel(JobStatus {
            state: JobState::Pending,
            conclusion: None,
            progress: None,
            heartbeats: 0,
            started_at: None,
            last_activity: Instant::now(),
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self(Arc::new(Inner {
            id,
            name: name.into(),
            status,
            events,
        }))
    }

    /// Job id.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Job name.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> JobState {
        self.0.status.borrow().state
    }

    /// Conclusion, once stopped.
    pub fn conclusion(&self) -> Option<Conclusion> {
        self.0.status.borrow().conclusion.clone()
    }

    /// True once the job has concluded.
    pub fn is_stopped(&self) -> bool {
        self.state() == JobState::Stopped
    }

    /// Snapshot of the full status.
    pub fn status(&self) -> JobStatus {
        self.0.status.borrow().clone()
    }

    /// Serializable summary.
    pub fn info(&self) -> JobInfo {
        let status = self.status();
        let (result, failure) = match &status.conclusion {
            Some(Conclusion::Ended(result)) => (Some(result.clone()), None),
            Some(Conclusion::Failed(failure)) => (None, Some(failure.clone())),
            _ => (None, None),
        };
        JobInfo {
            id: self.id(),
            name: self.name().to_owned(),
            state: status.state,
            conclusion: status.conclusion.as_ref().map(|c| c.name().to_owned()),
            result,
            failure,
            progress: status.progress,
        }
    }

    /// Every event fired from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.0.events.subscribe()
    }

    /// Receiver that observes every status change.
    pub fn watch(&self) -> watch::Receiver<JobStatus> {
        self.0.status.subscribe()
    }

    /// Start the job, firing `running`. Returns false if it was not pending.
    pub fn start(&self) -> bool {
        let started = self.0.status.send_if_modified(|status| {
            if status.state != JobState::Pending {
                return false;
            }
            let now = Instant::now();
            status.state = JobState::Running;
            status.started_at = Some(now);
            status.last_activity = now;
            true
        });
        if started {
            tracing::debug!(job = self.id(), name = self.name(), "job started");
            self.emit(JobEvent::Running);
        }
        started
    }

    /// Report progress without concluding. Only a running job heartbeats.
    pub fn heartbeat(&self, progress: Value) -> bool {
        let event = JobEvent::Heartbeat(progress.clone());
        let beat = self.0.status.send_if_modified(|status| {
            if status.state != JobState::Running {
                return false;
            }
            status.progress = Some(progress);
            status.heartbeats += 1;
            status.last_activity = Instant::now();
            true
        });
        if beat {
            tracing::trace!(job = self.id(), "job heartbeat");
            self.emit(event);
        }
        beat
    }

    /// Conclude successfully. No-op once stopped.
    pub fn end(&self, result: Value) -> bool {
        self.conclude(Conclusion::Ended(result))
    }

    /// Conclude with a failure. No-op once stopped.
    pub fn fail(&self, failure: Value) -> bool {
        self.conclude(Conclusion::Failed(failure))
    }

    /// Cancel, firing `cancel` then `stopped`. No-op once stopped.
    pub fn cancel(&self) -> bool {
        self.conclude(Conclusion::Canceled)
    }

    fn conclude(&self, conclusion: Conclusion) -> bool {
        let event = conclusion.clone();
        let concluded = self.0.status.send_if_modified(|status| {
            if status.state == JobState::Stopped {
                return false;
            }
            status.state = JobState::Stopped;
            status.conclusion = Some(conclusion);
            status.last_activity = Instant::now();
            true
        });
        if !concluded {
            return false;
        }

        tracing::debug!(
            job = self.id(),
            name = self.name(),
            conclusion = event.name(),
            "job stopped"
        );
        if event == Conclusion::Canceled {
            self.emit(JobEvent::Cancel);
        }
        self.emit(JobEvent::Stopped(event));
        true
    }

    fn emit(&self, event: JobEvent) {
        // Nobody listening is fine.
        let _ = self.0.events.send(event);
    }

    /// Wait until the job leaves the pending state. True if it was started,
    /// even if it has concluded since; false if it was concluded without
    /// ever being started.
    pub async fn started(&self) -> bool {
        let mut status = self.watch();
        let result = status.wait_for(|status| status.state != JobState::Pending).await;
        result.is_ok_and(|status| status.started_at.is_some())
    }

    /// Wait for the conclusion.
    pub async fn stopped(&self) -> Conclusion {
        let mut status = self.watch();
        let conclusion = match status.wait_for(|status| status.conclusion.is_some()).await {
            Ok(status) => status.conclusion.clone(),
            Err(_) => None,
        };
        conclusion.unwrap_or(Conclusion::Canceled)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}
