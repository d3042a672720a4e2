//! Client-observable state of the server-side packaging job.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::app::{ProgressEvent, ProgressSink};
use crate::dataset::Dataset;
use crate::domain::DatasetId;
use crate::error::PortalError;

/// Raw job flags as the portal reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetStatus {
    #[serde(default)]
    pub is_processing: bool,
    #[serde(default)]
    pub is_succeeded: bool,
    #[serde(default)]
    pub is_failed: bool,
    #[serde(default)]
    pub is_terminated: bool,
    #[serde(default)]
    pub is_expired: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub is_unprocessed: bool,
    pub is_processing: bool,
    pub is_failed: bool,
    pub is_terminated: bool,
    pub is_ready: bool,
    pub is_expired: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Unprocessed,
    Processing,
    Ready,
    Expired,
    Failed,
    Terminated,
}

impl Classification {
    pub fn state(&self) -> LifecycleState {
        if self.is_failed {
            LifecycleState::Failed
        } else if self.is_terminated {
            LifecycleState::Terminated
        } else if self.is_processing {
            LifecycleState::Processing
        } else if self.is_expired {
            LifecycleState::Expired
        } else if self.is_ready {
            LifecycleState::Ready
        } else {
            LifecycleState::Unprocessed
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(
            self.state(),
            LifecycleState::Processing | LifecycleState::Unprocessed
        )
    }
}

pub fn classify(status: &DatasetStatus) -> Classification {
    let is_succeeded = status.is_succeeded && !status.is_failed;
    let is_expired = is_succeeded && status.is_expired;
    Classification {
        is_unprocessed: !status.is_processing
            && !status.is_succeeded
            && !status.is_failed
            && !status.is_terminated,
        is_processing: status.is_processing && !status.is_failed && !status.is_terminated,
        is_failed: status.is_failed,
        is_terminated: status.is_terminated && !status.is_failed,
        is_ready: is_succeeded && !is_expired,
        is_expired,
    }
}

/// Classifies `dataset` with expiry computed against `now`, so a ready
/// dataset turns expired without the server telling us.
pub fn classify_at(dataset: &Dataset, now: DateTime<Utc>, retention: chrono::Duration) -> Classification {
    let mut status = dataset.status;
    if status.is_succeeded && !status.is_expired {
        if let Some(expires_at) = expiry_of(dataset, retention) {
            status.is_expired = now >= expires_at;
        }
    }
    classify(&status)
}

pub fn expiry_of(dataset: &Dataset, retention: chrono::Duration) -> Option<DateTime<Utc>> {
    dataset
        .expires_at
        .or_else(|| dataset.succeeded_at.map(|at| at + retention))
}

/// Shared flag flipped when the owner of a poll goes away.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: usize,
    pub retention: chrono::Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_attempts: 360,
            retention: chrono::Duration::days(7),
        }
    }
}

pub struct Poller {
    policy: PollPolicy,
    cancel: CancelToken,
}

impl Poller {
    pub fn new(policy: PollPolicy, cancel: CancelToken) -> Self {
        Self { policy, cancel }
    }

    /// Re-fetches the dataset until its classification is terminal.
    pub fn poll<F>(
        &self,
        id: &DatasetId,
        mut fetch: F,
        sink: &dyn ProgressSink,
    ) -> Result<Dataset, PortalError>
    where
        F: FnMut() -> Result<Dataset, PortalError>,
    {
        let start = Instant::now();
        for attempt in 1..=self.policy.max_attempts {
            if self.cancel.is_cancelled() {
                return Err(PortalError::PollingCancelled(id.to_string()));
            }
            let dataset = fetch()?;
            if self.cancel.is_cancelled() {
                return Err(PortalError::PollingCancelled(id.to_string()));
            }
            let classification = classify_at(&dataset, Utc::now(), self.policy.retention);
            debug!(dataset = %id, attempt, state = ?classification.state(), "polled dataset");
            sink.event(ProgressEvent {
                message: format!("phase=Poll; dataset {id} is {:?}", classification.state()),
                elapsed: Some(start.elapsed()),
            });
            if classification.is_terminal() {
                return Ok(dataset);
            }
            if attempt < self.policy.max_attempts {
                self.wait()?;
            }
        }
        Err(PortalError::PollingExhausted(id.to_string()))
    }

    fn wait(&self) -> Result<(), PortalError> {
        const SLICE: Duration = Duration::from_millis(50);
        let deadline = Instant::now() + self.policy.interval;
        while Instant::now() < deadline {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            thread::sleep(SLICE.min(deadline.saturating_duration_since(Instant::now())));
        }
        Ok(())
    }
}
