//! In-memory job table for one orchestration call.
//!
//! The registry is the single source of truth for job state: the submitter
//! creates entries, the poller advances them, and the aggregator reads them
//! once nothing is in flight. Entries are never removed.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{AppError, JobError};
use crate::salesforce::transport::{JobKind, RowData};
use crate::salesforce::Record;

// ─────────────────────────────────────────────────────────────────────────────
// JobState Enum
// ─────────────────────────────────────────────────────────────────────────────

/// Local lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Registered, remote job not yet confirmed running.
    Queued,
    /// Query job accepted by Salesforce.
    UploadComplete,
    /// Query job running.
    InProgress,
    /// Finished; row data (if any) is attached.
    Completed,
    /// Load job accepted but not finished; reported as pending.
    RequiresPolling,
    /// Failed at submission, remotely, or while fetching results.
    Failed,
    /// Aborted remotely.
    Aborted,
}

impl JobState {
    /// Returns true if the job cannot transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Aborted
        )
    }

    /// Returns true for states the poller still has to drive.
    pub fn is_pending(&self) -> bool {
        !self.is_terminal()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Job
// ─────────────────────────────────────────────────────────────────────────────

/// One submitted batch or one query execution.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub kind: JobKind,
    /// Position of the batch in the call's input; 0 for queries.
    pub batch_index: usize,
    pub state: JobState,
    /// Rows sent; shared with in-flight tasks, never mutated.
    pub request_data: Arc<Vec<Record>>,
    pub response_data: Option<RowData>,
    /// Cursor of the next result page while paging is in progress.
    pub continuation_token: Option<String>,
    pub error: Option<JobError>,
    /// Set when result retrieval stopped part-way.
    pub results_incomplete: bool,
}

impl Job {
    pub fn new(
        job_id: impl Into<String>,
        kind: JobKind,
        batch_index: usize,
        request_data: Arc<Vec<Record>>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            kind,
            batch_index,
            state: JobState::Queued,
            request_data,
            response_data: None,
            continuation_token: None,
            error: None,
            results_incomplete: false,
        }
    }

    /// Local id for a batch the remote never assigned one to.
    pub fn unsubmitted_id(batch_index: usize) -> String {
        format!("unsubmitted-{}", batch_index)
    }

    pub fn complete(&mut self, rows: RowData) {
        self.state = JobState::Completed;
        self.response_data = Some(rows);
        self.continuation_token = None;
    }

    pub fn fail(&mut self, error: JobError) {
        self.state = JobState::Failed;
        self.error = Some(error);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JobRegistry
// ─────────────────────────────────────────────────────────────────────────────

/// Jobs keyed by id, remembering registration order.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: HashMap<String, Job>,
    order: Vec<String>,
}

/// Registry shared by the tasks of one call. Never lock across a remote call.
pub type SharedRegistry = Arc<Mutex<JobRegistry>>;

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Registers a job.
    ///
    /// # Errors
    ///
    /// `AppError::InvalidState` if the id is already registered.
    pub fn insert(&mut self, job: Job) -> Result<(), AppError> {
        if self.jobs.contains_key(&job.job_id) {
            return Err(AppError::InvalidState(format!(
                "job {} is already registered",
                job.job_id
            )));
        }
        self.order.push(job.job_id.clone());
        self.jobs.insert(job.job_id.clone(), job);
        Ok(())
    }

    pub fn get(&self, job_id: &str) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    /// Applies `f` to a registered job.
    ///
    /// # Errors
    ///
    /// `AppError::InvalidState` if the id is unknown.
    pub fn update<R>(&mut self, job_id: &str, f: impl FnOnce(&mut Job) -> R) -> Result<R, AppError> {
        self.jobs
            .get_mut(job_id)
            .map(f)
            .ok_or_else(|| AppError::InvalidState(format!("job {} is not registered", job_id)))
    }

    /// Jobs in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.order.iter().filter_map(|id| self.jobs.get(id))
    }

    pub fn ids_in_state(&self, state: JobState) -> Vec<String> {
        self.iter()
            .filter(|job| job.state == state)
            .map(|job| job.job_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
