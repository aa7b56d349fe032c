//! Sends batches to the bulk API and records the result in the registry.
//!
//! Every batch gets exactly one registry entry, whatever happens to it: a
//! rejected submission is recorded as a failed job so its siblings and the
//! report are unaffected.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::{AppError, ErrorKind, JobError};
use crate::salesforce::auth::Session;
use crate::salesforce::transport::{BulkTransport, JobKind, LoadRequest, RowData, SubmitOutcome};
use crate::salesforce::{redact_id, Record};
use crate::sync::limiter::SubmissionLimiter;
use crate::sync::registry::{Job, JobState, SharedRegistry};

pub struct JobSubmitter<T: BulkTransport> {
    transport: Arc<T>,
    registry: SharedRegistry,
    limiter: SubmissionLimiter,
}

impl<T: BulkTransport> Clone for JobSubmitter<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            limiter: self.limiter.clone(),
        }
    }
}

impl<T: BulkTransport + 'static> JobSubmitter<T> {
    pub fn new(transport: Arc<T>, registry: SharedRegistry, limiter: SubmissionLimiter) -> Self {
        Self {
            transport,
            registry,
            limiter,
        }
    }

    /// Submits one batch and registers the resulting job.
    ///
    /// Returns the registered job id. Submission problems never surface
    /// here; they are recorded on the job.
    pub async fn submit_load(
        &self,
        session: &Session,
        batch_index: usize,
        batch: Arc<Vec<Record>>,
        request: &LoadRequest,
    ) -> Result<String, AppError> {
        let result = {
            let _permit = self.limiter.acquire().await?;
            self.transport.submit_batch(session, request, &batch).await
        };

        let mut job = match result {
            Ok(SubmitOutcome::Completed { job_id, outcomes }) => {
                let mut job = Job::new(job_id, JobKind::Load, batch_index, batch.clone());
                if outcomes.len() == batch.len() {
                    job.complete(RowData::Outcomes(outcomes));
                } else {
                    let err = AppError::ResultFetchFailure {
                        job_id: job.job_id.clone(),
                        message: format!(
                            "expected {} row results, received {}",
                            batch.len(),
                            outcomes.len()
                        ),
                    };
                    job.results_incomplete = true;
                    job.fail(JobError::from(&err));
                }
                job
            }
            Ok(SubmitOutcome::Pending { job_id }) => {
                let mut job = Job::new(job_id, JobKind::Load, batch_index, batch.clone());
                job.state = JobState::RequiresPolling;
                job
            }
            Err(AppError::PollingTimeout { job_id, .. }) => {
                let mut job = Job::new(job_id, JobKind::Load, batch_index, batch.clone());
                job.state = JobState::RequiresPolling;
                job
            }
            Err(e) => {
                let job_id = e
                    .job_id()
                    .map(str::to_string)
                    .unwrap_or_else(|| Job::unsubmitted_id(batch_index));
                warn!(
                    "[SYNC] Batch {} ({} rows) failed: {}",
                    batch_index,
                    batch.len(),
                    e.safe_message()
                );
                let mut job = Job::new(job_id, JobKind::Load, batch_index, batch.clone());
                job.fail(JobError::from(&e));
                job
            }
        };

        let mut registry = self.registry.lock().await;
        if registry.get(&job.job_id).is_some() {
            // Keep both entries; the later one is registered under a
            // batch-qualified id and carries no results
            warn!(
                "[SYNC] Batch {} got job {} which is already registered",
                batch_index,
                redact_id(&job.job_id)
            );
            job.job_id = format!("{}#{}", job.job_id, batch_index);
            job.response_data = None;
            job.continuation_token = None;
            job.fail(JobError {
                kind: ErrorKind::InvalidState,
                message: "Salesforce returned a job id already used by another batch"
                    .to_string(),
            });
        }

        let job_id = job.job_id.clone();
        info!(
            "[SYNC] Batch {} -> job {} ({:?})",
            batch_index,
            redact_id(&job_id),
            job.state
        );
        registry.insert(job)?;
        Ok(job_id)
    }

    /// Submits every batch concurrently, bounded by the limiter.
    ///
    /// Returns the job ids in batch order.
    pub async fn submit_all(
        &self,
        session: Arc<Session>,
        batches: Vec<Vec<Record>>,
        request: Arc<LoadRequest>,
    ) -> Result<Vec<String>, AppError> {
        let mut tasks = JoinSet::new();
        for (batch_index, batch) in batches.into_iter().enumerate() {
            let submitter = self.clone();
            let session = session.clone();
            let request = request.clone();
            tasks.spawn(async move {
                let job_id = submitter
                    .submit_load(&session, batch_index, Arc::new(batch), &request)
                    .await;
                (batch_index, job_id)
            });
        }

        let mut ids: Vec<(usize, String)> = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            let (batch_index, job_id) = joined
                .map_err(|e| AppError::Internal(format!("Submission task failed: {}", e)))?;
            ids.push((batch_index, job_id?));
        }
        ids.sort_by_key(|(batch_index, _)| *batch_index);
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }

    /// Creates a query job and registers it as queued.
    ///
    /// Unlike loads, a rejected query is returned as an error: there is no
    /// partial report to record it in.
    pub async fn submit_query(&self, session: &Session, soql: &str) -> Result<String, AppError> {
        let job_id = {
            let _permit = self.limiter.acquire().await?;
            self.transport.create_query_job(session, soql).await?
        };

        info!("[SYNC] Query job {} created", redact_id(&job_id));
        self.registry.lock().await.insert(Job::new(
            job_id.clone(),
            JobKind::Query,
            0,
            Arc::new(Vec::new()),
        ))?;
        Ok(job_id)
    }
}
