//! Drives jobs that did not finish at submission to a terminal state.
//!
//! Each job gets an explicit loop with a bounded number of checks at a
//! fixed interval. Once Salesforce reports the job complete, results are
//! paged in following the continuation token. A job still running when its
//! checks run out (or when the call's deadline fires) is left as
//! `RequiresPolling` and reported as pending.
//!
//! Every remote call goes through the shared `SessionManager`: a rejected
//! session is replaced once and the call repeated. A job whose checks are
//! still rejected after that, or that Salesforce no longer knows, fails.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{AppError, ErrorKind, JobError};
use crate::salesforce::session::SessionManager;
use crate::salesforce::transport::{BulkTransport, JobKind, ResultRequest, RowData};
use crate::salesforce::{redact_id, BulkJobState, Record};
use crate::sync::clock::Clock;
use crate::sync::registry::{Job, JobState, SharedRegistry};

pub struct CompletionPoller<T: BulkTransport, C: Clock> {
    transport: Arc<T>,
    sessions: Arc<SessionManager>,
    registry: SharedRegistry,
    clock: Arc<C>,
    interval: Duration,
    load_max_wait: Duration,
    query_max_wait: Option<Duration>,
}

impl<T: BulkTransport, C: Clock> Clone for CompletionPoller<T, C> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            sessions: self.sessions.clone(),
            registry: self.registry.clone(),
            clock: self.clock.clone(),
            interval: self.interval,
            load_max_wait: self.load_max_wait,
            query_max_wait: self.query_max_wait,
        }
    }
}

/// What a status check told us.
enum Tick {
    Continue,
    Done,
}

/// Treats an absent, empty, or literal `null` token as the end of results.
fn normalize_token(token: Option<String>) -> Option<String> {
    token.filter(|t| !t.is_empty() && t != "null")
}

impl<T: BulkTransport + 'static, C: Clock> CompletionPoller<T, C> {
    pub fn new(
        transport: Arc<T>,
        sessions: Arc<SessionManager>,
        registry: SharedRegistry,
        clock: Arc<C>,
        interval: Duration,
        load_max_wait: Duration,
        query_max_wait: Option<Duration>,
    ) -> Self {
        Self {
            transport,
            sessions,
            registry,
            clock,
            interval,
            load_max_wait,
            query_max_wait,
        }
    }

    /// `ceil(max_wait / interval)`; `None` means no cap.
    fn max_checks(&self, kind: JobKind) -> Option<u128> {
        let max_wait = match kind {
            JobKind::Load => Some(self.load_max_wait),
            JobKind::Query => self.query_max_wait,
        }?;
        let interval = self.interval.as_millis().max(1);
        Some(max_wait.as_millis().div_ceil(interval))
    }

    /// Polls one registered job until it is terminal, its checks run out, or
    /// `cancel` fires. Returns the job as it ends up in the registry.
    ///
    /// # Errors
    ///
    /// Only `AppError::InvalidState` for an unregistered id; remote problems
    /// are recorded on the job.
    pub async fn poll_until_done(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Job, AppError> {
        let (kind, batch) = {
            let registry = self.registry.lock().await;
            let job = registry.get(job_id).ok_or_else(|| {
                AppError::InvalidState(format!("job {} is not registered", job_id))
            })?;
            (job.kind, job.request_data.clone())
        };

        let max_checks = self.max_checks(kind);
        let mut checks: u128 = 0;

        loop {
            if max_checks.is_some_and(|max| checks >= max) {
                info!(
                    "[POLLER] Job {} still running after {} checks",
                    redact_id(job_id),
                    checks
                );
                break;
            }
            checks += 1;

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[POLLER] Job {} polling cancelled", redact_id(job_id));
                    break;
                }
                _ = self.clock.sleep(self.interval) => {}
            }

            match self.check(job_id, kind, &batch).await? {
                Tick::Continue => continue,
                Tick::Done => return self.snapshot(job_id).await,
            }
        }

        self.registry.lock().await.update(job_id, |job| {
            if job.state.is_pending() {
                job.state = JobState::RequiresPolling;
            }
        })?;
        self.snapshot(job_id).await
    }

    /// Polls every job concurrently. A cancelled token leaves the remaining
    /// jobs pending.
    pub async fn poll_all(
        &self,
        job_ids: Vec<String>,
        cancel: CancellationToken,
    ) -> Result<(), AppError> {
        info!("[POLLER] Polling {} jobs", job_ids.len());

        let mut tasks = JoinSet::new();
        for job_id in job_ids {
            let poller = self.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                poller
                    .poll_until_done(&job_id, &cancel)
                    .await
                    .map(|_| ())
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined
                .map_err(|e| AppError::Internal(format!("Polling task failed: {}", e)))
                .and_then(|r| r);
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// One status check and whatever it triggers.
    async fn check(&self, job_id: &str, kind: JobKind, batch: &[Record]) -> Result<Tick, AppError> {
        let transport = &self.transport;
        let polled = self
            .sessions
            .with_session(|session| async move {
                transport.poll_job_state(&session, job_id, kind).await
            })
            .await;

        let state = match polled {
            Ok(state) => state,
            Err(
                e @ (AppError::JobFailed { .. }
                | AppError::SessionExpired
                | AppError::AuthenticationFailure(_)
                | AppError::NotFound(_)),
            ) => {
                warn!(
                    "[POLLER] Job {} failed: {}",
                    redact_id(job_id),
                    e.safe_message()
                );
                self.registry
                    .lock()
                    .await
                    .update(job_id, |job| job.fail(JobError::from(&e)))?;
                return Ok(Tick::Done);
            }
            Err(e) => {
                warn!(
                    "[POLLER] Status check for {} failed, will retry: {}",
                    redact_id(job_id),
                    e.safe_message()
                );
                return Ok(Tick::Continue);
            }
        };

        match state {
            BulkJobState::JobComplete => {
                self.collect_results(job_id, kind, batch).await?;
                Ok(Tick::Done)
            }
            BulkJobState::Failed => {
                self.registry.lock().await.update(job_id, |job| {
                    job.fail(JobError {
                        kind: ErrorKind::JobFailed,
                        message: "The bulk job failed".to_string(),
                    })
                })?;
                Ok(Tick::Done)
            }
            BulkJobState::Aborted => {
                self.registry.lock().await.update(job_id, |job| {
                    job.state = JobState::Aborted;
                    job.error = Some(JobError {
                        kind: ErrorKind::JobFailed,
                        message: "The bulk job was aborted".to_string(),
                    });
                })?;
                Ok(Tick::Done)
            }
            running => {
                if kind == JobKind::Query {
                    let local = match running {
                        BulkJobState::InProgress => JobState::InProgress,
                        _ => JobState::UploadComplete,
                    };
                    self.registry
                        .lock()
                        .await
                        .update(job_id, |job| job.state = local)?;
                }
                Ok(Tick::Continue)
            }
        }
    }

    /// Pages in a completed job's results and records them.
    ///
    /// A failed page stops paging; the job is marked failed with its results
    /// incomplete.
    async fn collect_results(
        &self,
        job_id: &str,
        kind: JobKind,
        batch: &[Record],
    ) -> Result<(), AppError> {
        let mut rows: Option<RowData> = None;
        let mut token: Option<String> = None;
        let mut pages = 0usize;

        let failure = loop {
            let request = ResultRequest {
                job_id,
                kind,
                batch,
                token: token.as_deref(),
            };
            let transport = &self.transport;
            let fetched = self
                .sessions
                .with_session(|session| async move {
                    transport.fetch_result_page(&session, request).await
                })
                .await;
            let page = match fetched {
                Ok(page) => page,
                Err(e) => break Some(e.safe_message()),
            };
            pages += 1;

            match rows.as_mut() {
                Some(existing) => {
                    if let Err(e) = existing.append(page.rows) {
                        break Some(e.safe_message());
                    }
                }
                None => rows = Some(page.rows),
            }

            token = normalize_token(page.next_token);
            let progress = token.clone();
            self.registry
                .lock()
                .await
                .update(job_id, |job| job.continuation_token = progress)?;

            if token.is_none() {
                break None;
            }
        };

        let failure = failure.or_else(|| match (&rows, kind) {
            (Some(rows), JobKind::Load) if rows.len() != batch.len() => Some(format!(
                "expected {} row results, received {}",
                batch.len(),
                rows.len()
            )),
            _ => None,
        });

        let mut registry = self.registry.lock().await;
        match failure {
            Some(message) => {
                warn!(
                    "[POLLER] Results for {} incomplete after {} pages",
                    redact_id(job_id),
                    pages
                );
                let err = AppError::ResultFetchFailure {
                    job_id: job_id.to_string(),
                    message,
                };
                registry.update(job_id, |job| {
                    job.results_incomplete = true;
                    job.continuation_token = None;
                    job.fail(JobError::from(&err));
                })?;
            }
            None => {
                let rows = rows.unwrap_or(match kind {
                    JobKind::Load => RowData::Outcomes(Vec::new()),
                    JobKind::Query => RowData::Records(Vec::new()),
                });
                info!(
                    "[POLLER] Job {} complete: {} rows in {} pages",
                    redact_id(job_id),
                    rows.len(),
                    pages
                );
                registry.update(job_id, |job| job.complete(rows))?;
            }
        }
        Ok(())
    }

    async fn snapshot(&self, job_id: &str) -> Result<Job, AppError> {
        self.registry
            .lock()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| AppError::InvalidState(format!("job {} is not registered", job_id)))
    }
}
