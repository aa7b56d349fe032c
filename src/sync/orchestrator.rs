//! The caller-facing facade: split, submit, poll, aggregate.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{ConnectionConfig, SyncConfig};
use crate::error::{AppError, ErrorKind};
use crate::mapping::FieldMap;
use crate::salesforce::bulk_ingest_v2::BulkOperation;
use crate::salesforce::client::build_http_client;
use crate::salesforce::session::SessionManager;
use crate::salesforce::transport::{BulkTransport, HttpBulkTransport, LoadRequest, RowData, RowOutcome};
use crate::salesforce::{redact_id, Record};
use crate::sync::aggregator::{aggregate, ReportContext, SyncOperation, SyncReport};
use crate::sync::clock::{Clock, TokioClock};
use crate::sync::limiter::SubmissionLimiter;
use crate::sync::poller::CompletionPoller;
use crate::sync::registry::{JobRegistry, JobState, SharedRegistry};
use crate::sync::splitter::split;
use crate::sync::submitter::JobSubmitter;

/// Cancels the call's token when the deadline passes; stops the timer when
/// dropped.
struct Deadline(Option<JoinHandle<()>>);

impl Drop for Deadline {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// Bulk synchronization against one Salesforce org.
///
/// Each call gets its own job registry; nothing is shared between calls
/// except the session.
pub struct BulkSync<T: BulkTransport, C: Clock = TokioClock> {
    transport: Arc<T>,
    sessions: Arc<SessionManager>,
    clock: Arc<C>,
    config: SyncConfig,
    field_map: Option<FieldMap>,
}

impl BulkSync<HttpBulkTransport, TokioClock> {
    /// Wires the OAuth authenticator and the Bulk API 2.0 transport onto one
    /// HTTP client.
    pub fn from_connection(
        connection: ConnectionConfig,
        config: SyncConfig,
    ) -> Result<Self, AppError> {
        let http = Arc::new(build_http_client()?);
        let sessions = Arc::new(SessionManager::new(Arc::new(
            connection.into_authenticator(http.clone()),
        )));
        let transport = Arc::new(HttpBulkTransport::new(http, &config));
        Self::new(transport, sessions, config)
    }
}

impl<T: BulkTransport + 'static> BulkSync<T, TokioClock> {
    pub fn new(
        transport: Arc<T>,
        sessions: Arc<SessionManager>,
        config: SyncConfig,
    ) -> Result<Self, AppError> {
        Self::with_clock(transport, sessions, Arc::new(TokioClock), config)
    }
}

impl<T: BulkTransport + 'static, C: Clock> BulkSync<T, C> {
    /// Validates `config` and builds the facade with an explicit delay source.
    pub fn with_clock(
        transport: Arc<T>,
        sessions: Arc<SessionManager>,
        clock: Arc<C>,
        config: SyncConfig,
    ) -> Result<Self, AppError> {
        config.validate()?;
        Ok(Self {
            transport,
            sessions,
            clock,
            config,
            field_map: None,
        })
    }

    /// Applies `field_map` to every input row of the bulk write calls.
    pub fn with_field_map(mut self, field_map: FieldMap) -> Self {
        self.field_map = Some(field_map);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bulk writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Inserts or updates `records` in `object`, matching on
    /// `external_id_field`.
    ///
    /// Per-job problems land in the report; only bad arguments and
    /// authentication failures fail the call.
    pub async fn bulk_upsert(
        &self,
        object: &str,
        records: Vec<Record>,
        external_id_field: &str,
    ) -> Result<SyncReport, AppError> {
        if external_id_field.trim().is_empty() {
            return Err(AppError::InvalidArgument(
                "upsert requires an external id field".to_string(),
            ));
        }
        let request = LoadRequest {
            object: object.to_string(),
            operation: BulkOperation::Upsert,
            external_id_field: Some(external_id_field.to_string()),
        };
        self.bulk_load(SyncOperation::Upsert, request, records).await
    }

    /// Updates `records` in `object` by their `Id` field.
    pub async fn bulk_update(
        &self,
        object: &str,
        records: Vec<Record>,
    ) -> Result<SyncReport, AppError> {
        let request = LoadRequest {
            object: object.to_string(),
            operation: BulkOperation::Update,
            external_id_field: None,
        };
        self.bulk_load(SyncOperation::Update, request, records).await
    }

    async fn bulk_load(
        &self,
        operation: SyncOperation,
        request: LoadRequest,
        records: Vec<Record>,
    ) -> Result<SyncReport, AppError> {
        if request.object.trim().is_empty() {
            return Err(AppError::InvalidArgument(
                "object name must not be empty".to_string(),
            ));
        }

        let cancel = CancellationToken::new();
        let _deadline = self.arm_deadline(&cancel);

        let context = ReportContext {
            sync_id: Uuid::new_v4().to_string(),
            object: request.object.clone(),
            operation,
        };
        let records = match &self.field_map {
            Some(field_map) => field_map.apply_all(&records),
            None => records,
        };
        let total_rows = records.len();
        let batches = split(records, self.config.max_batch_size)?;

        // Authentication failure aborts before anything is submitted
        let session = self.sessions.session().await?;

        let registry = JobRegistry::shared();
        if total_rows == 0 {
            info!("[SYNC] {} {:?}: nothing to send", context.object, operation);
            return aggregate(&*registry.lock().await, &context);
        }

        info!(
            "[SYNC] {} {:?}: {} rows in {} batches",
            context.object,
            operation,
            total_rows,
            batches.len()
        );

        let submitter = JobSubmitter::new(
            self.transport.clone(),
            registry.clone(),
            SubmissionLimiter::new(self.config.max_concurrent_jobs),
        );
        submitter
            .submit_all(session, batches, Arc::new(request))
            .await?;

        let pending = registry.lock().await.ids_in_state(JobState::RequiresPolling);
        if !pending.is_empty() {
            self.poller(registry.clone())
                .poll_all(pending, cancel)
                .await?;
        }

        let report = aggregate(&*registry.lock().await, &context)?;
        info!(
            "[SYNC] {} {:?} done: {} synced, {} errored, {} jobs failed, {} pending",
            report.object,
            report.operation,
            report.total_rows_synced,
            report.total_rows_errored,
            report.total_jobs_failed,
            report.total_jobs_pending
        );
        Ok(report)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Query
    // ─────────────────────────────────────────────────────────────────────────

    /// Runs `soql` as a bulk query job and returns every result record in
    /// order.
    ///
    /// # Errors
    ///
    /// - `AppError::JobFailed` - Salesforce failed or aborted the job
    /// - `AppError::ResultFetchFailure` - a result page could not be read
    /// - `AppError::PollingTimeout` - the job was still running when polling
    ///   gave up
    pub async fn bulk_query(&self, soql: &str) -> Result<Vec<Record>, AppError> {
        if soql.trim().is_empty() {
            return Err(AppError::InvalidArgument("query must not be empty".to_string()));
        }

        let cancel = CancellationToken::new();
        let _deadline = self.arm_deadline(&cancel);

        let registry = JobRegistry::shared();
        let submitter = JobSubmitter::new(
            self.transport.clone(),
            registry.clone(),
            SubmissionLimiter::new(1),
        );
        let submitter = &submitter;
        let job_id = self
            .sessions
            .with_session(|session| async move { submitter.submit_query(&session, soql).await })
            .await?;

        let job = self
            .poller(registry)
            .poll_until_done(&job_id, &cancel)
            .await?;

        match (job.state, job.response_data) {
            (JobState::Completed, Some(RowData::Records(records))) => {
                info!(
                    "[SYNC] Query job {} returned {} records",
                    redact_id(&job_id),
                    records.len()
                );
                Ok(records)
            }
            (JobState::Completed, _) => Ok(Vec::new()),
            (JobState::Failed, _) if job.results_incomplete => {
                Err(AppError::ResultFetchFailure {
                    message: job
                        .error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "results incomplete".to_string()),
                    job_id,
                })
            }
            (JobState::Failed, _)
                if job
                    .error
                    .as_ref()
                    .is_some_and(|e| e.kind == ErrorKind::Authentication) =>
            {
                Err(AppError::SessionExpired)
            }
            (JobState::RequiresPolling, _) => {
                warn!("[SYNC] Query job {} did not finish", redact_id(&job_id));
                Err(AppError::PollingTimeout {
                    job_id,
                    batch_id: None,
                })
            }
            (_, _) => Err(AppError::JobFailed {
                message: job
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "The bulk job failed".to_string()),
                job_id,
            }),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Single records
    // ─────────────────────────────────────────────────────────────────────────

    /// Upserts one record through the REST API.
    ///
    /// A rejected session is refreshed once and the write retried.
    pub async fn upsert_record(
        &self,
        object: &str,
        external_id_field: &str,
        record: &Record,
    ) -> Result<RowOutcome, AppError> {
        if object.trim().is_empty() || external_id_field.trim().is_empty() {
            return Err(AppError::InvalidArgument(
                "upsert requires an object and an external id field".to_string(),
            ));
        }
        let transport = &self.transport;
        self.sessions
            .with_session(|session| async move {
                transport
                    .upsert_record(&session, object, external_id_field, record)
                    .await
            })
            .await
    }

    /// Updates one record by its `Id` through the REST API.
    pub async fn update_record(&self, object: &str, record: &Record) -> Result<RowOutcome, AppError> {
        if object.trim().is_empty() {
            return Err(AppError::InvalidArgument(
                "object name must not be empty".to_string(),
            ));
        }
        let transport = &self.transport;
        self.sessions
            .with_session(|session| async move {
                transport.update_record(&session, object, record).await
            })
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn poller(&self, registry: SharedRegistry) -> CompletionPoller<T, C> {
        CompletionPoller::new(
            self.transport.clone(),
            self.sessions.clone(),
            registry,
            self.clock.clone(),
            self.config.poll_interval(),
            self.config.load_poll_max_wait(),
            self.config.query_poll_max_wait(),
        )
    }

    fn arm_deadline(&self, cancel: &CancellationToken) -> Deadline {
        let Some(timeout) = self.config.overall_timeout() else {
            return Deadline(None);
        };
        let clock = self.clock.clone();
        let cancel = cancel.clone();
        Deadline(Some(tokio::spawn(async move {
            clock.sleep(timeout).await;
            info!("[SYNC] Overall timeout of {:?} reached", timeout);
            cancel.cancel();
        })))
    }
}
