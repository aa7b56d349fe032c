//! The downstream seam the orchestrator drives, and its Bulk API 2.0
//! implementation.
//!
//! `BulkTransport` uses boxed futures like the rest of the crate's client
//! traits so hand-written fakes can stand in for Salesforce in tests.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::error::AppError;
use crate::salesforce::auth::Session;
use crate::salesforce::bulk_ingest_v2::{
    records_to_csv, BulkIngestV2Client, BulkOperation, CreateIngestJobRequest, LineEnding,
};
use crate::salesforce::bulk_query_v2::BulkQueryV2Client;
use crate::salesforce::client::{LoggingMode, SalesforceClient};
use crate::salesforce::rest::SObjectClient;
use crate::salesforce::{redact_id, BulkJobState, Record};
use crate::sync::clock::{Clock, TokioClock};

/// Boxed future returned by every transport operation.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, AppError>> + Send + 'a>>;

// ─────────────────────────────────────────────────────────────────────────────
// Shared Types
// ─────────────────────────────────────────────────────────────────────────────

/// Whether a job loads records or runs a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Load,
    Query,
}

/// Outcome of writing one input row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RowOutcome {
    pub fn succeeded(record_id: Option<String>, created: Option<bool>) -> Self {
        Self {
            success: true,
            record_id,
            created,
            error: None,
        }
    }

    pub fn failed(record_id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            record_id,
            created: None,
            error: Some(error.into()),
        }
    }
}

/// Row-level data returned by a job: per-row outcomes for loads, result
/// records for queries.
#[derive(Debug, Clone, PartialEq)]
pub enum RowData {
    Outcomes(Vec<RowOutcome>),
    Records(Vec<Record>),
}

impl RowData {
    pub fn len(&self) -> usize {
        match self {
            RowData::Outcomes(rows) => rows.len(),
            RowData::Records(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a later page, preserving order.
    pub fn append(&mut self, page: RowData) -> Result<(), AppError> {
        match (self, page) {
            (RowData::Outcomes(rows), RowData::Outcomes(more)) => rows.extend(more),
            (RowData::Records(rows), RowData::Records(more)) => rows.extend(more),
            _ => {
                return Err(AppError::Internal(
                    "result page kind does not match the job".to_string(),
                ))
            }
        }
        Ok(())
    }
}

/// What one load job writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub object: String,
    pub operation: BulkOperation,
    pub external_id_field: Option<String>,
}

/// Result of submitting one batch.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The batch finished inside the submission window.
    Completed {
        job_id: String,
        outcomes: Vec<RowOutcome>,
    },
    /// Salesforce accepted the batch; completion must be polled.
    Pending { job_id: String },
}

/// One result-page fetch.
#[derive(Debug, Clone, Copy)]
pub struct ResultRequest<'a> {
    pub job_id: &'a str,
    pub kind: JobKind,
    /// The rows that were sent; load results are correlated against them.
    pub batch: &'a [Record],
    pub token: Option<&'a str>,
}

/// One page of results plus the cursor for the next page.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultPage {
    pub rows: RowData,
    pub next_token: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// BulkTransport
// ─────────────────────────────────────────────────────────────────────────────

/// Wire-level operations against the remote bulk API.
pub trait BulkTransport: Send + Sync {
    /// Submits one batch as a load job.
    ///
    /// Errors with `AppError::PollingTimeout` when the job is accepted but did
    /// not finish within the submission window; that is a signal to poll, not
    /// a failure.
    fn submit_batch<'a>(
        &'a self,
        session: &'a Session,
        request: &'a LoadRequest,
        batch: &'a [Record],
    ) -> TransportFuture<'a, SubmitOutcome>;

    /// Creates a query job and returns its id.
    fn create_query_job<'a>(
        &'a self,
        session: &'a Session,
        soql: &'a str,
    ) -> TransportFuture<'a, String>;

    /// Reads the remote state of a job.
    fn poll_job_state<'a>(
        &'a self,
        session: &'a Session,
        job_id: &'a str,
        kind: JobKind,
    ) -> TransportFuture<'a, BulkJobState>;

    /// Fetches one page of a completed job's results.
    fn fetch_result_page<'a>(
        &'a self,
        session: &'a Session,
        request: ResultRequest<'a>,
    ) -> TransportFuture<'a, ResultPage>;

    /// Upserts one record synchronously by external id.
    fn upsert_record<'a>(
        &'a self,
        session: &'a Session,
        object: &'a str,
        external_id_field: &'a str,
        record: &'a Record,
    ) -> TransportFuture<'a, RowOutcome>;

    /// Updates one record synchronously by `Id`.
    fn update_record<'a>(
        &'a self,
        session: &'a Session,
        object: &'a str,
        record: &'a Record,
    ) -> TransportFuture<'a, RowOutcome>;
}

// ─────────────────────────────────────────────────────────────────────────────
// HttpBulkTransport
// ─────────────────────────────────────────────────────────────────────────────

/// Bulk API 2.0 over HTTP.
pub struct HttpBulkTransport {
    http: Arc<reqwest::Client>,
    staging_dir: PathBuf,
    submit_poll_interval: Duration,
    submit_poll_timeout: Duration,
    query_page_size: Option<u64>,
    logging_mode: LoggingMode,
    clock: Arc<dyn Clock>,
}

impl HttpBulkTransport {
    pub fn new(http: Arc<reqwest::Client>, config: &SyncConfig) -> Self {
        Self {
            http,
            staging_dir: config.staging_dir.clone(),
            submit_poll_interval: config.submit_poll_interval(),
            submit_poll_timeout: config.submit_poll_timeout(),
            query_page_size: config.query_page_size,
            logging_mode: LoggingMode::default(),
            clock: Arc::new(TokioClock),
        }
    }

    /// Replaces the delay source used while waiting inside the submission
    /// window.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Updates the logging mode for URL sanitization.
    pub fn with_logging_mode(mut self, mode: LoggingMode) -> Self {
        self.logging_mode = mode;
        self
    }

    fn client(&self, session: &Session) -> SalesforceClient {
        SalesforceClient::for_session(self.http.clone(), session).with_logging_mode(self.logging_mode)
    }

    fn ingest(&self, session: &Session) -> BulkIngestV2Client {
        BulkIngestV2Client::new(self.client(session), self.staging_dir.clone())
    }

    fn query(&self, session: &Session) -> BulkQueryV2Client {
        BulkQueryV2Client::new(self.client(session), self.staging_dir.clone())
    }

    /// Create, upload, close, then wait briefly for a synchronous finish.
    async fn submit(
        &self,
        session: &Session,
        request: &LoadRequest,
        batch: &[Record],
    ) -> Result<SubmitOutcome, AppError> {
        let ingest = self.ingest(session);
        let csv = records_to_csv(batch)?;

        let create = CreateIngestJobRequest {
            object: request.object.clone(),
            operation: request.operation,
            external_id_field_name: request.external_id_field.clone(),
            line_ending: Some(LineEnding::LF),
        };

        let job_id = ingest
            .create_ingest_job(create)
            .await
            .map_err(|e| AppError::JobSubmissionFailure {
                job_id: None,
                message: e.safe_message(),
            })?;

        let staged = async {
            ingest.upload_job_data(&job_id, csv).await?;
            ingest.close_job(&job_id).await
        };
        if let Err(e) = staged.await {
            // Best-effort: leave no open job behind
            if ingest.abort_job(&job_id).await.is_err() {
                warn!(
                    "[BULK-INGEST] Abort after failed upload did not succeed for {}",
                    redact_id(&job_id)
                );
            }
            return Err(AppError::JobSubmissionFailure {
                job_id: Some(job_id),
                message: e.safe_message(),
            });
        }

        // ceil(timeout / interval) waits; a zero window checks once
        let interval_ms = self.submit_poll_interval.as_millis().max(1);
        let max_waits = self.submit_poll_timeout.as_millis().div_ceil(interval_ms);
        let mut waits: u128 = 0;
        loop {
            match ingest.get_job_status(&job_id).await {
                Ok(info) if info.state == BulkJobState::JobComplete => {
                    let outcomes = ingest.fetch_outcomes(&job_id, batch).await?;
                    return Ok(SubmitOutcome::Completed { job_id, outcomes });
                }
                Ok(info) if info.state == BulkJobState::Aborted => {
                    return Err(AppError::JobFailed {
                        job_id,
                        message: "Job was aborted".to_string(),
                    });
                }
                Ok(_) => {}
                Err(e @ AppError::JobFailed { .. }) => return Err(e),
                Err(e) => {
                    info!(
                        "[BULK-INGEST] Status check failed for {} during submission: {}",
                        redact_id(&job_id),
                        e.safe_message()
                    );
                }
            }

            if waits >= max_waits {
                return Err(AppError::PollingTimeout {
                    job_id,
                    batch_id: None,
                });
            }
            waits += 1;
            self.clock.sleep(self.submit_poll_interval).await;
        }
    }
}

impl BulkTransport for HttpBulkTransport {
    fn submit_batch<'a>(
        &'a self,
        session: &'a Session,
        request: &'a LoadRequest,
        batch: &'a [Record],
    ) -> TransportFuture<'a, SubmitOutcome> {
        Box::pin(self.submit(session, request, batch))
    }

    fn create_query_job<'a>(
        &'a self,
        session: &'a Session,
        soql: &'a str,
    ) -> TransportFuture<'a, String> {
        Box::pin(async move { self.query(session).create_query_job(soql).await })
    }

    fn poll_job_state<'a>(
        &'a self,
        session: &'a Session,
        job_id: &'a str,
        kind: JobKind,
    ) -> TransportFuture<'a, BulkJobState> {
        Box::pin(async move {
            match kind {
                JobKind::Load => Ok(self.ingest(session).get_job_status(job_id).await?.state),
                JobKind::Query => Ok(self
                    .query(session)
                    .get_query_job_status(job_id)
                    .await?
                    .state),
            }
        })
    }

    fn fetch_result_page<'a>(
        &'a self,
        session: &'a Session,
        request: ResultRequest<'a>,
    ) -> TransportFuture<'a, ResultPage> {
        Box::pin(async move {
            match request.kind {
                JobKind::Load => {
                    let outcomes = self
                        .ingest(session)
                        .fetch_outcomes(request.job_id, request.batch)
                        .await?;
                    Ok(ResultPage {
                        rows: RowData::Outcomes(outcomes),
                        next_token: None,
                    })
                }
                JobKind::Query => {
                    let (records, next_token) = self
                        .query(session)
                        .fetch_result_page(request.job_id, request.token, self.query_page_size)
                        .await?;
                    Ok(ResultPage {
                        rows: RowData::Records(records),
                        next_token,
                    })
                }
            }
        })
    }

    fn upsert_record<'a>(
        &'a self,
        session: &'a Session,
        object: &'a str,
        external_id_field: &'a str,
        record: &'a Record,
    ) -> TransportFuture<'a, RowOutcome> {
        Box::pin(async move {
            SObjectClient::new(self.client(session))
                .upsert_record(object, external_id_field, record)
                .await
        })
    }

    fn update_record<'a>(
        &'a self,
        session: &'a Session,
        object: &'a str,
        record: &'a Record,
    ) -> TransportFuture<'a, RowOutcome> {
        Box::pin(async move {
            SObjectClient::new(self.client(session))
                .update_record(object, record)
                .await
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::salesforce::API_VERSION;
    use secrecy::SecretString;
    use serde_json::json;
    use tempfile::TempDir;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn transport(staging: &TempDir, timeout_secs: u64) -> HttpBulkTransport {
        let config = SyncConfig {
            staging_dir: staging.path().to_path_buf(),
            submit_poll_interval_ms: 10,
            submit_poll_timeout_secs: timeout_secs,
            ..SyncConfig::default()
        };
        HttpBulkTransport::new(Arc::new(reqwest::Client::new()), &config)
    }

    fn session(server: &MockServer) -> Session {
        Session::new(
            Url::parse(&server.uri()).unwrap(),
            SecretString::from("test_token".to_string()),
        )
    }

    async fn mount_job_lifecycle(server: &MockServer, final_state: &str) {
        let jobs = format!("/services/data/{}/jobs/ingest", API_VERSION);
        let job = format!("{}/750xx000000001ABC", jobs);

        Mock::given(method("POST"))
            .and(path(jobs.clone()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "750xx000000001ABC",
                "state": "Open",
                "object": "Account",
                "operation": "upsert"
            })))
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .and(path(format!("{}/batches", job)))
            .respond_with(ResponseTemplate::new(201))
            .mount(server)
            .await;
        Mock::given(method("PATCH"))
            .and(path(job.clone()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "750xx000000001ABC",
                "state": "UploadComplete",
                "object": "Account",
                "operation": "upsert"
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(job))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "750xx000000001ABC",
                "state": final_state,
                "object": "Account",
                "operation": "upsert"
            })))
            .mount(server)
            .await;
    }

    fn upsert_request() -> LoadRequest {
        LoadRequest {
            object: "Account".to_string(),
            operation: BulkOperation::Upsert,
            external_id_field: Some("Ext__c".to_string()),
        }
    }

    #[tokio::test]
    async fn submit_completes_synchronously_with_ordered_outcomes() {
        let mock_server = MockServer::start().await;
        let staging = TempDir::new().unwrap();
        mount_job_lifecycle(&mock_server, "JobComplete").await;

        let job = format!(
            "/services/data/{}/jobs/ingest/750xx000000001ABC",
            API_VERSION
        );
        Mock::given(method("GET"))
            .and(path(format!("{}/successfulResults", job)))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "\"sf__Id\",\"sf__Created\",Ext__c,Name\n001B,false,B,Beta\n001A,true,A,Alpha\n",
            ))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{}/failedResults", job)))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "\"sf__Id\",\"sf__Error\",Ext__c,Name\n,REQUIRED_FIELD_MISSING:Name,C,\n",
            ))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{}/unprocessedrecords", job)))
            .respond_with(ResponseTemplate::new(200).set_body_string("Ext__c,Name\n"))
            .mount(&mock_server)
            .await;

        let batch = vec![
            record(json!({"Ext__c": "A", "Name": "Alpha"})),
            record(json!({"Ext__c": "B", "Name": "Beta"})),
            record(json!({"Ext__c": "C", "Name": ""})),
        ];

        let outcome = transport(&staging, 5)
            .submit_batch(&session(&mock_server), &upsert_request(), &batch)
            .await
            .unwrap();

        match outcome {
            SubmitOutcome::Completed { job_id, outcomes } => {
                assert_eq!(job_id, "750xx000000001ABC");
                assert_eq!(outcomes.len(), 3);
                assert_eq!(outcomes[0].record_id.as_deref(), Some("001A"));
                assert_eq!(outcomes[0].created, Some(true));
                assert_eq!(outcomes[1].record_id.as_deref(), Some("001B"));
                assert!(!outcomes[2].success);
                assert!(outcomes[2]
                    .error
                    .as_deref()
                    .unwrap()
                    .contains("REQUIRED_FIELD_MISSING"));
            }
            other => panic!("Expected Completed, got: {:?}", other),
        }
        // Staged result files are gone
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn submit_still_running_signals_polling_timeout() {
        let mock_server = MockServer::start().await;
        let staging = TempDir::new().unwrap();
        mount_job_lifecycle(&mock_server, "InProgress").await;

        let batch = vec![record(json!({"Ext__c": "A"}))];

        let err = transport(&staging, 0)
            .submit_batch(&session(&mock_server), &upsert_request(), &batch)
            .await
            .unwrap_err();

        match err {
            AppError::PollingTimeout { job_id, .. } => assert_eq!(job_id, "750xx000000001ABC"),
            e => panic!("Expected PollingTimeout, got: {:?}", e),
        }
    }

    /// Returns immediately and counts the requested waits.
    #[derive(Default)]
    struct CountingClock {
        waits: std::sync::Mutex<Vec<Duration>>,
    }

    impl Clock for CountingClock {
        fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            self.waits.lock().unwrap().push(duration);
            Box::pin(std::future::ready(()))
        }
    }

    #[tokio::test]
    async fn submit_window_waits_on_the_injected_clock() {
        let mock_server = MockServer::start().await;
        let staging = TempDir::new().unwrap();
        mount_job_lifecycle(&mock_server, "InProgress").await;
        let clock = Arc::new(CountingClock::default());

        let batch = vec![record(json!({"Ext__c": "A"}))];
        let err = transport(&staging, 1)
            .with_clock(clock.clone())
            .submit_batch(&session(&mock_server), &upsert_request(), &batch)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::PollingTimeout { .. }));
        // 1s window at 10ms intervals
        let waits = clock.waits.lock().unwrap();
        assert_eq!(waits.len(), 100);
        assert!(waits.iter().all(|d| *d == Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn submit_completed_inside_window_never_waits() {
        let mock_server = MockServer::start().await;
        let staging = TempDir::new().unwrap();
        mount_job_lifecycle(&mock_server, "JobComplete").await;
        let job = format!(
            "/services/data/{}/jobs/ingest/750xx000000001ABC",
            API_VERSION
        );
        Mock::given(method("GET"))
            .and(path(format!("{}/successfulResults", job)))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("\"sf__Id\",\"sf__Created\",Ext__c\n001A,true,A\n"),
            )
            .mount(&mock_server)
            .await;
        for (file, body) in [
            ("failedResults", "\"sf__Id\",\"sf__Error\",Ext__c\n"),
            ("unprocessedrecords", "Ext__c\n"),
        ] {
            Mock::given(method("GET"))
                .and(path(format!("{}/{}", job, file)))
                .respond_with(ResponseTemplate::new(200).set_body_string(body))
                .mount(&mock_server)
                .await;
        }
        let clock = Arc::new(CountingClock::default());

        let batch = vec![record(json!({"Ext__c": "A"}))];
        let outcome = transport(&staging, 5)
            .with_clock(clock.clone())
            .submit_batch(&session(&mock_server), &upsert_request(), &batch)
            .await
            .unwrap();

        assert!(matches!(outcome, SubmitOutcome::Completed { .. }));
        assert!(clock.waits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn submit_create_rejected_is_submission_failure_without_job_id() {
        let mock_server = MockServer::start().await;
        let staging = TempDir::new().unwrap();

        Mock::given(method("POST"))
            .and(path(format!("/services/data/{}/jobs/ingest", API_VERSION)))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!([{
                "errorCode": "INVALIDJOB",
                "message": "External ID field does not exist"
            }])))
            .mount(&mock_server)
            .await;

        let batch = vec![record(json!({"Ext__c": "A"}))];
        let err = transport(&staging, 0)
            .submit_batch(&session(&mock_server), &upsert_request(), &batch)
            .await
            .unwrap_err();

        match err {
            AppError::JobSubmissionFailure { job_id, message } => {
                assert!(job_id.is_none());
                assert!(message.contains("INVALIDJOB"));
            }
            e => panic!("Expected JobSubmissionFailure, got: {:?}", e),
        }
    }

    #[tokio::test]
    async fn poll_job_state_routes_by_kind() {
        let mock_server = MockServer::start().await;
        let staging = TempDir::new().unwrap();

        Mock::given(method("GET"))
            .and(path(format!(
                "/services/data/{}/jobs/query/750xxQUERY",
                API_VERSION
            )))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "750xxQUERY",
                "state": "InProgress"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let state = transport(&staging, 0)
            .poll_job_state(&session(&mock_server), "750xxQUERY", JobKind::Query)
            .await
            .unwrap();

        assert_eq!(state, BulkJobState::InProgress);
    }

    #[test]
    fn row_data_append_rejects_mixed_kinds() {
        let mut rows = RowData::Outcomes(vec![RowOutcome::succeeded(None, None)]);
        assert!(rows.append(RowData::Records(vec![])).is_err());
        assert!(rows
            .append(RowData::Outcomes(vec![RowOutcome::failed(None, "x")]))
            .is_ok());
        assert_eq!(rows.len(), 2);
    }
}
