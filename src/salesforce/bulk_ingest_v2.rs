//! Salesforce Bulk API v2 Ingest Client.
//!
//! This module provides functionality to:
//! - Create ingest jobs (update, upsert)
//! - Upload one batch of records as CSV
//! - Close and abort jobs
//! - Poll job status
//! - Download the successful / failed / unprocessed result files and
//!   correlate them back to the batch, in input order
//!
//! # Security
//!
//! - Record contents are never logged
//! - Auth headers and tokens are never logged
//! - Only HTTP method, path, and status codes are logged

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use futures_util::StreamExt;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::info;
use url::Url;

use crate::error::AppError;
use crate::salesforce::client::{parse_error_response, RequestBody, SalesforceClient};
use crate::salesforce::transport::RowOutcome;
use crate::salesforce::{redact_id, BulkJobState, Record, API_VERSION};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Cell value that tells Salesforce to blank a field.
const NULL_CELL: &str = "#N/A";

/// Failure message for input rows with no result in any result file.
const NOT_PROCESSED: &str = "record was not processed";

const SF_ID: &str = "sf__Id";
const SF_CREATED: &str = "sf__Created";
const SF_ERROR: &str = "sf__Error";

// ─────────────────────────────────────────────────────────────────────────────
// Public Types
// ─────────────────────────────────────────────────────────────────────────────

/// Bulk ingest operation type.
///
/// IMPORTANT: Uses `#[serde(rename_all = "lowercase")]` to match Salesforce API
/// which expects lowercase values ("update", "upsert").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkOperation {
    /// Update existing records by ID.
    Update,
    /// Insert or update records based on external ID field.
    Upsert,
}

impl BulkOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkOperation::Update => "update",
            BulkOperation::Upsert => "upsert",
        }
    }
}

/// Line ending format for CSV files.
#[derive(Debug, Clone, Copy, Serialize)]
pub enum LineEnding {
    /// Unix-style line ending (\\n).
    LF,
}

/// Request body for creating an ingest job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIngestJobRequest {
    /// The Salesforce object name (e.g., "Account", "Contact").
    pub object: String,
    /// The operation to perform.
    pub operation: BulkOperation,
    /// External ID field name (required for upsert operations).
    /// IMPORTANT: Skips serialization when None because Salesforce rejects
    /// null values for this field on update operations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id_field_name: Option<String>,
    /// Line ending format for the CSV data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_ending: Option<LineEnding>,
}

/// Information about a Bulk API v2 ingest job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkIngestJobInfo {
    pub id: String,
    pub state: BulkJobState,
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default, rename = "numberRecordsProcessed")]
    pub processed_records: Option<u64>,
    #[serde(default, rename = "numberRecordsFailed")]
    pub failed_records: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// The three result files of a finished ingest job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSet {
    Successful,
    Failed,
    Unprocessed,
}

impl ResultSet {
    fn path_segment(self) -> &'static str {
        match self {
            ResultSet::Successful => "successfulResults",
            ResultSet::Failed => "failedResults",
            ResultSet::Unprocessed => "unprocessedrecords",
        }
    }
}

/// Request body for changing job state (close or abort).
#[derive(Debug, Serialize)]
struct UpdateJobStateRequest {
    state: &'static str,
}

// ─────────────────────────────────────────────────────────────────────────────
// BulkIngestV2Client
// ─────────────────────────────────────────────────────────────────────────────

/// Client for Salesforce Bulk API v2 ingest operations.
#[derive(Clone)]
pub struct BulkIngestV2Client {
    client: SalesforceClient,
    /// Directory result files are staged in while being read.
    staging_dir: PathBuf,
}

impl BulkIngestV2Client {
    pub fn new(client: SalesforceClient, staging_dir: PathBuf) -> Self {
        Self {
            client,
            staging_dir,
        }
    }

    /// Creates a new bulk ingest job and returns its ID.
    ///
    /// # Errors
    ///
    /// - `AppError::SalesforceError` - API error
    /// - `AppError::RateLimited` - Rate limit exceeded
    /// - `AppError::ConnectionFailed` - Network error
    pub async fn create_ingest_job(&self, req: CreateIngestJobRequest) -> Result<String, AppError> {
        let url = self.build_url("")?;

        let mut body = serde_json::to_value(&req).map_err(|e| {
            AppError::Internal(format!("Failed to serialize job request: {}", e))
        })?;
        body.as_object_mut()
            .ok_or_else(|| AppError::Internal("Expected object in JSON".to_string()))?
            .insert("contentType".to_string(), serde_json::json!("CSV"));

        info!(
            "[BULK-INGEST] POST /jobs/ingest (creating {} job for {})",
            req.operation.as_str(),
            req.object
        );

        let response = self
            .client
            .execute(Method::POST, url, RequestBody::Json(body))
            .await?;

        let status = response.status();
        info!("[BULK-INGEST] POST /jobs/ingest -> {}", status.as_u16());

        if !status.is_success() {
            return Err(parse_error_response(response, "Bulk ingest endpoint not found").await);
        }

        let job_info: BulkIngestJobInfo = response.json().await.map_err(|e| {
            AppError::SalesforceError(format!("Failed to parse job creation response: {}", e))
        })?;

        Ok(job_info.id)
    }

    /// Uploads the batch CSV to the job.
    pub async fn upload_job_data(&self, job_id: &str, csv: Vec<u8>) -> Result<(), AppError> {
        let url = self.build_url(&format!("/{}/batches", job_id))?;

        info!(
            "[BULK-INGEST] PUT /jobs/ingest/{}/batches ({} bytes)",
            redact_id(job_id),
            csv.len()
        );

        let response = self
            .client
            .execute(Method::PUT, url, RequestBody::Csv(csv))
            .await?;

        let status = response.status();
        info!(
            "[BULK-INGEST] PUT /jobs/ingest/{}/batches -> {}",
            redact_id(job_id),
            status.as_u16()
        );

        if !status.is_success() {
            return Err(parse_error_response(response, "Bulk ingest job not found").await);
        }

        Ok(())
    }

    /// Marks the job upload complete so Salesforce starts processing.
    pub async fn close_job(&self, job_id: &str) -> Result<(), AppError> {
        info!(
            "[BULK-INGEST] PATCH /jobs/ingest/{} (closing)",
            redact_id(job_id)
        );
        self.set_job_state(job_id, "UploadComplete").await
    }

    /// Aborts a bulk ingest job (best-effort).
    pub async fn abort_job(&self, job_id: &str) -> Result<(), AppError> {
        info!(
            "[BULK-INGEST] PATCH /jobs/ingest/{} (aborting)",
            redact_id(job_id)
        );
        self.set_job_state(job_id, "Aborted").await
    }

    /// Gets the current status of a bulk ingest job.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` - Job not found
    /// - `AppError::JobFailed` - Job is in failed state
    /// - `AppError::SalesforceError` - API error
    pub async fn get_job_status(&self, job_id: &str) -> Result<BulkIngestJobInfo, AppError> {
        let url = self.build_url(&format!("/{}", job_id))?;

        let response = self
            .client
            .execute(Method::GET, url, RequestBody::Empty)
            .await?;

        let status = response.status();
        info!(
            "[BULK-INGEST] GET /jobs/ingest/{} -> {}",
            redact_id(job_id),
            status.as_u16()
        );

        if !status.is_success() {
            return Err(parse_error_response(response, "Bulk ingest job not found").await);
        }

        let job_info: BulkIngestJobInfo = response.json().await.map_err(|e| {
            AppError::SalesforceError(format!("Failed to parse job status response: {}", e))
        })?;

        if job_info.state == BulkJobState::Failed {
            return Err(AppError::JobFailed {
                job_id: job_id.to_string(),
                message: job_info
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "Unknown error".to_string()),
            });
        }

        Ok(job_info)
    }

    /// Downloads one result file and returns its text.
    ///
    /// The body is staged to a temp file in the staging directory and the
    /// file is removed as soon as it has been read, success or not.
    pub async fn download_results(&self, job_id: &str, set: ResultSet) -> Result<String, AppError> {
        let url = self.build_url(&format!("/{}/{}", job_id, set.path_segment()))?;

        let response = self
            .client
            .execute(Method::GET, url, RequestBody::Empty)
            .await?;

        let status = response.status();
        info!(
            "[BULK-INGEST] GET /jobs/ingest/{}/{} -> {}",
            redact_id(job_id),
            set.path_segment(),
            status.as_u16()
        );

        if !status.is_success() {
            return Err(parse_error_response(response, "Bulk ingest results not found").await);
        }

        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to create staging directory: {}", e)))?;

        let staged = tempfile::NamedTempFile::new_in(&self.staging_dir)
            .map_err(|e| AppError::Internal(format!("Failed to create temp file: {}", e)))?;
        let std_file = staged
            .reopen()
            .map_err(|e| AppError::Internal(format!("Failed to reopen temp file: {}", e)))?;
        let mut async_file = File::from_std(std_file);

        let mut stream = response.bytes_stream();
        let mut total_bytes = 0usize;

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| {
                AppError::ConnectionFailed(format!("Error reading response stream: {}", e))
            })?;
            async_file
                .write_all(&chunk)
                .await
                .map_err(|e| AppError::Internal(format!("Error writing to file: {}", e)))?;
            total_bytes += chunk.len();
        }
        async_file
            .flush()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to flush staged file: {}", e)))?;
        drop(async_file);

        let text = tokio::fs::read_to_string(staged.path())
            .await
            .map_err(|e| AppError::CsvInvalid(format!("Result file is not UTF-8: {}", e)))?;

        info!(
            "[BULK-INGEST] {} read for job {}: {} bytes",
            set.path_segment(),
            redact_id(job_id),
            total_bytes
        );

        Ok(text)
    }

    /// Downloads all three result files and returns one outcome per batch
    /// row, in batch order.
    pub async fn fetch_outcomes(
        &self,
        job_id: &str,
        batch: &[Record],
    ) -> Result<Vec<RowOutcome>, AppError> {
        let fetch = async {
            let successful = self.download_results(job_id, ResultSet::Successful).await?;
            let failed = self.download_results(job_id, ResultSet::Failed).await?;
            let unprocessed = self.download_results(job_id, ResultSet::Unprocessed).await?;
            correlate_outcomes(batch, &successful, &failed, &unprocessed)
        };

        fetch.await.map_err(|e| AppError::ResultFetchFailure {
            job_id: job_id.to_string(),
            message: e.safe_message(),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Private Helpers
    // ─────────────────────────────────────────────────────────────────────────

    async fn set_job_state(&self, job_id: &str, state: &'static str) -> Result<(), AppError> {
        let url = self.build_url(&format!("/{}", job_id))?;
        let body = serde_json::to_value(UpdateJobStateRequest { state })
            .map_err(|e| AppError::Internal(format!("Failed to serialize state change: {}", e)))?;

        let response = self
            .client
            .execute(Method::PATCH, url, RequestBody::Json(body))
            .await?;

        let status = response.status();
        info!(
            "[BULK-INGEST] PATCH /jobs/ingest/{} -> {}",
            redact_id(job_id),
            status.as_u16()
        );

        if !status.is_success() {
            return Err(parse_error_response(response, "Bulk ingest job not found").await);
        }

        Ok(())
    }

    /// Builds `/services/data/vXX.X/jobs/ingest{suffix}`.
    fn build_url(&self, suffix: &str) -> Result<Url, AppError> {
        self.client.build_url(&format!(
            "/services/data/{}/jobs/ingest{}",
            API_VERSION, suffix
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CSV Encoding
// ─────────────────────────────────────────────────────────────────────────────

/// Union of the batch's field names, in first-seen order.
pub fn csv_header(batch: &[Record]) -> Vec<String> {
    let mut header: Vec<String> = Vec::new();
    for record in batch {
        for key in record.keys() {
            if !header.iter().any(|h| h == key) {
                header.push(key.clone());
            }
        }
    }
    header
}

/// Renders one JSON value as a CSV cell. `null` blanks the field.
fn to_cell(value: Option<&Value>) -> String {
    match value {
        None => String::new(),
        Some(Value::Null) => NULL_CELL.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
    }
}

/// Serializes a batch to CSV, header first.
pub fn records_to_csv(batch: &[Record]) -> Result<Vec<u8>, AppError> {
    let header = csv_header(batch);
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    writer
        .write_record(&header)
        .map_err(|e| AppError::CsvInvalid(format!("Failed to write CSV header: {}", e)))?;

    for record in batch {
        let row: Vec<String> = header.iter().map(|h| to_cell(record.get(h))).collect();
        writer
            .write_record(&row)
            .map_err(|e| AppError::CsvInvalid(format!("Failed to write CSV row: {}", e)))?;
    }

    writer
        .into_inner()
        .map_err(|e| AppError::CsvInvalid(format!("Failed to finish CSV: {}", e)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Result Correlation
// ─────────────────────────────────────────────────────────────────────────────

/// Normalizes a cell for matching; Salesforce echoes blanked fields as empty.
fn match_cell(cell: &str) -> &str {
    if cell == NULL_CELL {
        ""
    } else {
        cell
    }
}

/// One parsed result file, indexed by the echoed input columns.
struct ResultIndex {
    /// Position of each batch header column in the result file (if echoed).
    columns: Vec<Option<usize>>,
    rows: HashMap<Vec<String>, VecDeque<RowOutcome>>,
}

impl ResultIndex {
    fn parse(
        text: &str,
        header: &[String],
        to_outcome: impl Fn(&HashMap<&str, &str>) -> RowOutcome,
    ) -> Result<Self, AppError> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(text.as_bytes());

        let result_header: Vec<String> = reader
            .headers()
            .map_err(|e| AppError::CsvInvalid(format!("Invalid result header: {}", e)))?
            .iter()
            .map(|h| h.to_string())
            .collect();

        let columns: Vec<Option<usize>> = header
            .iter()
            .map(|h| result_header.iter().position(|r| r == h))
            .collect();

        let mut rows: HashMap<Vec<String>, VecDeque<RowOutcome>> = HashMap::new();
        for record in reader.records() {
            let record =
                record.map_err(|e| AppError::CsvInvalid(format!("Invalid result row: {}", e)))?;
            let fields: HashMap<&str, &str> = result_header
                .iter()
                .map(|h| h.as_str())
                .zip(record.iter())
                .collect();
            let key: Vec<String> = columns
                .iter()
                .flatten()
                .map(|&i| match_cell(record.get(i).unwrap_or("")).to_string())
                .collect();
            rows.entry(key).or_default().push_back(to_outcome(&fields));
        }

        Ok(Self { columns, rows })
    }

    /// Removes and returns the first result whose echoed columns match `cells`.
    fn take(&mut self, cells: &[String]) -> Option<RowOutcome> {
        let key: Vec<String> = self
            .columns
            .iter()
            .zip(cells)
            .filter(|(col, _)| col.is_some())
            .map(|(_, cell)| match_cell(cell).to_string())
            .collect();
        self.rows.get_mut(&key).and_then(|queue| queue.pop_front())
    }
}

fn non_empty(value: Option<&&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(|v| v.to_string())
}

/// Restores input order across the three result files.
///
/// Each input row is matched to a result row by the values Salesforce echoes
/// back for the uploaded columns; duplicates are consumed first-in first-out.
/// A row with no result anywhere becomes a "not processed" failure, so the
/// output always has exactly one outcome per input row.
pub fn correlate_outcomes(
    batch: &[Record],
    successful: &str,
    failed: &str,
    unprocessed: &str,
) -> Result<Vec<RowOutcome>, AppError> {
    let header = csv_header(batch);

    let mut successes = ResultIndex::parse(successful, &header, |f| {
        RowOutcome::succeeded(
            non_empty(f.get(SF_ID)),
            f.get(SF_CREATED).map(|c| c.eq_ignore_ascii_case("true")),
        )
    })?;
    let mut failures = ResultIndex::parse(failed, &header, |f| {
        RowOutcome::failed(
            non_empty(f.get(SF_ID)),
            non_empty(f.get(SF_ERROR)).unwrap_or_else(|| "Unknown error".to_string()),
        )
    })?;
    let mut skipped = ResultIndex::parse(unprocessed, &header, |_| {
        RowOutcome::failed(None, NOT_PROCESSED)
    })?;

    let outcomes = batch
        .iter()
        .map(|record| {
            let cells: Vec<String> = header.iter().map(|h| to_cell(record.get(h))).collect();
            successes
                .take(&cells)
                .or_else(|| failures.take(&cells))
                .or_else(|| skipped.take(&cells))
                .unwrap_or_else(|| RowOutcome::failed(None, NOT_PROCESSED))
        })
        .collect();

    Ok(outcomes)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;
    use wiremock::matchers::{body_json, body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    /// Helper to create a test client pointing to mock server.
    fn create_test_client(mock_url: &str, staging: &TempDir) -> BulkIngestV2Client {
        let client = SalesforceClient::new(
            Arc::new(reqwest::Client::new()),
            Url::parse(mock_url).unwrap(),
            SecretString::from("test_token".to_string()),
        );
        BulkIngestV2Client::new(client, staging.path().to_path_buf())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Job Lifecycle Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_create_upsert_job_includes_external_id() {
        let mock_server = MockServer::start().await;
        let staging = TempDir::new().unwrap();
        let client = create_test_client(&mock_server.uri(), &staging);

        let expected_request = json!({
            "object": "Contact",
            "operation": "upsert",
            "externalIdFieldName": "Legacy_Id__c",
            "lineEnding": "LF",
            "contentType": "CSV"
        });

        Mock::given(method("POST"))
            .and(path(format!("/services/data/{}/jobs/ingest", API_VERSION)))
            .and(header("Authorization", "Bearer test_token"))
            .and(body_json(&expected_request))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "750xx000000001ABC",
                "state": "Open",
                "object": "Contact",
                "operation": "upsert"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let req = CreateIngestJobRequest {
            object: "Contact".to_string(),
            operation: BulkOperation::Upsert,
            external_id_field_name: Some("Legacy_Id__c".to_string()),
            line_ending: Some(LineEnding::LF),
        };

        assert_eq!(
            client.create_ingest_job(req).await.unwrap(),
            "750xx000000001ABC"
        );
    }

    #[tokio::test]
    async fn test_create_update_job_skips_null_external_id() {
        let mock_server = MockServer::start().await;
        let staging = TempDir::new().unwrap();
        let client = create_test_client(&mock_server.uri(), &staging);

        Mock::given(method("POST"))
            .and(path(format!("/services/data/{}/jobs/ingest", API_VERSION)))
            .and(body_json(json!({
                "object": "Account",
                "operation": "update",
                "contentType": "CSV"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "750xx000000002ABC",
                "state": "Open"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let req = CreateIngestJobRequest {
            object: "Account".to_string(),
            operation: BulkOperation::Update,
            external_id_field_name: None,
            line_ending: None,
        };

        assert!(client.create_ingest_job(req).await.is_ok());
    }

    #[tokio::test]
    async fn test_upload_job_data_sends_csv() {
        let mock_server = MockServer::start().await;
        let staging = TempDir::new().unwrap();
        let client = create_test_client(&mock_server.uri(), &staging);

        Mock::given(method("PUT"))
            .and(path(format!(
                "/services/data/{}/jobs/ingest/750xx000000001ABC/batches",
                API_VERSION
            )))
            .and(header("Content-Type", "text/csv"))
            .and(body_string("Id,Name\n001,Acme\n"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&mock_server)
            .await;

        let result = client
            .upload_job_data("750xx000000001ABC", b"Id,Name\n001,Acme\n".to_vec())
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_close_job_success() {
        let mock_server = MockServer::start().await;
        let staging = TempDir::new().unwrap();
        let client = create_test_client(&mock_server.uri(), &staging);

        Mock::given(method("PATCH"))
            .and(path(format!(
                "/services/data/{}/jobs/ingest/750xx000000001ABC",
                API_VERSION
            )))
            .and(body_json(json!({ "state": "UploadComplete" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "750xx000000001ABC",
                "state": "UploadComplete"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        assert!(client.close_job("750xx000000001ABC").await.is_ok());
    }

    #[tokio::test]
    async fn test_get_job_status_failed_returns_error() {
        let mock_server = MockServer::start().await;
        let staging = TempDir::new().unwrap();
        let client = create_test_client(&mock_server.uri(), &staging);

        Mock::given(method("GET"))
            .and(path(format!(
                "/services/data/{}/jobs/ingest/750xx000000001ABC",
                API_VERSION
            )))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "750xx000000001ABC",
                "state": "Failed",
                "object": "Account",
                "operation": "upsert",
                "errorMessage": "InvalidBatch : Field name not found : Foo"
            })))
            .mount(&mock_server)
            .await;

        match client.get_job_status("750xx000000001ABC").await {
            Err(AppError::JobFailed { job_id, message }) => {
                assert_eq!(job_id, "750xx000000001ABC");
                assert!(message.contains("Field name not found"));
            }
            other => panic!("Expected JobFailed, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_job_status_in_progress() {
        let mock_server = MockServer::start().await;
        let staging = TempDir::new().unwrap();
        let client = create_test_client(&mock_server.uri(), &staging);

        Mock::given(method("GET"))
            .and(path(format!(
                "/services/data/{}/jobs/ingest/750xx000000001ABC",
                API_VERSION
            )))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "750xx000000001ABC",
                "state": "InProgress",
                "numberRecordsProcessed": 500,
                "numberRecordsFailed": 3
            })))
            .mount(&mock_server)
            .await;

        let info = client.get_job_status("750xx000000001ABC").await.unwrap();
        assert_eq!(info.state, BulkJobState::InProgress);
        assert_eq!(info.processed_records, Some(500));
        assert_eq!(info.failed_records, Some(3));
    }

    #[tokio::test]
    async fn test_download_results_removes_staged_file() {
        let mock_server = MockServer::start().await;
        let staging = TempDir::new().unwrap();
        let client = create_test_client(&mock_server.uri(), &staging);

        Mock::given(method("GET"))
            .and(path(format!(
                "/services/data/{}/jobs/ingest/750xx000000001ABC/failedResults",
                API_VERSION
            )))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("\"sf__Id\",\"sf__Error\",Name\n"),
            )
            .mount(&mock_server)
            .await;

        let text = client
            .download_results("750xx000000001ABC", ResultSet::Failed)
            .await
            .unwrap();

        assert!(text.starts_with("\"sf__Id\""));
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_rate_limited_error() {
        let mock_server = MockServer::start().await;
        let staging = TempDir::new().unwrap();
        let client = create_test_client(&mock_server.uri(), &staging);

        Mock::given(method("POST"))
            .and(path(format!("/services/data/{}/jobs/ingest", API_VERSION)))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "30"))
            .mount(&mock_server)
            .await;

        let req = CreateIngestJobRequest {
            object: "Account".to_string(),
            operation: BulkOperation::Update,
            external_id_field_name: None,
            line_ending: None,
        };

        assert!(matches!(
            client.create_ingest_job(req).await,
            Err(AppError::RateLimited {
                retry_after_secs: Some(30)
            })
        ));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // CSV Encoding Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_records_to_csv_uses_key_union_and_null_marker() {
        let batch = vec![
            record(json!({"Name": "Acme, Inc.", "Active__c": true})),
            record(json!({"Name": "Globex", "Phone": null, "Employees": 42})),
        ];

        let csv = String::from_utf8(records_to_csv(&batch).unwrap()).unwrap();

        assert_eq!(
            csv,
            "Name,Active__c,Phone,Employees\n\"Acme, Inc.\",true,,\nGlobex,,#N/A,42\n"
        );
    }

    #[test]
    fn test_bulk_operation_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&BulkOperation::Upsert).unwrap(),
            r#""upsert""#
        );
        assert_eq!(
            serde_json::to_string(&BulkOperation::Update).unwrap(),
            r#""update""#
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Correlation Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_correlation_restores_input_order() {
        let batch = vec![
            record(json!({"Id": "001A", "Name": "One"})),
            record(json!({"Id": "001B", "Name": "Two"})),
            record(json!({"Id": "001C", "Name": "Three"})),
        ];
        let successful = "\u{feff}\"sf__Id\",\"sf__Created\",Id,Name\n001C,false,001C,Three\n001A,false,001A,One\n";
        let failed = "\"sf__Id\",\"sf__Error\",Id,Name\n001B,ENTITY_IS_DELETED:entity is deleted:--,001B,Two\n";
        let unprocessed = "Id,Name\n";

        let outcomes = correlate_outcomes(&batch, successful, failed, unprocessed).unwrap();

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].success);
        assert_eq!(outcomes[0].record_id.as_deref(), Some("001A"));
        assert!(!outcomes[1].success);
        assert!(outcomes[1]
            .error
            .as_deref()
            .unwrap()
            .starts_with("ENTITY_IS_DELETED"));
        assert!(outcomes[2].success);
        assert_eq!(outcomes[2].created, Some(false));
    }

    #[test]
    fn test_correlation_handles_duplicates_and_missing_rows() {
        let batch = vec![
            record(json!({"Name": "Same"})),
            record(json!({"Name": "Same"})),
            record(json!({"Name": "Lost"})),
            record(json!({"Name": "Skipped"})),
        ];
        let successful = "\"sf__Id\",\"sf__Created\",Name\n001X,true,Same\n001Y,true,Same\n";
        let failed = "\"sf__Id\",\"sf__Error\",Name\n";
        let unprocessed = "Name\nSkipped\n";

        let outcomes = correlate_outcomes(&batch, successful, failed, unprocessed).unwrap();

        assert_eq!(outcomes[0].record_id.as_deref(), Some("001X"));
        assert_eq!(outcomes[1].record_id.as_deref(), Some("001Y"));
        assert_eq!(outcomes[2].error.as_deref(), Some(NOT_PROCESSED));
        assert_eq!(outcomes[3].error.as_deref(), Some(NOT_PROCESSED));
        assert!(!outcomes[3].success);
    }

    #[test]
    fn test_correlation_matches_blanked_fields() {
        let batch = vec![record(json!({"Ext__c": "K1", "Phone": null}))];
        let successful = "\"sf__Id\",\"sf__Created\",Ext__c,Phone\n003A,true,K1,\n";

        let outcomes =
            correlate_outcomes(&batch, successful, "\"sf__Id\",\"sf__Error\"\n", "Ext__c,Phone\n")
                .unwrap();

        assert!(outcomes[0].success);
        assert_eq!(outcomes[0].record_id.as_deref(), Some("003A"));
    }
}
