//! Salesforce Bulk API v2 Query Client.
//!
//! This module provides functionality to:
//! - Create bulk query jobs from SOQL
//! - Poll job status
//! - Fetch result pages, staged on disk, as records
//! - Support job abort (best-effort)
//!
//! # Security
//!
//! - Raw SOQL queries are never logged
//! - Auth headers and tokens are never logged
//! - Only HTTP method, path, and status codes are logged

use std::path::PathBuf;

use futures_util::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::info;
use url::Url;

use crate::error::AppError;
use crate::salesforce::client::{parse_error_response, RequestBody, SalesforceClient};
use crate::salesforce::{redact_id, BulkJobState, Record, API_VERSION};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Header name for the locator used in result pagination.
const SFORCE_LOCATOR_HEADER: &str = "Sforce-Locator";

// ─────────────────────────────────────────────────────────────────────────────
// Public Types
// ─────────────────────────────────────────────────────────────────────────────

/// Information about a Bulk API v2 query job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkQueryJobInfo {
    pub id: String,
    pub state: BulkJobState,
    #[serde(default)]
    pub number_records_processed: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal Wire Types
// ─────────────────────────────────────────────────────────────────────────────

/// Request body for creating a bulk query job.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateQueryJobRequest<'a> {
    operation: &'static str,
    query: &'a str,
    content_type: &'static str,
}

// ─────────────────────────────────────────────────────────────────────────────
// BulkQueryV2Client
// ─────────────────────────────────────────────────────────────────────────────

/// Client for Salesforce Bulk API v2 query operations.
///
/// Each result page is streamed to a temp file in the staging directory,
/// parsed, and the file removed before the page is returned.
#[derive(Clone)]
pub struct BulkQueryV2Client {
    client: SalesforceClient,
    staging_dir: PathBuf,
}

impl BulkQueryV2Client {
    pub fn new(client: SalesforceClient, staging_dir: PathBuf) -> Self {
        Self {
            client,
            staging_dir,
        }
    }

    /// Creates a new bulk query job and returns its ID.
    ///
    /// # Errors
    ///
    /// - `AppError::SalesforceError` - API error (e.g. malformed SOQL)
    /// - `AppError::RateLimited` - Rate limit exceeded
    /// - `AppError::ConnectionFailed` - Network error
    pub async fn create_query_job(&self, soql: &str) -> Result<String, AppError> {
        let url = self.build_url("")?;

        let body = serde_json::to_value(CreateQueryJobRequest {
            operation: "query",
            query: soql,
            content_type: "CSV",
        })
        .map_err(|e| AppError::Internal(format!("Failed to serialize query request: {}", e)))?;

        info!("[BULK-QUERY] POST /jobs/query (creating job)");

        let response = self
            .client
            .execute(Method::POST, url, RequestBody::Json(body))
            .await?;

        let status = response.status();
        info!("[BULK-QUERY] POST /jobs/query -> {}", status.as_u16());

        if !status.is_success() {
            return Err(parse_error_response(response, "Bulk query endpoint not found").await);
        }

        let job_info: BulkQueryJobInfo = response.json().await.map_err(|e| {
            AppError::SalesforceError(format!("Failed to parse job creation response: {}", e))
        })?;

        Ok(job_info.id)
    }

    /// Gets the current status of a bulk query job.
    ///
    /// A job in `Failed` state is returned as `AppError::JobFailed`.
    pub async fn get_query_job_status(&self, job_id: &str) -> Result<BulkQueryJobInfo, AppError> {
        let url = self.build_url(&format!("/{}", job_id))?;

        let response = self
            .client
            .execute(Method::GET, url, RequestBody::Empty)
            .await?;

        let status = response.status();
        info!(
            "[BULK-QUERY] GET /jobs/query/{} -> {}",
            redact_id(job_id),
            status.as_u16()
        );

        if !status.is_success() {
            return Err(parse_error_response(response, "Bulk query job not found").await);
        }

        let job_info: BulkQueryJobInfo = response.json().await.map_err(|e| {
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

    /// Fetches one page of query results.
    ///
    /// Returns the page's records and the locator of the next page, or
    /// `None` when this was the last page.
    pub async fn fetch_result_page(
        &self,
        job_id: &str,
        locator: Option<&str>,
        max_records: Option<u64>,
    ) -> Result<(Vec<Record>, Option<String>), AppError> {
        let mut url = self.build_url(&format!("/{}/results", job_id))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(locator) = locator {
                query.append_pair("locator", locator);
            }
            if let Some(max) = max_records {
                query.append_pair("maxRecords", &max.to_string());
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }

        let response = self
            .client
            .execute(Method::GET, url, RequestBody::Empty)
            .await?;

        let status = response.status();
        info!(
            "[BULK-QUERY] GET /jobs/query/{}/results{} -> {}",
            redact_id(job_id),
            if locator.is_some() { " (paginated)" } else { "" },
            status.as_u16()
        );

        if !status.is_success() {
            return Err(parse_error_response(response, "Bulk query results not found").await);
        }

        let next_locator = extract_locator(response.headers());
        let text = self.stage_body(response).await?;
        let records = parse_result_csv(&text)?;

        info!(
            "[BULK-QUERY] Page for job {}: {} records, more: {}",
            redact_id(job_id),
            records.len(),
            next_locator.is_some()
        );

        Ok((records, next_locator))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Private Helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// Streams the body to a temp file and reads it back. The file is
    /// removed when this returns.
    async fn stage_body(&self, response: reqwest::Response) -> Result<String, AppError> {
        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to create staging directory: {}", e)))?;

        let staged = tempfile::NamedTempFile::new_in(&self.staging_dir)
            .map_err(|e| AppError::Internal(format!("Failed to create temp file: {}", e)))?;
        let std_file = staged
            .reopen()
            .map_err(|e| AppError::Internal(format!("Failed to reopen temp file: {}", e)))?;
        let mut file = File::from_std(std_file);

        let mut stream = response.bytes_stream();
        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| {
                AppError::ConnectionFailed(format!("Error reading response stream: {}", e))
            })?;
            file.write_all(&chunk)
                .await
                .map_err(|e| AppError::Internal(format!("Error writing to file: {}", e)))?;
        }
        file.flush()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to flush staged file: {}", e)))?;
        drop(file);

        tokio::fs::read_to_string(staged.path())
            .await
            .map_err(|e| AppError::CsvInvalid(format!("Result page is not UTF-8: {}", e)))
    }

    /// Builds `/services/data/vXX.X/jobs/query{suffix}`.
    fn build_url(&self, suffix: &str) -> Result<Url, AppError> {
        self.client.build_url(&format!(
            "/services/data/{}/jobs/query{}",
            API_VERSION, suffix
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helper Functions
// ─────────────────────────────────────────────────────────────────────────────

/// Extracts the next-page locator. Salesforce sends the literal `null` on
/// the last page.
fn extract_locator(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SFORCE_LOCATOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "null")
        .map(|s| s.to_string())
}

/// Parses a result page into records, one per row. Empty cells become
/// `null`; everything else stays text.
pub fn parse_result_csv(text: &str) -> Result<Vec<Record>, AppError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut reader = csv::ReaderBuilder::new().from_reader(text.as_bytes());
    let header: Vec<String> = reader
        .headers()
        .map_err(|e| AppError::CsvInvalid(format!("Invalid result header: {}", e)))?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| AppError::CsvInvalid(format!("Invalid result row: {}", e)))?;
        let record: Record = header
            .iter()
            .zip(row.iter())
            .map(|(field, cell)| {
                let value = if cell.is_empty() {
                    Value::Null
                } else {
                    Value::String(cell.to_string())
                };
                (field.clone(), value)
            })
            .collect();
        records.push(record);
    }

    Ok(records)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
