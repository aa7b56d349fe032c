//! Builds the synchronization report from a settled registry.

use serde::{Deserialize, Serialize};

use crate::error::{AppError, JobError};
use crate::salesforce::transport::{JobKind, RowData, RowOutcome};
use crate::sync::registry::{Job, JobRegistry, JobState};

/// Write operation a report describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Upsert,
    Update,
}

/// Call-level identity stamped onto the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportContext {
    pub sync_id: String,
    pub object: String,
    pub operation: SyncOperation,
}

/// Outcome of one input row, with the row as it was sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowResult {
    /// Position within the batch.
    pub row_index: usize,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The input row, serialized as JSON.
    pub input_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: String,
    pub batch_index: usize,
    pub state: JobState,
    pub rows_sent: usize,
    pub rows_synced: usize,
    pub rows_errored: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub results_incomplete: bool,
    pub rows: Vec<RowResult>,
}

/// Result of one bulk write call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub sync_id: String,
    pub object: String,
    pub operation: SyncOperation,
    pub total_jobs: usize,
    pub total_rows_synced: usize,
    pub total_rows_errored: usize,
    pub total_jobs_failed: usize,
    pub total_jobs_pending: usize,
    /// In batch order.
    pub jobs: Vec<JobReport>,
}

impl SyncReport {
    /// True when every row was written and nothing is left pending.
    pub fn is_clean(&self) -> bool {
        self.total_rows_errored == 0 && self.total_jobs_failed == 0 && self.total_jobs_pending == 0
    }

    /// Failed rows across all jobs.
    pub fn errored_rows(&self) -> impl Iterator<Item = &RowResult> {
        self.jobs
            .iter()
            .flat_map(|job| job.rows.iter())
            .filter(|row| !row.success)
    }
}

/// Builds the report for every job in `registry`.
///
/// Pure: the registry is only read, so calling it twice yields the same
/// report.
///
/// # Errors
///
/// - `AppError::InvalidState` if a job has not settled yet, or if a job's
///   outcomes cannot be matched to the rows it was sent.
/// - `AppError::Internal` if an input row cannot be serialized.
pub fn aggregate(registry: &JobRegistry, context: &ReportContext) -> Result<SyncReport, AppError> {
    let mut jobs: Vec<&Job> = registry.iter().collect();
    jobs.sort_by_key(|job| job.batch_index);

    if let Some(unsettled) = jobs.iter().find(|job| {
        matches!(
            job.state,
            JobState::Queued | JobState::UploadComplete | JobState::InProgress
        )
    }) {
        return Err(AppError::InvalidState(format!(
            "job {} is still {:?}",
            unsettled.job_id, unsettled.state
        )));
    }

    let mut report = SyncReport {
        sync_id: context.sync_id.clone(),
        object: context.object.clone(),
        operation: context.operation,
        total_jobs: jobs.len(),
        total_rows_synced: 0,
        total_rows_errored: 0,
        total_jobs_failed: 0,
        total_jobs_pending: 0,
        jobs: Vec::with_capacity(jobs.len()),
    };

    for job in jobs {
        match job.state {
            JobState::Failed | JobState::Aborted => report.total_jobs_failed += 1,
            JobState::RequiresPolling => report.total_jobs_pending += 1,
            _ => {}
        }

        let rows = match (job.kind, &job.response_data) {
            (JobKind::Load, Some(RowData::Outcomes(outcomes))) => row_results(job, outcomes)?,
            _ => Vec::new(),
        };
        let rows_synced = rows.iter().filter(|row| row.success).count();
        let rows_errored = rows.len() - rows_synced;
        report.total_rows_synced += rows_synced;
        report.total_rows_errored += rows_errored;

        report.jobs.push(JobReport {
            job_id: job.job_id.clone(),
            batch_index: job.batch_index,
            state: job.state,
            rows_sent: job.request_data.len(),
            rows_synced,
            rows_errored,
            error: job.error.clone(),
            results_incomplete: job.results_incomplete,
            rows,
        });
    }

    Ok(report)
}

/// Pairs each outcome with the row at the same position.
fn row_results(job: &Job, outcomes: &[RowOutcome]) -> Result<Vec<RowResult>, AppError> {
    if outcomes.len() != job.request_data.len() {
        return Err(AppError::InvalidState(format!(
            "job {} has {} outcomes for {} rows",
            job.job_id,
            outcomes.len(),
            job.request_data.len()
        )));
    }

    job.request_data
        .iter()
        .zip(outcomes)
        .enumerate()
        .map(|(row_index, (input, outcome))| {
            let input_data = serde_json::to_string(input)
                .map_err(|e| AppError::Internal(format!("Failed to serialize row: {}", e)))?;
            Ok(RowResult {
                row_index,
                success: outcome.success,
                record_id: outcome.record_id.clone(),
                created: outcome.created,
                error: outcome.error.clone(),
                input_data,
            })
        })
        .collect()
}
