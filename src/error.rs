use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Patterns (lowercase) that indicate sensitive data not safe for reports.
/// Used by `contains_sensitive()` for case-insensitive matching.
pub(crate) const SENSITIVE_PATTERNS: &[&str] = &[
    "bearer ",
    "refresh_token",
    "access_token",
    "client_secret",
    "authorization:",
    "password",
];

/// Returns true if the message contains any sensitive pattern (case-insensitive).
fn contains_sensitive(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Sanitizes a message before it is stored in a report.
/// If sensitive content is detected, returns the fallback instead.
pub(crate) fn sanitize_message(msg: &str, fallback: &str) -> String {
    if contains_sensitive(msg) {
        fallback.into()
    } else {
        msg.to_string()
    }
}

/// Coarse classification of an [`AppError`], carried in job-level error records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    InvalidState,
    Authentication,
    JobSubmission,
    PollingTimeout,
    ResultFetch,
    JobFailed,
    RateLimited,
    Remote,
    Connection,
    Internal,
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Caller input ──────────────────────────────────────────────────────────
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // ── Auth ──────────────────────────────────────────────────────────────────
    #[error("Authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("Session expired")]
    SessionExpired,

    // ── API ───────────────────────────────────────────────────────────────────
    #[error("Salesforce error: {0}")]
    SalesforceError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited")]
    RateLimited { retry_after_secs: Option<u64> },

    // ── Bulk Operations ───────────────────────────────────────────────────────
    #[error("Job submission failed: {message}")]
    JobSubmissionFailure {
        job_id: Option<String>,
        message: String,
    },

    #[error("Polling timed out for job {job_id}")]
    PollingTimeout {
        job_id: String,
        batch_id: Option<String>,
    },

    #[error("Result fetch failed for job {job_id}: {message}")]
    ResultFetchFailure { job_id: String, message: String },

    #[error("Bulk job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },

    // ── Data ──────────────────────────────────────────────────────────────────
    #[error("Invalid CSV: {0}")]
    CsvInvalid(String),

    // ── Network ───────────────────────────────────────────────────────────────
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // ── Generic fallback ──────────────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Classifies the error for job-level reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::InvalidArgument(_) | AppError::Config(_) => ErrorKind::InvalidArgument,
            AppError::InvalidState(_) => ErrorKind::InvalidState,
            AppError::AuthenticationFailure(_) | AppError::SessionExpired => {
                ErrorKind::Authentication
            }
            AppError::JobSubmissionFailure { .. } => ErrorKind::JobSubmission,
            AppError::PollingTimeout { .. } => ErrorKind::PollingTimeout,
            AppError::ResultFetchFailure { .. } => ErrorKind::ResultFetch,
            AppError::JobFailed { .. } => ErrorKind::JobFailed,
            AppError::RateLimited { .. } => ErrorKind::RateLimited,
            AppError::SalesforceError(_) | AppError::NotFound(_) | AppError::CsvInvalid(_) => {
                ErrorKind::Remote
            }
            AppError::ConnectionFailed(_) => ErrorKind::Connection,
            AppError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The remote job id carried by the error, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            AppError::JobSubmissionFailure { job_id, .. } => job_id.as_deref(),
            AppError::PollingTimeout { job_id, .. }
            | AppError::ResultFetchFailure { job_id, .. }
            | AppError::JobFailed { job_id, .. } => Some(job_id),
            _ => None,
        }
    }

    /// A message safe to store in a synchronization report.
    /// Never leaks secrets, tokens, or credentials.
    pub fn safe_message(&self) -> String {
        match self {
            AppError::AuthenticationFailure(_) => "Could not authenticate to Salesforce".into(),
            AppError::ConnectionFailed(msg) => {
                sanitize_message(msg, "Connection to Salesforce failed")
            }
            AppError::RateLimited { retry_after_secs } => match retry_after_secs {
                Some(secs) => format!("Salesforce is limiting requests, retry after {}s", secs),
                None => "Salesforce is limiting requests".into(),
            },
            AppError::JobSubmissionFailure { message, .. } => {
                sanitize_message(message, "The batch could not be submitted")
            }
            AppError::ResultFetchFailure { message, .. } => {
                sanitize_message(message, "Job results could not be retrieved")
            }
            AppError::JobFailed { message, .. } => {
                sanitize_message(message, "The bulk job failed")
            }
            other => sanitize_message(&other.to_string(), "An unexpected error occurred"),
        }
    }
}

/// A job-level error as recorded in the registry and the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&AppError> for JobError {
    fn from(err: &AppError) -> Self {
        Self {
            kind: err.kind(),
            message: err.safe_message(),
        }
    }
}
