//! Salesforce API interaction layer.
//!
//! - **auth / session**: OAuth token acquisition and the shared, lazily
//!   established session
//! - **client**: per-session HTTP executor with safe logging and the shared
//!   Salesforce error mapping
//! - **bulk_ingest_v2 / bulk_query_v2**: Bulk API 2.0 wire clients
//! - **rest**: single-record sObject writes
//! - **transport**: the `BulkTransport` seam the orchestrator drives, plus
//!   its HTTP implementation

use serde::{Deserialize, Serialize};

pub mod auth;
pub mod bulk_ingest_v2;
pub mod bulk_query_v2;
pub mod client;
pub mod rest;
pub mod session;
pub mod transport;

pub use auth::{Authenticator, Grant, LoginEnvironment, OAuthAuthenticator, Session};
pub use client::{LoggingMode, SalesforceClient};
pub use session::SessionManager;
pub use transport::{
    BulkTransport, HttpBulkTransport, JobKind, LoadRequest, ResultPage, ResultRequest, RowData,
    RowOutcome, SubmitOutcome,
};

/// REST API version used for every request.
pub const API_VERSION: &str = "v60.0";

/// A record as exchanged with Salesforce: field name to JSON value.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Remote job state reported by Bulk API 2.0 (ingest and query jobs share it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BulkJobState {
    Open,
    UploadComplete,
    InProgress,
    JobComplete,
    Aborted,
    Failed,
    #[serde(other)]
    Unknown,
}

/// Redacts a job ID for logging (shows first 8 chars).
pub(crate) fn redact_id(id: &str) -> String {
    match id.char_indices().nth(8) {
        Some((cut, _)) => format!("{}...", &id[..cut]),
        None => id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_deserialization() {
        let test_cases = [
            (r#""Open""#, BulkJobState::Open),
            (r#""UploadComplete""#, BulkJobState::UploadComplete),
            (r#""InProgress""#, BulkJobState::InProgress),
            (r#""JobComplete""#, BulkJobState::JobComplete),
            (r#""Aborted""#, BulkJobState::Aborted),
            (r#""Failed""#, BulkJobState::Failed),
            (r#""SomeNewState""#, BulkJobState::Unknown),
        ];

        for (json, expected) in test_cases {
            let result: BulkJobState = serde_json::from_str(json).unwrap();
            assert_eq!(result, expected, "Failed for input: {}", json);
        }
    }

    #[test]
    fn test_redact_id_long() {
        assert_eq!(redact_id("750xx000000001ABC"), "750xx000...");
    }

    #[test]
    fn test_redact_id_short() {
        assert_eq!(redact_id("short"), "short");
        assert_eq!(redact_id("12345678"), "12345678");
    }
}
