//! Batch-job orchestration for synchronising large record sets through the
//! Salesforce Bulk API 2.0.
//!
//! - **config**: orchestration tunables and connection settings
//! - **error**: crate-wide error type
//! - **logging**: `tracing` subscriber setup
//! - **mapping**: typed field mapping applied before upload
//! - **salesforce**: authentication, HTTP clients and the bulk transport
//! - **sync**: splitter, job registry, submitter, poller, aggregator, and the
//!   `BulkSync` facade

pub mod config;
pub mod error;
pub mod logging;
pub mod mapping;
pub mod salesforce;
pub mod sync;

pub use config::{ConnectionConfig, SyncConfig};
pub use error::{AppError, ErrorKind, JobError};
pub use logging::{init_logging, LogConfig};
pub use mapping::{FieldMap, FieldMapping, Transform};
pub use salesforce::{BulkTransport, HttpBulkTransport, Record, RowOutcome, SessionManager};
pub use sync::{BatchSize, BulkSync, JobReport, RowResult, SyncOperation, SyncReport};
