//! Bulk batch-job orchestration.
//!
//! - **splitter**: partitions input into batches under the size limit
//! - **registry**: in-memory job table for one call
//! - **submitter**: concurrent fan-out of batch submissions
//! - **poller**: drives pending jobs to a terminal state and pages results
//! - **aggregator**: builds the synchronization report
//! - **orchestrator**: the `BulkSync` facade tying them together

pub mod aggregator;
pub mod clock;
pub mod limiter;
pub mod orchestrator;
pub mod poller;
pub mod registry;
pub mod splitter;
pub mod submitter;

pub use aggregator::{aggregate, JobReport, ReportContext, RowResult, SyncOperation, SyncReport};
pub use clock::{Clock, TokioClock};
pub use limiter::{SubmissionLimiter, SubmissionPermit};
pub use orchestrator::BulkSync;
pub use poller::CompletionPoller;
pub use registry::{Job, JobRegistry, JobState, SharedRegistry};
pub use splitter::{records_from_value, split, split_value, BatchSize};
pub use submitter::JobSubmitter;
