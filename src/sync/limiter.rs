//! Concurrency cap for job submissions within one call.
//!
//! A permit is held for the duration of one submission and released on
//! drop, so a panicking or failing submission never leaks a slot.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::AppError;

/// Limits how many batches are being submitted at the same time.
#[derive(Clone)]
pub struct SubmissionLimiter {
    sem: Arc<Semaphore>,
}

impl SubmissionLimiter {
    /// A limit of 0 is treated as 1.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Waits for a free slot.
    pub async fn acquire(&self) -> Result<SubmissionPermit, AppError> {
        let permit = self
            .sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::Internal("submission limiter closed".to_string()))?;
        Ok(SubmissionPermit { _permit: permit })
    }
}

/// An occupied submission slot; released when dropped.
pub struct SubmissionPermit {
    _permit: OwnedSemaphorePermit,
}
