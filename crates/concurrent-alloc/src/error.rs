//! Recoverable heap errors.
//!
//! Allocation itself never returns these: a full space is either retried
//! through a collection or ends the process.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HeapError {
    /// The OS refused to map the old-space reservation.
    #[error("failed to reserve {size} bytes for the old space")]
    Reservation {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("invalid heap configuration: {0}")]
    InvalidConfig(String),

    /// The stress task was scheduled on a heap not configured for it.
    #[error("concurrent allocation stress is disabled for this heap")]
    StressDisabled,
}
