//! Sync error handling
//!
//! Separates the manual-stop sentinel (never retried, never logged as an
//! error) from backend and document failures (retried by the peer).

use thiserror::Error;

use crate::document::DocumentError;
use crate::queue::Cancelled;

/// Errors reported by a [`DocSource`](crate::source::DocSource) backend
#[derive(Error, Debug)]
pub enum SourceError {
    /// Backend could not be reached or refused to serve the request
    #[error("Source '{source_name}' unavailable: {details}")]
    Unavailable {
        source_name: String,
        details: String,
    },

    /// Backend rejected an update
    #[error("Source '{source_name}' rejected update for '{doc_id}': {details}")]
    Rejected {
        source_name: String,
        doc_id: String,
        details: String,
    },

    /// The remote update subscription was closed by the backend
    #[error("Source '{source_name}' closed its update subscription")]
    Disconnected { source_name: String },

    /// Backend failed to merge or encode a document
    #[error("Source document error: {0}")]
    Document(#[from] DocumentError),
}

/// Errors raised by peers and the engine
#[derive(Error, Debug)]
pub enum SyncError {
    /// The peer or engine was stopped on purpose
    #[error("Sync manually stopped")]
    ManuallyStopped,

    /// A caller-supplied cancellation token fired while waiting
    #[error("Wait cancelled")]
    Cancelled,

    /// A stopped peer cannot be started again
    #[error("Sync peer already stopped; construct a new peer to resume")]
    PeerDisposed,

    /// The status notifier was dropped while a waiter was still listening
    #[error("Status stream closed")]
    StatusClosed,

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Document(#[from] DocumentError),
}

impl SyncError {
    /// Check if this error is the manual-stop sentinel
    pub fn is_manual_stop(&self) -> bool {
        matches!(self, SyncError::ManuallyStopped)
    }
}

/// Queue waits inside a peer are always bound to the peer's own token,
/// so a cancelled dequeue means the peer is being stopped.
impl From<Cancelled> for SyncError {
    fn from(_: Cancelled) -> Self {
        SyncError::ManuallyStopped
    }
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_stop_sentinel() {
        let err = SyncError::ManuallyStopped;
        assert!(err.is_manual_stop());
        assert!(!SyncError::Cancelled.is_manual_stop());
    }

    #[test]
    fn test_source_error_is_not_manual_stop() {
        let err: SyncError = SourceError::Unavailable {
            source_name: "main".to_string(),
            details: "connection refused".to_string(),
        }
        .into();

        assert!(!err.is_manual_stop());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_queue_cancel_maps_to_manual_stop() {
        let err: SyncError = Cancelled.into();
        assert!(err.is_manual_stop());
    }

    #[test]
    fn test_error_display() {
        let err = SourceError::Rejected {
            source_name: "shadow-1".to_string(),
            doc_id: "root".to_string(),
            details: "quota".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.contains("shadow-1"));
        assert!(msg.contains("root"));
    }
}
