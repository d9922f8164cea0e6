//! Backend contract consumed by sync peers
//!
//! A source stores documents somewhere else (another process, a server, a
//! local database) and can:
//! 1. Hand back the changes a replica has not seen, given its state marker
//! 2. Accept a local update
//! 3. Stream updates pushed by other clients of the same backend

mod memory;
#[cfg(test)]
pub(crate) mod recording;

pub use memory::MemorySource;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::document_id::DocId;
use crate::error::SourceError;

/// Answer to a pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullResult {
    /// Changes the caller is missing, possibly empty
    pub diff: Vec<u8>,
    /// The backend's own state marker after this pull
    pub state: Vec<u8>,
}

/// An update another client pushed to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUpdate {
    pub doc_id: DocId,
    pub data: Vec<u8>,
}

/// Remote update stream; dropping it unsubscribes, and the stream ending
/// means the backend went away
pub type RemoteUpdates = mpsc::UnboundedReceiver<RemoteUpdate>;

/// A storage or transport backend a peer synchronizes with
#[async_trait]
pub trait DocSource: Send + Sync {
    /// Stable name, also used to tag updates this source delivered
    fn name(&self) -> &str;

    /// Changes for `doc_id` not covered by `state`
    ///
    /// Returns `None` if the backend knows nothing about the document yet.
    async fn pull(&self, doc_id: &DocId, state: &[u8]) -> Result<Option<PullResult>, SourceError>;

    /// Store a local update
    async fn push(&self, doc_id: &DocId, update: Vec<u8>) -> Result<(), SourceError>;

    /// Start receiving updates from other clients
    async fn subscribe(&self) -> Result<RemoteUpdates, SourceError>;
}
