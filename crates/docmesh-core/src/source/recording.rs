//! Test source that records pulls and can hold them back

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{DocSource, MemorySource, PullResult, RemoteUpdates};
use crate::document_id::DocId;
use crate::error::SourceError;

/// Wraps a [`MemorySource`], logging every pull and delaying chosen ones
pub(crate) struct RecordingSource {
    inner: Arc<MemorySource>,
    delays: Mutex<HashMap<DocId, Duration>>,
    pulls: Mutex<Vec<DocId>>,
}

impl RecordingSource {
    pub(crate) fn new(inner: Arc<MemorySource>) -> Self {
        Self {
            inner,
            delays: Mutex::new(HashMap::new()),
            pulls: Mutex::new(Vec::new()),
        }
    }

    /// Hold every pull of `doc_id` for `delay` before answering
    pub(crate) fn delay_pulls(&self, doc_id: &DocId, delay: Duration) {
        self.delays.lock().insert(doc_id.clone(), delay);
    }

    /// Documents pulled so far, in the order the pulls started
    pub(crate) fn pulls(&self) -> Vec<DocId> {
        self.pulls.lock().clone()
    }
}

#[async_trait]
impl DocSource for RecordingSource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn pull(&self, doc_id: &DocId, state: &[u8]) -> Result<Option<PullResult>, SourceError> {
        self.pulls.lock().push(doc_id.clone());
        let delay = self.delays.lock().get(doc_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.pull(doc_id, state).await
    }

    async fn push(&self, doc_id: &DocId, update: Vec<u8>) -> Result<(), SourceError> {
        self.inner.push(doc_id, update).await
    }

    async fn subscribe(&self) -> Result<RemoteUpdates, SourceError> {
        self.inner.subscribe().await
    }
}
