//! In-process source
//!
//! Keeps one Automerge document per id in memory and fans pushed updates
//! out to every subscriber. Several local trees syncing against the same
//! `MemorySource` behave like clients of one server.

use std::collections::HashMap;

use async_trait::async_trait;
use automerge::{AutoCommit, ReadDoc, ROOT};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{DocSource, PullResult, RemoteUpdate, RemoteUpdates};
use crate::document::{diff_after_marker, encode_state_marker, DocumentError};
use crate::document_id::DocId;
use crate::error::SourceError;

#[derive(Default)]
struct MemoryInner {
    docs: HashMap<DocId, AutoCommit>,
    subscribers: Vec<mpsc::UnboundedSender<RemoteUpdate>>,
    failing_pulls: usize,
    failing_pushes: usize,
    push_count: usize,
}

/// A [`DocSource`] backed by in-memory Automerge documents
pub struct MemorySource {
    name: String,
    inner: Mutex<MemoryInner>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    /// Merge data into a document without notifying subscribers
    pub fn import(&self, doc_id: &DocId, data: &[u8]) -> Result<(), SourceError> {
        let mut inner = self.inner.lock();
        let doc = inner
            .docs
            .entry(doc_id.clone())
            .or_insert_with(AutoCommit::new);
        if !data.is_empty() {
            doc.load_incremental(data).map_err(DocumentError::from)?;
        }
        Ok(())
    }

    /// Make the next `count` pulls fail with [`SourceError::Unavailable`]
    pub fn fail_pulls(&self, count: usize) {
        self.inner.lock().failing_pulls = count;
    }

    /// Make the next `count` pushes fail with [`SourceError::Unavailable`]
    pub fn fail_pushes(&self, count: usize) {
        self.inner.lock().failing_pushes = count;
    }

    /// Close every subscription, as if the connection dropped
    pub fn disconnect_all(&self) {
        self.inner.lock().subscribers.clear();
    }

    /// Number of successful pushes so far
    pub fn push_count(&self) -> usize {
        self.inner.lock().push_count
    }

    /// Number of open subscriptions
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|tx| !tx.is_closed());
        inner.subscribers.len()
    }

    /// Ids of every stored document, sorted
    pub fn doc_ids(&self) -> Vec<DocId> {
        let mut ids: Vec<DocId> = self.inner.lock().docs.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Read a string field from a stored document's root map
    pub fn field(&self, doc_id: &DocId, key: &str) -> Option<String> {
        let inner = self.inner.lock();
        let doc = inner.docs.get(doc_id)?;
        match doc.get(ROOT, key) {
            Ok(Some((value, _))) => value.to_str().map(|s| s.to_string()),
            _ => None,
        }
    }

    fn unavailable(&self, details: &str) -> SourceError {
        SourceError::Unavailable {
            source_name: self.name.clone(),
            details: details.to_string(),
        }
    }
}

#[async_trait]
impl DocSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pull(&self, doc_id: &DocId, state: &[u8]) -> Result<Option<PullResult>, SourceError> {
        let mut inner = self.inner.lock();
        if inner.failing_pulls > 0 {
            inner.failing_pulls -= 1;
            return Err(self.unavailable("injected pull failure"));
        }

        let Some(doc) = inner.docs.get_mut(doc_id) else {
            return Ok(None);
        };

        let diff = diff_after_marker(doc, state)?;
        let state = encode_state_marker(&doc.get_heads());
        Ok(Some(PullResult { diff, state }))
    }

    async fn push(&self, doc_id: &DocId, update: Vec<u8>) -> Result<(), SourceError> {
        let mut inner = self.inner.lock();
        if inner.failing_pushes > 0 {
            inner.failing_pushes -= 1;
            return Err(self.unavailable("injected push failure"));
        }

        let doc = inner
            .docs
            .entry(doc_id.clone())
            .or_insert_with(AutoCommit::new);
        if !update.is_empty() {
            doc.load_incremental(&update).map_err(DocumentError::from)?;
        }
        inner.push_count += 1;

        debug!(source = %self.name, doc_id = %doc_id, bytes = update.len(), "Stored update");

        let remote = RemoteUpdate {
            doc_id: doc_id.clone(),
            data: update,
        };
        inner
            .subscribers
            .retain(|tx| tx.send(remote.clone()).is_ok());
        Ok(())
    }

    async fn subscribe(&self) -> Result<RemoteUpdates, SourceError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().subscribers.push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocTree;

    fn root() -> DocId {
        DocId::from("root")
    }

    #[tokio::test]
    async fn test_pull_unknown_document() {
        let source = MemorySource::new("main");
        assert_eq!(source.pull(&root(), &[]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_push_then_pull_with_marker() {
        let source = MemorySource::new("main");
        let tree = DocTree::new(root());
        tree.set_field(&root(), "title", "Hello").unwrap();

        let update = tree.diff_since(&root(), &[]).unwrap();
        source.push(&root(), update).await.unwrap();
        assert_eq!(source.field(&root(), "title"), Some("Hello".to_string()));

        // A replica that already has everything gets an empty diff
        let marker = tree.state_marker(&root()).unwrap();
        let pulled = source.pull(&root(), &marker).await.unwrap().unwrap();
        assert!(pulled.diff.is_empty());
        assert_eq!(pulled.state, marker);

        // A fresh replica gets everything
        let pulled = source.pull(&root(), &[]).await.unwrap().unwrap();
        assert!(!pulled.diff.is_empty());
    }

    #[tokio::test]
    async fn test_push_fans_out_to_subscribers() {
        let source = MemorySource::new("main");
        let mut first = source.subscribe().await.unwrap();
        let mut second = source.subscribe().await.unwrap();

        let tree = DocTree::new(root());
        tree.set_field(&root(), "title", "Hello").unwrap();
        let update = tree.diff_since(&root(), &[]).unwrap();
        source.push(&root(), update.clone()).await.unwrap();

        assert_eq!(first.try_recv().unwrap().data, update);
        assert_eq!(second.try_recv().unwrap().doc_id, root());
        assert_eq!(source.push_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let source = MemorySource::new("main");
        source.fail_pulls(1);
        source.fail_pushes(2);

        assert!(matches!(
            source.pull(&root(), &[]).await,
            Err(SourceError::Unavailable { .. })
        ));
        assert!(source.pull(&root(), &[]).await.is_ok());

        assert!(source.push(&root(), Vec::new()).await.is_err());
        assert!(source.push(&root(), Vec::new()).await.is_err());
        assert!(source.push(&root(), Vec::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_closes_streams() {
        let source = MemorySource::new("main");
        let mut rx = source.subscribe().await.unwrap();
        assert_eq!(source.subscriber_count(), 1);

        source.disconnect_all();

        assert!(rx.recv().await.is_none());
        assert_eq!(source.subscriber_count(), 0);
    }
}
