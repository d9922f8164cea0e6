//! Local document tree
//!
//! The tree owns one Automerge document per id: the root plus every
//! sub-document reachable from it. A document references its children
//! through a `subdocs` map whose keys are child ids, so the set of
//! sub-documents is derived from content and changes as edits (local or
//! remote) land.
//!
//! Every change is published to listeners:
//! - [`DocUpdate`] carries the exact change bytes and where they came from,
//!   which is what peers push to their backends
//! - [`SubdocEvent`] reports sub-documents appearing or disappearing

use std::collections::{HashMap, HashSet, VecDeque};

use automerge::{
    transaction::Transactable, AutoCommit, AutomergeError, ChangeHash, ObjType, ReadDoc, ROOT,
};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::document_id::DocId;

/// Key of the map holding sub-document references
pub const SUBDOCS_KEY: &str = "subdocs";

/// Size of one encoded change hash in a state marker
const HASH_LEN: usize = 32;

/// Errors that can occur during document operations
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Automerge error: {0}")]
    Automerge(#[from] AutomergeError),

    #[error("Unknown document: {0}")]
    UnknownDocument(DocId),

    #[error("Invalid state marker: length {0} is not a multiple of 32")]
    InvalidStateMarker(usize),
}

/// Where an update came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Edit made through [`DocTree::edit`]
    Local,
    /// Diff applied by the peer syncing with the named source
    Source(String),
}

impl UpdateOrigin {
    /// Check if the update was applied on behalf of the given source
    pub fn is_source(&self, name: &str) -> bool {
        matches!(self, UpdateOrigin::Source(origin) if origin == name)
    }
}

/// A change to one document of the tree
#[derive(Debug, Clone)]
pub struct DocUpdate {
    pub doc_id: DocId,
    /// Automerge change chunk containing only the new changes
    pub data: Vec<u8>,
    pub origin: UpdateOrigin,
}

/// Sub-documents that became reachable or unreachable after a change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubdocEvent {
    pub added: Vec<DocId>,
    pub removed: Vec<DocId>,
}

impl SubdocEvent {
    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Encode document heads as an opaque state marker
pub fn encode_state_marker(heads: &[ChangeHash]) -> Vec<u8> {
    heads.iter().flat_map(|hash| hash.0).collect()
}

/// Decode a state marker produced by [`encode_state_marker`]
///
/// An empty marker decodes to no heads, meaning "everything".
pub fn decode_state_marker(marker: &[u8]) -> Result<Vec<ChangeHash>, DocumentError> {
    if marker.len() % HASH_LEN != 0 {
        return Err(DocumentError::InvalidStateMarker(marker.len()));
    }

    Ok(marker
        .chunks_exact(HASH_LEN)
        .map(|chunk| {
            let mut arr = [0u8; HASH_LEN];
            arr.copy_from_slice(chunk);
            ChangeHash(arr)
        })
        .collect())
}

/// Changes in `doc` not covered by `marker`, empty if there are none
pub fn diff_after_marker(doc: &mut AutoCommit, marker: &[u8]) -> Result<Vec<u8>, DocumentError> {
    let heads = decode_state_marker(marker)?;
    if doc.get_heads().is_empty() {
        return Ok(Vec::new());
    }
    Ok(doc.save_after(&heads))
}

/// Ids referenced from a document's `subdocs` map
fn referenced_subdocs(doc: &AutoCommit) -> Vec<DocId> {
    match doc.get(ROOT, SUBDOCS_KEY) {
        Ok(Some((_, obj))) => doc.keys(&obj).map(DocId::from).collect(),
        _ => Vec::new(),
    }
}

struct TreeInner {
    docs: HashMap<DocId, AutoCommit>,
    subdocs: HashSet<DocId>,
    update_listeners: Vec<mpsc::UnboundedSender<DocUpdate>>,
    subdoc_listeners: Vec<mpsc::UnboundedSender<SubdocEvent>>,
}

impl TreeInner {
    fn doc_mut(&mut self, id: &DocId) -> Result<&mut AutoCommit, DocumentError> {
        self.docs
            .get_mut(id)
            .ok_or_else(|| DocumentError::UnknownDocument(id.clone()))
    }

    fn emit_update(&mut self, update: DocUpdate) {
        self.update_listeners
            .retain(|tx| tx.send(update.clone()).is_ok());
    }

    /// Recompute the reachable sub-document set and publish the difference
    fn rescan(&mut self, root_id: &DocId) {
        let mut reachable = HashSet::new();
        let mut queue = VecDeque::from([root_id.clone()]);
        let mut visited = HashSet::from([root_id.clone()]);

        while let Some(id) = queue.pop_front() {
            let children = match self.docs.get(&id) {
                Some(doc) => referenced_subdocs(doc),
                None => continue,
            };
            for child in children {
                if visited.insert(child.clone()) {
                    self.docs.entry(child.clone()).or_insert_with(AutoCommit::new);
                    reachable.insert(child.clone());
                    queue.push_back(child);
                }
            }
        }

        let mut event = SubdocEvent {
            added: reachable.difference(&self.subdocs).cloned().collect(),
            removed: self.subdocs.difference(&reachable).cloned().collect(),
        };
        if event.is_empty() {
            return;
        }
        event.added.sort();
        event.removed.sort();

        for id in &event.removed {
            self.docs.remove(id);
        }
        self.subdocs = reachable;

        debug!(
            added = event.added.len(),
            removed = event.removed.len(),
            "Sub-documents changed"
        );
        self.subdoc_listeners
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// The local replica of a root document and its sub-documents
pub struct DocTree {
    root_id: DocId,
    inner: Mutex<TreeInner>,
}

impl DocTree {
    /// Create a tree with an empty root document
    pub fn new(root_id: DocId) -> Self {
        let mut docs = HashMap::new();
        docs.insert(root_id.clone(), AutoCommit::new());

        Self {
            root_id,
            inner: Mutex::new(TreeInner {
                docs,
                subdocs: HashSet::new(),
                update_listeners: Vec::new(),
                subdoc_listeners: Vec::new(),
            }),
        }
    }

    /// Get the root document ID
    pub fn root_id(&self) -> &DocId {
        &self.root_id
    }

    /// Check if a document is part of the tree
    pub fn contains(&self, id: &DocId) -> bool {
        self.inner.lock().docs.contains_key(id)
    }

    /// All document ids, root first, sub-documents sorted
    pub fn doc_ids(&self) -> Vec<DocId> {
        let mut ids = self.subdoc_ids();
        ids.insert(0, self.root_id.clone());
        ids
    }

    /// Currently reachable sub-documents, sorted
    pub fn subdoc_ids(&self) -> Vec<DocId> {
        let mut ids: Vec<DocId> = self.inner.lock().subdocs.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Make a local change to a document
    ///
    /// Listeners receive the new changes with [`UpdateOrigin::Local`].
    pub fn edit<F, R>(&self, id: &DocId, f: F) -> Result<R, DocumentError>
    where
        F: FnOnce(&mut AutoCommit) -> Result<R, AutomergeError>,
    {
        let mut inner = self.inner.lock();
        let doc = inner.doc_mut(id)?;

        let before = doc.get_heads();
        let result = f(doc)?;
        let data = doc.save_after(&before);

        if !data.is_empty() {
            inner.emit_update(DocUpdate {
                doc_id: id.clone(),
                data,
                origin: UpdateOrigin::Local,
            });
            inner.rescan(&self.root_id);
        }

        Ok(result)
    }

    /// Merge a diff received from a backend
    ///
    /// Returns `true` if the document changed. Listeners are only notified
    /// when it did, so re-applying known changes is silent.
    pub fn apply_update(
        &self,
        id: &DocId,
        data: &[u8],
        origin: UpdateOrigin,
    ) -> Result<bool, DocumentError> {
        if data.is_empty() {
            return Ok(false);
        }

        let mut inner = self.inner.lock();
        let doc = inner.doc_mut(id)?;

        let before = doc.get_heads();
        doc.load_incremental(data)?;
        if doc.get_heads() == before {
            return Ok(false);
        }
        let data = doc.save_after(&before);

        inner.emit_update(DocUpdate {
            doc_id: id.clone(),
            data,
            origin,
        });
        inner.rescan(&self.root_id);
        Ok(true)
    }

    /// Opaque marker summarizing the changes this replica has seen
    pub fn state_marker(&self, id: &DocId) -> Result<Vec<u8>, DocumentError> {
        let mut inner = self.inner.lock();
        let doc = inner.doc_mut(id)?;
        Ok(encode_state_marker(&doc.get_heads()))
    }

    /// Local changes not covered by a backend's state marker
    pub fn diff_since(&self, id: &DocId, marker: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let mut inner = self.inner.lock();
        let doc = inner.doc_mut(id)?;
        diff_after_marker(doc, marker)
    }

    /// Set a string field on a document's root map
    pub fn set_field(&self, id: &DocId, key: &str, value: &str) -> Result<(), DocumentError> {
        self.edit(id, |doc| doc.put(ROOT, key, value))
    }

    /// Read a string field from a document's root map
    pub fn field(&self, id: &DocId, key: &str) -> Result<Option<String>, DocumentError> {
        let inner = self.inner.lock();
        let doc = inner
            .docs
            .get(id)
            .ok_or_else(|| DocumentError::UnknownDocument(id.clone()))?;

        Ok(doc
            .get(ROOT, key)?
            .and_then(|(value, _)| value.to_str().map(|s| s.to_string())))
    }

    /// Reference `child` from `parent`, creating it as a sub-document
    pub fn add_subdoc(&self, parent: &DocId, child: &DocId) -> Result<(), DocumentError> {
        self.edit(parent, |doc| {
            let map = match doc.get(ROOT, SUBDOCS_KEY)? {
                Some((_, obj)) => obj,
                None => doc.put_object(ROOT, SUBDOCS_KEY, ObjType::Map)?,
            };
            doc.put(&map, child.as_str(), true)
        })
    }

    /// Drop the reference to `child` from `parent`
    pub fn remove_subdoc(&self, parent: &DocId, child: &DocId) -> Result<(), DocumentError> {
        self.edit(parent, |doc| {
            if let Some((_, map)) = doc.get(ROOT, SUBDOCS_KEY)? {
                doc.delete(&map, child.as_str())?;
            }
            Ok(())
        })
    }

    /// Receive every future update of every document
    pub fn subscribe_updates(&self) -> mpsc::UnboundedReceiver<DocUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().update_listeners.push(tx);
        rx
    }

    /// Receive every future change of the sub-document set
    pub fn subscribe_subdocs(&self) -> mpsc::UnboundedReceiver<SubdocEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().subdoc_listeners.push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> DocId {
        DocId::from("root")
    }

    #[test]
    fn test_state_marker_roundtrip() {
        let tree = DocTree::new(root());
        tree.set_field(&root(), "title", "Hello").unwrap();

        let marker = tree.state_marker(&root()).unwrap();
        assert_eq!(marker.len(), 32);
        assert_eq!(encode_state_marker(&decode_state_marker(&marker).unwrap()), marker);
    }

    #[test]
    fn test_invalid_state_marker() {
        let err = decode_state_marker(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, DocumentError::InvalidStateMarker(3)));
    }

    #[test]
    fn test_empty_doc_has_empty_diff() {
        let tree = DocTree::new(root());
        assert!(tree.diff_since(&root(), &[]).unwrap().is_empty());
    }

    #[test]
    fn test_diff_since_marker_replicates() {
        let local = DocTree::new(root());
        let remote = DocTree::new(root());

        local.set_field(&root(), "title", "First").unwrap();
        let full = local.diff_since(&root(), &[]).unwrap();
        assert!(remote
            .apply_update(&root(), &full, UpdateOrigin::Source("main".into()))
            .unwrap());

        let marker = remote.state_marker(&root()).unwrap();
        assert!(local.diff_since(&root(), &marker).unwrap().is_empty());

        local.set_field(&root(), "title", "Second").unwrap();
        let delta = local.diff_since(&root(), &marker).unwrap();
        remote
            .apply_update(&root(), &delta, UpdateOrigin::Source("main".into()))
            .unwrap();
        assert_eq!(
            remote.field(&root(), "title").unwrap(),
            Some("Second".to_string())
        );
    }

    #[test]
    fn test_edit_publishes_local_update() {
        let tree = DocTree::new(root());
        let mut rx = tree.subscribe_updates();

        tree.set_field(&root(), "title", "Hello").unwrap();

        let update = rx.try_recv().unwrap();
        assert_eq!(update.doc_id, root());
        assert_eq!(update.origin, UpdateOrigin::Local);
        assert!(!update.data.is_empty());
    }

    #[test]
    fn test_reapplying_known_update_is_silent() {
        let source = DocTree::new(root());
        source.set_field(&root(), "title", "Hello").unwrap();
        let data = source.diff_since(&root(), &[]).unwrap();

        let tree = DocTree::new(root());
        let mut rx = tree.subscribe_updates();
        let origin = UpdateOrigin::Source("main".into());

        assert!(tree.apply_update(&root(), &data, origin.clone()).unwrap());
        assert!(!tree.apply_update(&root(), &data, origin.clone()).unwrap());

        let update = rx.try_recv().unwrap();
        assert!(update.origin.is_source("main"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_subdoc_discovery_is_recursive() {
        let tree = DocTree::new(root());
        let mut events = tree.subscribe_subdocs();
        let page = DocId::from("page");
        let block = DocId::from("block");

        tree.add_subdoc(&root(), &page).unwrap();
        assert_eq!(
            events.try_recv().unwrap(),
            SubdocEvent {
                added: vec![page.clone()],
                removed: vec![],
            }
        );

        tree.add_subdoc(&page, &block).unwrap();
        assert_eq!(events.try_recv().unwrap().added, vec![block.clone()]);
        assert_eq!(tree.doc_ids(), vec![root(), block.clone(), page.clone()]);

        // Dropping the page makes its own children unreachable too
        tree.remove_subdoc(&root(), &page).unwrap();
        assert_eq!(
            events.try_recv().unwrap().removed,
            vec![block.clone(), page.clone()]
        );
        assert!(!tree.contains(&page));
        assert!(!tree.contains(&block));
    }

    #[test]
    fn test_remote_update_discovers_subdocs() {
        let remote = DocTree::new(root());
        remote.add_subdoc(&root(), &DocId::from("page")).unwrap();
        let data = remote.diff_since(&root(), &[]).unwrap();

        let tree = DocTree::new(root());
        let mut events = tree.subscribe_subdocs();
        tree.apply_update(&root(), &data, UpdateOrigin::Source("main".into()))
            .unwrap();

        assert_eq!(events.try_recv().unwrap().added, vec![DocId::from("page")]);
        assert!(tree.contains(&DocId::from("page")));
    }

    #[test]
    fn test_unknown_document() {
        let tree = DocTree::new(root());
        let err = tree.state_marker(&DocId::from("missing")).unwrap_err();
        assert!(matches!(err, DocumentError::UnknownDocument(_)));
    }

    #[test]
    fn test_closed_listeners_are_pruned() {
        let tree = DocTree::new(root());
        drop(tree.subscribe_updates());
        let mut live = tree.subscribe_updates();

        tree.set_field(&root(), "title", "Hello").unwrap();

        assert!(live.try_recv().is_ok());
        assert_eq!(tree.inner.lock().update_listeners.len(), 1);
    }
}
