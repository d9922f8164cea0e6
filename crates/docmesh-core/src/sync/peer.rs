//! Sync peer
//!
//! Binds one source to the local document tree. A peer runs attempts in a
//! loop: each attempt connects the root, then every sub-document, then
//! exchanges updates until something fails. Failures other than a manual
//! stop put the peer in `Retrying`, wait a fixed delay and start over from
//! the root; nothing is resumed mid-stream, because connecting a document
//! re-derives everything the backend is missing from its state marker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::document::{DocTree, DocUpdate, DocumentError, SubdocEvent, UpdateOrigin};
use crate::document_id::DocId;
use crate::error::{SourceError, SyncError, SyncResult};
use crate::queue::{PriorityAsyncQueue, Prioritized, SharedPriorityTarget};
use crate::source::{DocSource, RemoteUpdates};
use crate::status::{Notifier, PeerStatus, PeerStep};

/// Default delay between a failed attempt and the next one
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// A diff received from the source, waiting to be applied
#[derive(Debug, Clone)]
struct PullItem {
    doc_id: DocId,
    data: Vec<u8>,
}

impl Prioritized for PullItem {
    fn doc_id(&self) -> &DocId {
        &self.doc_id
    }
}

/// Local updates for one document, waiting to be pushed together
#[derive(Debug, Clone)]
struct PushItem {
    doc_id: DocId,
    updates: Vec<Vec<u8>>,
}

impl Prioritized for PushItem {
    fn doc_id(&self) -> &DocId {
        &self.doc_id
    }
}

/// Per-attempt connection table
#[derive(Default)]
struct PeerState {
    /// Connected documents and their connection scopes
    connected: HashMap<DocId, CancellationToken>,
    /// Documents whose initial pull is in flight
    connecting: HashMap<DocId, CancellationToken>,
    pushing: bool,
    loaded_reported: bool,
}

/// Synchronizes the document tree with one source
pub struct SyncPeer {
    name: String,
    tree: Arc<DocTree>,
    source: Arc<dyn DocSource>,
    retry_delay: Duration,
    cancel: CancellationToken,
    started: AtomicBool,
    disposed: AtomicBool,
    state: Mutex<PeerState>,
    pull_queue: PriorityAsyncQueue<PullItem>,
    push_queue: PriorityAsyncQueue<PushItem>,
    subdoc_queue: PriorityAsyncQueue<DocId>,
    status: Notifier<PeerStatus>,
}

impl SyncPeer {
    /// Create a peer; it does nothing until [`SyncPeer::start`]
    pub fn new(
        tree: Arc<DocTree>,
        source: Arc<dyn DocSource>,
        priority: SharedPriorityTarget,
        retry_delay: Duration,
    ) -> Self {
        Self {
            name: source.name().to_string(),
            tree,
            source,
            retry_delay,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            state: Mutex::new(PeerState::default()),
            pull_queue: PriorityAsyncQueue::new(priority.clone()),
            push_queue: PriorityAsyncQueue::new(priority.clone()),
            subdoc_queue: PriorityAsyncQueue::new(priority),
            status: Notifier::new(PeerStatus::stopped()),
        }
    }

    /// Name of the source this peer syncs with
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> PeerStatus {
        self.status.current()
    }

    /// Stream of every status this peer emits from now on
    pub fn subscribe_status(&self) -> mpsc::UnboundedReceiver<PeerStatus> {
        self.status.subscribe()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Spawn the retry loop on the current tokio runtime
    ///
    /// A peer runs at most once: starting it again, or after `stop`, fails
    /// with [`SyncError::PeerDisposed`].
    pub fn start(self: &Arc<Self>) -> SyncResult<()> {
        if self.is_disposed() || self.started.swap(true, Ordering::AcqRel) {
            return Err(SyncError::PeerDisposed);
        }

        info!(source = %self.name, "Starting sync peer");
        tokio::spawn(self.clone().sync_retry_loop());
        Ok(())
    }

    /// Stop for good: cancel everything in flight and report `Stopped`
    pub fn stop(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        debug!(source = %self.name, "Stopping sync peer");
        let _state = self.state.lock();
        self.cancel.cancel();
        self.status.notify(PeerStatus::stopped());
    }

    /// Resolve once the root document is connected
    pub async fn wait_for_loaded_root_doc(&self, token: &CancellationToken) -> SyncResult<()> {
        self.wait_for(token, |status| status.step > PeerStep::LoadingRootDoc)
            .await
    }

    /// Resolve once every known document is connected
    pub async fn wait_for_loaded(&self, token: &CancellationToken) -> SyncResult<()> {
        self.wait_for(token, |status| status.step >= PeerStep::Loaded)
            .await
    }

    /// Resolve once nothing is pending in either direction
    pub async fn wait_for_synced(&self, token: &CancellationToken) -> SyncResult<()> {
        self.wait_for(token, |status| status.step == PeerStep::Synced)
            .await
    }

    async fn wait_for<F>(&self, token: &CancellationToken, predicate: F) -> SyncResult<()>
    where
        F: FnMut(&PeerStatus) -> bool,
    {
        let mut rx = self.status.watch();
        tokio::select! {
            biased;
            result = rx.wait_for(predicate) => result.map(|_| ()).map_err(|_| SyncError::StatusClosed),
            _ = token.cancelled() => Err(SyncError::Cancelled),
            _ = self.cancel.cancelled() => Err(SyncError::ManuallyStopped),
        }
    }

    async fn sync_retry_loop(self: Arc<Self>) {
        while !self.cancel.is_cancelled() {
            let attempt = self.cancel.child_token();
            let result = self.sync(&attempt).await;
            attempt.cancel();
            self.disconnect_all();

            match result {
                Err(err) if err.is_manual_stop() || self.cancel.is_cancelled() => break,
                Err(err) => error!(source = %self.name, error = %err, "Sync failed"),
                Ok(()) => warn!(source = %self.name, "Sync attempt ended unexpectedly"),
            }

            warn!(
                source = %self.name,
                delay = ?self.retry_delay,
                "Retrying sync after delay"
            );
            self.report_retrying();

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }

            self.reset_state();
            info!(source = %self.name, "Retrying sync");
        }

        self.report_stopped();
        debug!(source = %self.name, "Sync peer exited");
    }

    /// One attempt, from subscribing to continuous operation
    async fn sync(&self, attempt: &CancellationToken) -> SyncResult<()> {
        let mut remote = tokio::select! {
            _ = attempt.cancelled() => return Err(SyncError::ManuallyStopped),
            result = self.source.subscribe() => result?,
        };
        let mut local = self.tree.subscribe_updates();
        let mut subdocs = self.tree.subscribe_subdocs();
        self.refresh_status();

        let root = self.tree.root_id().clone();
        self.connect_doc(&root, attempt).await?;
        debug!(source = %self.name, doc_id = %root, "Root document connected");

        tokio::try_join!(
            self.forward_remote_updates(&mut remote, attempt),
            self.forward_tree_events(&mut local, &mut subdocs, attempt),
            self.load_subdocs(attempt),
            self.pull_loop(attempt),
            self.push_loop(attempt),
        )?;
        Ok(())
    }

    /// Pull a document, apply it and queue whatever the source lacks
    ///
    /// A document disconnected or dropped from the tree while its pull is
    /// in flight is skipped without error. The connection only counts while
    /// this call's scope is still the registered one; a disconnect drops the
    /// registration, so a re-add queues a fresh connection.
    async fn connect_doc(&self, id: &DocId, attempt: &CancellationToken) -> SyncResult<()> {
        let scope = attempt.child_token();
        self.state.lock().connecting.insert(id.clone(), scope.clone());
        self.refresh_status();

        let result = self.pull_and_merge(id, &scope).await;

        let mut state = self.state.lock();
        let registered = state.connecting.remove(id).is_some();
        let outcome = match result {
            Ok(()) if registered && !scope.is_cancelled() => {
                state.connected.insert(id.clone(), scope);
                Ok(())
            }
            Ok(()) => Ok(()),
            Err(_) if scope.is_cancelled() && !attempt.is_cancelled() => {
                debug!(source = %self.name, doc_id = %id, "Document disconnected while connecting");
                Ok(())
            }
            Err(SyncError::Document(DocumentError::UnknownDocument(_))) => {
                debug!(source = %self.name, doc_id = %id, "Document left the tree while connecting");
                Ok(())
            }
            Err(err) => Err(err),
        };
        drop(state);

        self.refresh_status();
        outcome
    }

    async fn pull_and_merge(&self, id: &DocId, scope: &CancellationToken) -> SyncResult<()> {
        let marker = self.tree.state_marker(id)?;
        let pulled = tokio::select! {
            _ = scope.cancelled() => return Err(SyncError::ManuallyStopped),
            result = self.source.pull(id, &marker) => result?,
        };

        let remote_state = match pulled {
            Some(pulled) => {
                self.tree.apply_update(id, &pulled.diff, self.origin())?;
                pulled.state
            }
            None => Vec::new(),
        };

        // Queue sub-documents before the root counts as connected, so the
        // peer goes straight from loading the root to loading sub-documents
        if id == self.tree.root_id() {
            for subdoc in self.tree.subdoc_ids() {
                self.enqueue_subdoc(subdoc);
            }
        }

        let missing = self.tree.diff_since(id, &remote_state)?;
        if !missing.is_empty() {
            self.enqueue_push(id.clone(), missing);
        }
        Ok(())
    }

    /// Stop tracking a document; safe while its updates are in flight
    fn disconnect_doc(&self, id: &DocId) {
        let mut state = self.state.lock();
        if let Some(scope) = state.connected.remove(id) {
            scope.cancel();
        }
        if let Some(scope) = state.connecting.remove(id) {
            scope.cancel();
        }
        drop(state);

        self.refresh_status();
    }

    fn disconnect_all(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for (_, scope) in state.connected.drain().chain(state.connecting.drain()) {
            scope.cancel();
        }
    }

    async fn forward_remote_updates(
        &self,
        remote: &mut RemoteUpdates,
        attempt: &CancellationToken,
    ) -> SyncResult<()> {
        loop {
            let update = tokio::select! {
                _ = attempt.cancelled() => return Err(SyncError::ManuallyStopped),
                update = remote.recv() => update,
            };

            let Some(update) = update else {
                return Err(SourceError::Disconnected {
                    source_name: self.name.clone(),
                }
                .into());
            };

            self.pull_queue.push([PullItem {
                doc_id: update.doc_id,
                data: update.data,
            }]);
            self.refresh_status();
        }
    }

    async fn forward_tree_events(
        &self,
        local: &mut mpsc::UnboundedReceiver<DocUpdate>,
        subdocs: &mut mpsc::UnboundedReceiver<SubdocEvent>,
        attempt: &CancellationToken,
    ) -> SyncResult<()> {
        loop {
            tokio::select! {
                _ = attempt.cancelled() => return Err(SyncError::ManuallyStopped),
                Some(update) = local.recv() => self.handle_local_update(update),
                Some(event) = subdocs.recv() => self.handle_subdoc_event(event),
            }
        }
    }

    fn handle_local_update(&self, update: DocUpdate) {
        // Updates this peer applied itself came from its own source
        if update.origin.is_source(&self.name) || !self.is_connected(&update.doc_id) {
            return;
        }
        self.enqueue_push(update.doc_id, update.data);
    }

    fn handle_subdoc_event(&self, event: SubdocEvent) {
        for id in event.added {
            self.enqueue_subdoc(id);
        }
        for id in event.removed {
            self.subdoc_queue.remove(|queued| *queued == id);
            self.disconnect_doc(&id);
        }
        self.refresh_status();
    }

    async fn load_subdocs(&self, attempt: &CancellationToken) -> SyncResult<()> {
        loop {
            let id = self.subdoc_queue.next(attempt).await?;
            if !self.tree.contains(&id) || self.is_known(&id) {
                continue;
            }
            self.connect_doc(&id, attempt).await?;
        }
    }

    async fn pull_loop(&self, attempt: &CancellationToken) -> SyncResult<()> {
        loop {
            let item = self.pull_queue.next(attempt).await?;

            if !item.data.is_empty() && self.is_connected(&item.doc_id) {
                match self.tree.apply_update(&item.doc_id, &item.data, self.origin()) {
                    Ok(_) => {}
                    Err(DocumentError::UnknownDocument(id)) => {
                        debug!(source = %self.name, doc_id = %id, "Dropping update for removed document");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            self.refresh_status();
        }
    }

    async fn push_loop(&self, attempt: &CancellationToken) -> SyncResult<()> {
        loop {
            let item = self.push_queue.next(attempt).await?;
            self.state.lock().pushing = true;
            self.refresh_status();

            // Automerge change chunks concatenate into one valid update
            let merged = item.updates.concat();
            if !merged.is_empty() {
                tokio::select! {
                    _ = attempt.cancelled() => return Err(SyncError::ManuallyStopped),
                    result = self.source.push(&item.doc_id, merged) => result?,
                }
                debug!(
                    source = %self.name,
                    doc_id = %item.doc_id,
                    updates = item.updates.len(),
                    "Pushed updates"
                );
            }

            self.state.lock().pushing = false;
            self.refresh_status();
        }
    }

    /// Queue an update, merging with a pending one for the same document
    fn enqueue_push(&self, doc_id: DocId, data: Vec<u8>) {
        let mut data = Some(data);
        let merged = self.push_queue.update(
            |item| item.doc_id == doc_id,
            |item| item.updates.extend(data.take()),
        );
        if let Some(data) = data.filter(|_| !merged) {
            self.push_queue.push([PushItem {
                doc_id,
                updates: vec![data],
            }]);
        }
        self.refresh_status();
    }

    fn enqueue_subdoc(&self, id: DocId) {
        if self.is_known(&id) || self.subdoc_queue.find(|queued| *queued == id).is_some() {
            return;
        }
        self.subdoc_queue.push([id]);
    }

    fn origin(&self) -> UpdateOrigin {
        UpdateOrigin::Source(self.name.clone())
    }

    fn is_connected(&self, id: &DocId) -> bool {
        self.state.lock().connected.contains_key(id)
    }

    /// Connected or connecting
    fn is_known(&self, id: &DocId) -> bool {
        let state = self.state.lock();
        state.connected.contains_key(id) || state.connecting.contains_key(id)
    }

    fn reset_state(&self) {
        *self.state.lock() = PeerState::default();
        self.pull_queue.clear();
        self.push_queue.clear();
        self.subdoc_queue.clear();
    }

    /// Recompute and publish the status from the connection table and queues
    fn refresh_status(&self) {
        let mut state = self.state.lock();
        if self.cancel.is_cancelled() {
            return;
        }

        let root_connected = state.connected.contains_key(self.tree.root_id());
        let subdocs_pending = self.subdoc_queue.len();
        let pending_pull = self.pull_queue.len() + state.connecting.len();
        let pending_push = self.push_queue.len()
            + usize::from(state.pushing)
            + self.unconnected_count(&state);

        let step = if !root_connected {
            PeerStep::LoadingRootDoc
        } else if subdocs_pending > 0 || !state.connecting.is_empty() {
            PeerStep::LoadingSubDoc
        } else if pending_pull > 0 || pending_push > 0 {
            PeerStep::Syncing
        } else {
            PeerStep::Synced
        };

        let status = PeerStatus {
            step,
            total_documents: state.connected.len() + state.connecting.len() + subdocs_pending,
            loaded_documents: state.connected.len(),
            pending_pull_count: pending_pull,
            pending_push_count: pending_push,
        };

        if step > PeerStep::Loaded && !state.loaded_reported {
            state.loaded_reported = true;
            info!(
                source = %self.name,
                documents = status.loaded_documents,
                "All documents loaded"
            );
            self.status.notify(PeerStatus {
                step: PeerStep::Loaded,
                ..status.clone()
            });
        }

        if self.status.current() != status {
            self.status.notify(status);
        }
    }

    /// Tree documents not connected in this attempt
    ///
    /// Their diff against the source is unknown until they connect, so each
    /// counts as a pending push.
    fn unconnected_count(&self, state: &PeerState) -> usize {
        self.tree
            .doc_ids()
            .iter()
            .filter(|id| !state.connected.contains_key(*id))
            .count()
    }

    fn report_retrying(&self) {
        let state = self.state.lock();
        if !self.cancel.is_cancelled() {
            self.status
                .notify(PeerStatus::retrying(self.unconnected_count(&state)));
        }
    }

    fn report_stopped(&self) {
        let _state = self.state.lock();
        if self.status.current().step != PeerStep::Stopped {
            self.status.notify(PeerStatus::stopped());
        }
    }
}
