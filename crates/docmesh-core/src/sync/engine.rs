//! Doc engine
//!
//! Runs one main peer and any number of shadow peers over the same tree.
//! Shadow peers start only once the main peer has connected the root, so
//! the first content a shadow sees is what the primary backend holds. Every
//! peer status change is folded into one [`EngineStatus`].

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, BoxStream, SelectAll, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::peer::{SyncPeer, DEFAULT_RETRY_DELAY};
use crate::config::Config;
use crate::document::DocTree;
use crate::document_id::DocId;
use crate::error::{SyncError, SyncResult};
use crate::queue::SharedPriorityTarget;
use crate::source::DocSource;
use crate::status::{EngineStatus, EngineStep, Notifier, PeerStatus, PeerStep};

/// The current run: its token and the peers it started
struct Run {
    token: CancellationToken,
    peers: Vec<Arc<SyncPeer>>,
}

/// Latest status of every peer in a run
struct PeerStatuses {
    main: Option<PeerStatus>,
    shadows: Vec<Option<PeerStatus>>,
}

/// Orchestrates the main and shadow peers for one document tree
pub struct DocEngine {
    tree: Arc<DocTree>,
    main: Arc<dyn DocSource>,
    shadows: Vec<Arc<dyn DocSource>>,
    retry_delay: Duration,
    priority: SharedPriorityTarget,
    status: Notifier<EngineStatus>,
    run: Mutex<Option<Run>>,
}

impl DocEngine {
    pub fn new(
        tree: Arc<DocTree>,
        main: Arc<dyn DocSource>,
        shadows: Vec<Arc<dyn DocSource>>,
    ) -> Self {
        Self {
            tree,
            main,
            shadows,
            retry_delay: DEFAULT_RETRY_DELAY,
            priority: SharedPriorityTarget::new(),
            status: Notifier::new(EngineStatus::stopped()),
            run: Mutex::new(None),
        }
    }

    /// Take the retry delay from configuration
    pub fn with_config(mut self, config: &Config) -> Self {
        self.retry_delay = config.retry_delay();
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn tree(&self) -> &Arc<DocTree> {
        &self.tree
    }

    pub fn status(&self) -> EngineStatus {
        self.status.current()
    }

    /// Stream of every status this engine emits from now on
    pub fn subscribe_status(&self) -> mpsc::UnboundedReceiver<EngineStatus> {
        self.status.subscribe()
    }

    pub fn can_graceful_stop(&self) -> bool {
        self.status.current().can_graceful_stop()
    }

    /// Serve documents matching `rule` first in every peer's queues
    pub fn set_priority_rule<F>(&self, rule: F)
    where
        F: Fn(&DocId) -> bool + Send + Sync + 'static,
    {
        self.priority.set_rule(rule);
    }

    pub fn clear_priority_rule(&self) {
        self.priority.clear_rule();
    }

    /// Start syncing, stopping any previous run first
    pub fn start(self: &Arc<Self>) {
        self.force_stop();

        let token = CancellationToken::new();
        {
            let mut run = self.run.lock();
            *run = Some(Run {
                token: token.clone(),
                peers: Vec::new(),
            });
            self.status.notify(EngineStatus {
                step: EngineStep::Syncing,
                main: None,
                shadows: vec![None; self.shadows.len()],
                retrying: false,
            });
        }

        info!(
            main = %self.main.name(),
            shadows = self.shadows.len(),
            "Starting doc engine"
        );
        tokio::spawn(self.clone().sync_task(token));
    }

    /// Stop every peer right away, abandoning in-flight pushes
    pub fn force_stop(&self) {
        let mut run = self.run.lock();
        if let Some(run) = run.take() {
            run.token.cancel();
            for peer in &run.peers {
                peer.stop();
            }
            info!("Doc engine stopped");
        }

        if self.status.current() != EngineStatus::stopped() {
            self.status.notify(EngineStatus::stopped());
        }
    }

    /// Wait until every local edit reached the main source, then stop
    ///
    /// If `cancel` fires first the engine keeps running and
    /// [`SyncError::Cancelled`] is returned.
    pub async fn wait_for_graceful_stop(&self, cancel: Option<&CancellationToken>) -> SyncResult<()> {
        self.wait_for(cancel, EngineStatus::can_graceful_stop).await?;
        self.force_stop();
        Ok(())
    }

    /// Resolve once the main and every shadow peer connected the root
    pub async fn wait_for_loaded_root_doc(&self, cancel: Option<&CancellationToken>) -> SyncResult<()> {
        self.wait_for(cancel, EngineStatus::is_root_doc_loaded).await
    }

    pub async fn wait_for_synced(&self, cancel: Option<&CancellationToken>) -> SyncResult<()> {
        self.wait_for(cancel, |status| status.step == EngineStep::Synced)
            .await
    }

    async fn wait_for<F>(&self, cancel: Option<&CancellationToken>, predicate: F) -> SyncResult<()>
    where
        F: FnMut(&EngineStatus) -> bool,
    {
        let mut rx = self.status.watch();
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            result = rx.wait_for(predicate) => result.map(|_| ()).map_err(|_| SyncError::StatusClosed),
            _ = cancelled => Err(SyncError::Cancelled),
        }
    }

    async fn sync_task(self: Arc<Self>, token: CancellationToken) {
        match self.run_peers(&token).await {
            Err(err) if err.is_manual_stop() || token.is_cancelled() => {
                debug!("Doc engine run ended");
            }
            Err(err) => {
                error!(error = %err, "Doc engine sync failed, this should never happen");
            }
            Ok(()) => {}
        }
    }

    async fn run_peers(&self, token: &CancellationToken) -> SyncResult<()> {
        let mut updates: SelectAll<BoxStream<'static, (usize, PeerStatus)>> = SelectAll::new();

        let main = self.spawn_peer(token, &self.main, 0, &mut updates)?;
        let mut statuses = PeerStatuses {
            main: Some(main.status()),
            shadows: vec![None; self.shadows.len()],
        };
        self.update_syncing_state(token, &statuses);

        let root_loaded = main.wait_for_loaded_root_doc(token);
        tokio::pin!(root_loaded);
        let mut shadows_started = false;

        loop {
            tokio::select! {
                _ = token.cancelled() => return Err(SyncError::ManuallyStopped),
                result = &mut root_loaded, if !shadows_started => {
                    result?;
                    shadows_started = true;
                    debug!(source = %self.main.name(), "Main peer loaded root, starting shadows");

                    for (i, source) in self.shadows.iter().enumerate() {
                        let peer = self.spawn_peer(token, source, i + 1, &mut updates)?;
                        statuses.shadows[i] = Some(peer.status());
                    }
                    self.update_syncing_state(token, &statuses);
                }
                Some((index, status)) = updates.next() => {
                    match index {
                        0 => statuses.main = Some(status),
                        i => statuses.shadows[i - 1] = Some(status),
                    }
                    self.update_syncing_state(token, &statuses);
                }
            }
        }
    }

    /// Build, register and start a peer; its statuses arrive tagged with `index`
    fn spawn_peer(
        &self,
        token: &CancellationToken,
        source: &Arc<dyn DocSource>,
        index: usize,
        updates: &mut SelectAll<BoxStream<'static, (usize, PeerStatus)>>,
    ) -> SyncResult<Arc<SyncPeer>> {
        let peer = Arc::new(SyncPeer::new(
            self.tree.clone(),
            source.clone(),
            self.priority.clone(),
            self.retry_delay,
        ));
        updates.push(peer_statuses(index, peer.subscribe_status()));

        let mut run = self.run.lock();
        match run.as_mut() {
            Some(run) if !token.is_cancelled() => run.peers.push(peer.clone()),
            _ => return Err(SyncError::ManuallyStopped),
        }
        peer.start()?;
        drop(run);

        Ok(peer)
    }

    fn update_syncing_state(&self, token: &CancellationToken, statuses: &PeerStatuses) {
        let _run = self.run.lock();
        if token.is_cancelled() {
            return;
        }

        let is_synced = |peer: &Option<PeerStatus>| {
            peer.as_ref()
                .is_some_and(|status| status.step == PeerStep::Synced)
        };
        let is_retrying = |peer: &Option<PeerStatus>| {
            peer.as_ref()
                .is_some_and(|status| status.step == PeerStep::Retrying)
        };

        let synced = is_synced(&statuses.main) && statuses.shadows.iter().all(is_synced);
        let retrying = is_retrying(&statuses.main) || statuses.shadows.iter().any(is_retrying);

        let status = EngineStatus {
            step: if synced {
                EngineStep::Synced
            } else {
                EngineStep::Syncing
            },
            main: statuses.main.clone(),
            shadows: statuses.shadows.clone(),
            retrying,
        };

        if self.status.current() != status {
            self.status.notify(status);
        }
    }
}

fn peer_statuses(
    index: usize,
    rx: mpsc::UnboundedReceiver<PeerStatus>,
) -> BoxStream<'static, (usize, PeerStatus)> {
    stream::unfold(rx, move |mut rx| async move {
        rx.recv().await.map(|status| ((index, status), rx))
    })
    .boxed()
}
