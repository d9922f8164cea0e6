//! Sync status types and the notifier that publishes them

use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

/// Progress of one peer, ordered so milestones can be compared
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStep {
    /// Not running
    Stopped = 0,
    /// Waiting before the next attempt after an error
    Retrying = 1,
    /// Connecting the root document
    LoadingRootDoc = 2,
    /// Connecting sub-documents
    LoadingSubDoc = 3,
    /// Every known document connected; observed once before syncing
    Loaded = 4,
    /// Updates pending in either direction
    Syncing = 5,
    /// Nothing pending
    Synced = 6,
}

impl PeerStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerStep::Stopped => "stopped",
            PeerStep::Retrying => "retrying",
            PeerStep::LoadingRootDoc => "loading_root_doc",
            PeerStep::LoadingSubDoc => "loading_sub_doc",
            PeerStep::Loaded => "loaded",
            PeerStep::Syncing => "syncing",
            PeerStep::Synced => "synced",
        }
    }
}

impl fmt::Display for PeerStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one peer's progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerStatus {
    pub step: PeerStep,
    pub total_documents: usize,
    pub loaded_documents: usize,
    pub pending_pull_count: usize,
    pub pending_push_count: usize,
}

impl PeerStatus {
    pub fn stopped() -> Self {
        Self::at(PeerStep::Stopped)
    }

    /// Status of a peer between attempts
    ///
    /// Counts are reset except `pending_push_count`, which holds the
    /// documents whose local edits are unconfirmed until they reconnect.
    pub fn retrying(pending_push_count: usize) -> Self {
        Self {
            total_documents: 1,
            pending_push_count,
            ..Self::at(PeerStep::Retrying)
        }
    }

    fn at(step: PeerStep) -> Self {
        Self {
            step,
            total_documents: 0,
            loaded_documents: 0,
            pending_pull_count: 0,
            pending_push_count: 0,
        }
    }
}

/// Aggregated engine progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStep {
    Stopped,
    Syncing,
    Synced,
}

impl fmt::Display for EngineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineStep::Stopped => "stopped",
            EngineStep::Syncing => "syncing",
            EngineStep::Synced => "synced",
        })
    }
}

/// Snapshot of the whole engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub step: EngineStep,
    /// Main peer status, `None` before the main peer exists
    pub main: Option<PeerStatus>,
    /// One entry per shadow source, `None` until that peer exists
    pub shadows: Vec<Option<PeerStatus>>,
    /// Some peer is waiting to retry after an error
    pub retrying: bool,
}

impl EngineStatus {
    pub fn stopped() -> Self {
        Self {
            step: EngineStep::Stopped,
            main: None,
            shadows: Vec::new(),
            retrying: false,
        }
    }

    /// Main peer exists and has handed every local edit to its source
    pub fn can_graceful_stop(&self) -> bool {
        self.main
            .as_ref()
            .is_some_and(|main| main.pending_push_count == 0)
    }

    /// Main and every shadow peer are past loading the root document
    pub fn is_root_doc_loaded(&self) -> bool {
        std::iter::once(&self.main)
            .chain(self.shadows.iter())
            .all(|peer| {
                peer.as_ref()
                    .is_some_and(|status| status.step > PeerStep::LoadingRootDoc)
            })
    }
}

/// Publishes status values to listeners
///
/// Each engine and peer owns one. `subscribe` gives an ordered, lossless
/// stream of every emitted value; `watch` gives the latest value only,
/// which is what milestone waits need.
pub struct Notifier<T> {
    current: watch::Sender<T>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> Notifier<T> {
    pub fn new(initial: T) -> Self {
        let (current, _) = watch::channel(initial);
        Self {
            current,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Latest emitted value
    pub fn current(&self) -> T {
        self.current.borrow().clone()
    }

    /// Emit a value to every listener
    pub fn notify(&self, value: T) {
        let mut listeners = self.listeners.lock();
        listeners.retain(|tx| tx.send(value.clone()).is_ok());
        self.current.send_replace(value);
    }

    /// Stream of every value emitted from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(tx);
        rx
    }

    /// Latest-value receiver, used for waits
    pub fn watch(&self) -> watch::Receiver<T> {
        self.current.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(step: PeerStep, pending_push_count: usize) -> PeerStatus {
        PeerStatus {
            step,
            total_documents: 1,
            loaded_documents: 1,
            pending_pull_count: 0,
            pending_push_count,
        }
    }

    #[test]
    fn test_peer_steps_are_ordered() {
        assert!(PeerStep::Stopped < PeerStep::Retrying);
        assert!(PeerStep::Retrying < PeerStep::LoadingRootDoc);
        assert!(PeerStep::LoadingSubDoc < PeerStep::Loaded);
        assert!(PeerStep::Loaded < PeerStep::Syncing);
        assert!(PeerStep::Syncing < PeerStep::Synced);
    }

    #[test]
    fn test_can_graceful_stop() {
        let mut status = EngineStatus {
            step: EngineStep::Syncing,
            main: None,
            shadows: vec![],
            retrying: false,
        };
        assert!(!status.can_graceful_stop());

        status.main = Some(peer(PeerStep::Syncing, 2));
        assert!(!status.can_graceful_stop());

        // Pending pulls don't matter, only pushes
        let mut main = peer(PeerStep::Syncing, 0);
        main.pending_pull_count = 5;
        status.main = Some(main);
        assert!(status.can_graceful_stop());

        // A retrying main still owes its unconfirmed documents
        status.main = Some(PeerStatus::retrying(1));
        assert!(!status.can_graceful_stop());
    }

    #[test]
    fn test_root_doc_loaded_needs_every_peer() {
        let mut status = EngineStatus {
            step: EngineStep::Syncing,
            main: Some(peer(PeerStep::LoadingSubDoc, 0)),
            shadows: vec![None],
            retrying: false,
        };
        assert!(!status.is_root_doc_loaded());

        status.shadows = vec![Some(peer(PeerStep::LoadingRootDoc, 0))];
        assert!(!status.is_root_doc_loaded());

        status.shadows = vec![Some(peer(PeerStep::Synced, 0))];
        assert!(status.is_root_doc_loaded());

        status.main = Some(peer(PeerStep::Retrying, 0));
        assert!(!status.is_root_doc_loaded());
    }

    #[test]
    fn test_notifier_stream_is_ordered_and_lossless() {
        let notifier = Notifier::new(0);
        let mut rx = notifier.subscribe();

        for i in 1..=100 {
            notifier.notify(i);
        }

        for i in 1..=100 {
            assert_eq!(rx.try_recv().unwrap(), i);
        }
        assert_eq!(notifier.current(), 100);
        assert_eq!(*notifier.watch().borrow(), 100);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_value(EngineStatus::stopped()).unwrap();
        assert_eq!(json["step"], "stopped");
        assert_eq!(json["retrying"], false);
        assert!(json["main"].is_null());

        let json = serde_json::to_value(PeerStatus::retrying(2)).unwrap();
        assert_eq!(json["step"], PeerStep::Retrying.as_str());
        assert_eq!(json["total_documents"], 1);
        assert_eq!(json["pending_push_count"], 2);
    }
}
