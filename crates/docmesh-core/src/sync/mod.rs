//! Sync engine
//!
//! Replicates a [`DocTree`](crate::document::DocTree) with one main source
//! and any number of shadow sources.
//!
//! ## Flow
//!
//! Each source gets a [`SyncPeer`]:
//! 1. Subscribe to remote updates
//! 2. Connect the root: pull with the local state marker, apply the diff,
//!    push what the source is missing
//! 3. Connect every sub-document the same way
//! 4. Forward local edits and remote updates until something fails
//!
//! A failed attempt waits the retry delay and starts over. The
//! [`DocEngine`] starts shadow peers once the main peer has the root and
//! folds every peer status into one [`EngineStatus`](crate::status::EngineStatus).
//!
//! ## Usage
//!
//! ```ignore
//! let engine = Arc::new(DocEngine::new(tree, main, vec![shadow]));
//! engine.start();
//! engine.wait_for_synced(None).await?;
//! engine.wait_for_graceful_stop(None).await?;
//! ```

mod engine;
mod peer;

pub use engine::DocEngine;
pub use peer::{SyncPeer, DEFAULT_RETRY_DELAY};
