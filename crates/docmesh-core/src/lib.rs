//! docmesh core library
//!
//! This crate replicates a tree of Automerge documents (a root document
//! and the sub-documents it references) with one primary backend and any
//! number of secondary backends, reporting progress as a status stream.
//!
//! # Architecture
//!
//! - **Automerge**: every document is a CRDT, so replicas converge no matter
//!   in which order updates are exchanged
//! - **Peers**: one per backend, each retrying on its own
//! - **Engine**: starts the peers and aggregates their status
//!
//! # Quick Start
//!
//! ```text
//! let tree = Arc::new(DocTree::new(DocId::new()));
//! let main = Arc::new(MemorySource::new("main"));
//!
//! let engine = Arc::new(DocEngine::new(tree.clone(), main, vec![]));
//! engine.start();
//!
//! tree.set_field(tree.root_id(), "title", "Hello")?;
//! engine.wait_for_graceful_stop(None).await?;
//! ```
//!
//! # Modules
//!
//! - `sync`: Sync peers and the doc engine (main entry point)
//! - `document`: Local document tree and state markers
//! - `document_id`: Document identifiers
//! - `source`: Backend contract and the in-memory backend
//! - `queue`: Cancellable async queues with shared priority
//! - `status`: Peer and engine status
//! - `config`: Engine configuration

pub mod config;
pub mod document;
pub mod document_id;
pub mod error;
pub mod queue;
pub mod source;
pub mod status;
pub mod sync;

pub use config::Config;
pub use document::{DocTree, DocUpdate, DocumentError, SubdocEvent, UpdateOrigin};
pub use document_id::DocId;
pub use error::{SourceError, SyncError, SyncResult};
pub use queue::{AsyncQueue, Cancelled, PriorityAsyncQueue, SharedPriorityTarget};
pub use source::{DocSource, MemorySource, PullResult, RemoteUpdate};
pub use status::{EngineStatus, EngineStep, PeerStatus, PeerStep};
pub use sync::{DocEngine, SyncPeer};
