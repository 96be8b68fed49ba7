//! # smartoj-sync - binlog CDC for SmartOJ
//!
//! Tails the MySQL binlog of the `smartoj` schema and keeps the question
//! search index and reply notifications in step with the relational data.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────┐   ┌──────────────┐   ┌────────────┐
//! │ MySQL binlog │──▶│StreamReader│──▶│ HandoffQueue │──▶│ Dispatcher │
//! │              │   │ (OS thread)│   │  (bounded)   │   │ (scheduler)│
//! └──────────────┘   └────────────┘   └──────────────┘   └─────┬──────┘
//!                                                              │
//!                         ┌──────────────────┬─────────────────┤
//!                         ▼                  ▼                 │
//!                  ┌─────────────┐    ┌────────────┐           │
//!                  │PositionStore│    │ TaskBroker │◀──────────┘
//!                  └─────────────┘    └─────┬──────┘
//!                                           ▼
//!                                  ┌─────────────────┐
//!                                  │ HandlerRegistry │
//!                                  └───┬────────┬────┘
//!                                      ▼        ▼
//!                              SearchIndex   NotificationStore
//! ```
//!
//! Delivery is at-least-once: a batch's position is saved only after the
//! broker accepted every record in it, and every handler is idempotent, so
//! a restart from the last checkpoint replays without visible duplicates.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> smartoj_sync::Result<()> {
//! use smartoj_sync::{
//!     broker::LocalBroker, checkpoint::MemoryPositionStore, directory::MemoryDirectory,
//!     events::ProgressNotifier, handlers::HandlerRegistry, index::MemoryIndex,
//!     notification_store::MemoryNotificationStore, pipeline::Pipeline, reader::ReplaySource,
//! };
//! use std::sync::Arc;
//!
//! let handlers = HandlerRegistry::new(
//!     Arc::new(MemoryIndex::new()),
//!     Arc::new(MemoryDirectory::new()),
//!     Arc::new(MemoryNotificationStore::new()),
//! );
//! let broker = Arc::new(LocalBroker::start(handlers, 1, 1024, Default::default()));
//! let mut pipeline = Pipeline::new(
//!     Box::new(ReplaySource::new(Vec::new())),
//!     Arc::new(MemoryPositionStore::new()),
//!     broker,
//!     ProgressNotifier::new("example"),
//! );
//! pipeline.start().await?;
//! let exit = pipeline.wait().await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod checkpoint;
pub mod config;
pub mod credential;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod events;
pub mod handlers;
pub mod index;
pub mod mysql;
pub mod normalizer;
pub mod notification_store;
pub mod pipeline;
pub mod queue;
pub mod reader;
pub mod registry;

pub use broker::{Job, TaskBroker};
pub use checkpoint::{Checkpoint, PositionStore};
pub use config::SyncConfig;
pub use error::{ErrorCategory, Result, SyncError};
pub use event::{Action, Batch, BinlogPosition, ChangeRecord, Row, Scalar};
pub use events::{ProgressEvent, ProgressKind, ProgressNotifier};
pub use handlers::{HandlerOutcome, HandlerRegistry};
pub use index::{IndexDocument, SearchIndex};
pub use pipeline::{Pipeline, PipelineExit, PipelineState};
pub use reader::{ChangeSource, ReaderExit, StreamReader};
pub use registry::{JobKind, KnownTable, Route};
