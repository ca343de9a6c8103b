//! # rostersync
//!
//! Incremental synchronization of an event's attendee directory into a durable
//! store, with field-level change history across runs.
//!
//! ## Usage
//!
//! ```bash
//! rostersync run [--resume] | resume [RUN] | status | check-token | prune-changes --older-than 90d
//! ```
//!
//! ## Modules
//!
//! - `api` - Remote directory API seam and the GraphQL client
//! - `lister` - Cursor pagination into one deduplicated roster
//! - `enricher` - Concurrent, rate-limited detail fetching with checkpoints
//! - `checkpoint` - Durable per-run enrichment progress
//! - `merger` - Idempotent upsert with change tracking and run finalization
//! - `storage` - Attendee store trait, backends and the writer lock
//! - `run` - Run directories, manifests and the run state machine
//! - `pipeline` - Sequencing, resume and interrupt cleanup
//! - `config` - TOML configuration with environment overrides
pub mod api;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod enricher;
pub mod error;
pub mod lister;
pub mod merger;
pub mod model;
pub mod pipeline;
pub mod retry;
pub mod run;
pub mod signals;
pub mod storage;

pub use error::{SyncError, SyncResult};
