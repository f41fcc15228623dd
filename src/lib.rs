//! # AtlasKV Native
//!
//! An async binding layer over an embedded key-value engine with:
//! - Batched reads and atomic batched writes, one native call per flush
//! - Chunked range iteration with limits, reverse order and keys-only mode
//! - Column families and reference-counted snapshots
//! - Coordinated suspend/resume that gates every operation
//! - Close that waits for in-flight I/O and open handles
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Database (sessions)                         │
//! │       root ── column_family() ── snapshot() ── session()    │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!        ┌──────────────┼───────────────┐
//!        ▼              ▼               ▼
//!  ┌───────────┐  ┌───────────┐  ┌─────────────┐
//!  │ ReadBatch │  │WriteBatch │  │ DbIterator  │
//!  └─────┬─────┘  └─────┬─────┘  └──────┬──────┘
//!        │   pooled     │               │
//!        └──────┬───────┘               │
//!               ▼                       ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         State                                │
//! │   open/close · suspend/resume gate · io + handle counters   │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  NativeEngine (trait)                        │
//! │              MemoryEngine (bundled binding)                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod engine;
pub mod refcounter;
pub mod filter_policy;
pub mod column_family;
pub mod snapshot;
pub mod codec;

mod pool;
pub mod batch;
pub mod iterator;

pub mod state;
pub mod registry;
pub mod session;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{AtlasError, Result};
pub use config::{DatabaseOptions, DatabaseOptionsBuilder, EngineOptions};

pub use engine::{MemoryEngine, NativeEngine, SizeOptions};
pub use refcounter::{RefCounter, RefGuard};
pub use filter_policy::FilterPolicy;
pub use column_family::{ColumnFamily, ColumnFamilyOptions, ColumnFamilyRef, DEFAULT_COLUMN_FAMILY};
pub use snapshot::Snapshot;
pub use codec::{Codec, Prefixed, Raw};

pub use batch::{BatchOptions, Pending, ReadBatch, WriteBatch};
pub use iterator::{DbIterator, Entry, IteratorOptions, RangeOptions};

pub use state::{Phase, State};
pub use registry::Registry;
pub use session::{
    ApproximateSizeOptions, CompactRangeOptions, Database, FlushOptions, SessionOptions,
};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of AtlasKV Native
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
