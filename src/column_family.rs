//! Column Family
//!
//! Descriptor and native handle for one logical keyspace partition.
//!
//! A descriptor is created detached (name + tuning). The owning State binds
//! it to the engine when it registers it, which allocates the native handle;
//! the State destroys it again when it closes.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::engine::{ColumnFamilyHandle, NativeEngine};
use crate::filter_policy::FilterPolicy;

/// Name of the column family every database has
pub const DEFAULT_COLUMN_FAMILY: &str = "default";

/// Tuning for one column family. Immutable once the descriptor is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnFamilyOptions {
    // -------------------------------------------------------------------------
    // Blob Storage
    // -------------------------------------------------------------------------
    /// Store large values in separate blob files
    pub enable_blob_files: bool,

    /// Values at least this large go to blob files
    pub min_blob_size: u64,

    /// Target size of each blob file
    pub blob_file_size: u64,

    /// Relocate live blobs out of old files during compaction
    pub enable_blob_garbage_collection: bool,

    // -------------------------------------------------------------------------
    // Block Table
    // -------------------------------------------------------------------------
    /// Uncompressed size of a data block
    pub table_block_size: u64,

    /// Keep index and filter blocks in the block cache
    pub table_cache_index_and_filter_blocks: bool,

    pub table_format_version: u32,

    pub optimize_filters_for_memory: bool,

    pub no_block_cache: bool,

    pub filter_policy: FilterPolicy,
}

impl Default for ColumnFamilyOptions {
    fn default() -> Self {
        Self {
            enable_blob_files: false,
            min_blob_size: 0,
            blob_file_size: 0,
            enable_blob_garbage_collection: true,
            table_block_size: 8192,
            table_cache_index_and_filter_blocks: true,
            table_format_version: 6,
            optimize_filters_for_memory: false,
            no_block_cache: false,
            filter_policy: FilterPolicy::default(),
        }
    }
}

/// Column family descriptor
///
/// Cheap to clone; clones refer to the same descriptor and native handle.
#[derive(Clone)]
pub struct ColumnFamily {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    options: ColumnFamilyOptions,
    native: Mutex<Native>,
}

enum Native {
    Detached,
    Bound {
        engine: Arc<dyn NativeEngine>,
        handle: ColumnFamilyHandle,
    },
    Destroyed,
}

impl ColumnFamily {
    /// Create a detached descriptor
    pub fn new(name: impl Into<String>, options: ColumnFamilyOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                options,
                native: Mutex::new(Native::Detached),
            }),
        }
    }

    /// Create a detached descriptor with default tuning
    pub fn with_name(name: impl Into<String>) -> Self {
        Self::new(name, ColumnFamilyOptions::default())
    }

    /// New descriptor with the same tuning under a different name
    ///
    /// The clone is detached: it gets its own native handle when bound.
    pub fn clone_settings(&self, name: impl Into<String>) -> Self {
        Self::new(name, self.inner.options.clone())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &ColumnFamilyOptions {
        &self.inner.options
    }

    /// Native handle, if the descriptor is currently bound
    pub fn handle(&self) -> Option<ColumnFamilyHandle> {
        match &*self.inner.native.lock() {
            Native::Bound { handle, .. } => Some(*handle),
            _ => None,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(&*self.inner.native.lock(), Native::Destroyed)
    }

    /// True if both values refer to the same descriptor
    pub fn same_as(&self, other: &ColumnFamily) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Allocate the native handle, or return the one already allocated
    pub(crate) fn bind(&self, engine: &Arc<dyn NativeEngine>) -> ColumnFamilyHandle {
        let mut native = self.inner.native.lock();

        if let Native::Bound { handle, .. } = &*native {
            return *handle;
        }

        let handle = engine.column_family_init(&self.inner.name, &self.inner.options);
        *native = Native::Bound {
            engine: Arc::clone(engine),
            handle,
        };

        handle
    }

    /// Release the native handle. No-op if never bound or already destroyed.
    pub fn destroy(&self) {
        let mut native = self.inner.native.lock();

        match std::mem::replace(&mut *native, Native::Destroyed) {
            Native::Bound { engine, handle } => {
                engine.column_family_destroy(handle);
                tracing::trace!(name = %self.inner.name, "column family destroyed");
            }
            Native::Detached => *native = Native::Detached,
            Native::Destroyed => {}
        }
    }
}

impl fmt::Debug for ColumnFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnFamily")
            .field("name", &self.inner.name)
            .field("handle", &self.handle())
            .finish()
    }
}

/// How a caller names a column family: by name or by descriptor
#[derive(Debug, Clone)]
pub enum ColumnFamilyRef {
    Name(String),
    Family(ColumnFamily),
}

impl ColumnFamilyRef {
    pub fn name(&self) -> &str {
        match self {
            ColumnFamilyRef::Name(name) => name,
            ColumnFamilyRef::Family(family) => family.name(),
        }
    }
}

impl From<&str> for ColumnFamilyRef {
    fn from(name: &str) -> Self {
        ColumnFamilyRef::Name(name.to_string())
    }
}

impl From<String> for ColumnFamilyRef {
    fn from(name: String) -> Self {
        ColumnFamilyRef::Name(name)
    }
}

impl From<ColumnFamily> for ColumnFamilyRef {
    fn from(family: ColumnFamily) -> Self {
        ColumnFamilyRef::Family(family)
    }
}

impl From<&ColumnFamily> for ColumnFamilyRef {
    fn from(family: &ColumnFamily) -> Self {
        ColumnFamilyRef::Family(family.clone())
    }
}
