//! Configuration for AtlasKV Native
//!
//! Centralized configuration with sensible defaults.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::column_family::{ColumnFamily, ColumnFamilyOptions, DEFAULT_COLUMN_FAMILY};
use crate::error::{AtlasError, Result};
use crate::filter_policy::FilterPolicy;
use crate::registry::Registry;

/// Knobs passed to the engine when the database instance is allocated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    // -------------------------------------------------------------------------
    // Open Behaviour
    // -------------------------------------------------------------------------
    /// Open without taking the write lock; every write is rejected
    pub read_only: bool,

    /// Create the database if the path holds none
    pub create_if_missing: bool,

    /// Create column families the database does not have yet
    pub create_missing_column_families: bool,

    // -------------------------------------------------------------------------
    // Background Work and I/O
    // -------------------------------------------------------------------------
    /// Thread budget for compactions and flushes
    pub max_background_jobs: u32,

    /// Sync written files incrementally every N bytes
    pub bytes_per_sync: u64,

    /// Cap on open table files (-1 = unlimited)
    pub max_open_files: i32,

    /// Bypass the OS page cache for reads
    pub use_direct_reads: bool,

    /// Bypass the OS page cache for flush and compaction I/O
    pub use_direct_io_for_flush_and_compaction: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            create_if_missing: true,
            create_missing_column_families: true,
            max_background_jobs: 6,
            bytes_per_sync: 1024 * 1024, // 1 MB
            max_open_files: -1,
            use_direct_reads: false,
            use_direct_io_for_flush_and_compaction: false,
        }
    }
}

/// Main configuration for a database
#[derive(Debug, Clone, Default)]
pub struct DatabaseOptions {
    /// Engine-level knobs
    pub engine: EngineOptions,

    /// Tuning used for the default column family and for column families
    /// named only by string
    pub column_family_options: ColumnFamilyOptions,

    /// Descriptor for the default column family (built from
    /// `column_family_options` when absent)
    pub default_column_family: Option<ColumnFamily>,

    /// Extra column families registered before open
    pub column_families: Vec<ColumnFamily>,

    /// Registry that tracks the database while it is open
    pub registry: Option<Arc<Registry>>,
}

impl DatabaseOptions {
    /// Create a new options builder
    pub fn builder() -> DatabaseOptionsBuilder {
        DatabaseOptionsBuilder::default()
    }

    /// Check the options for values the engine would reject
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_background_jobs == 0 {
            return Err(AtlasError::Config(
                "max_background_jobs must be at least 1".to_string(),
            ));
        }

        validate_column_family_options(&self.column_family_options)?;

        let mut names = HashSet::new();
        let default_name = self
            .default_column_family
            .as_ref()
            .map(|c| c.name())
            .unwrap_or(DEFAULT_COLUMN_FAMILY);
        names.insert(default_name);

        for family in &self.column_families {
            if family.name().is_empty() {
                return Err(AtlasError::Config(
                    "column family name must not be empty".to_string(),
                ));
            }
            if !names.insert(family.name()) {
                return Err(AtlasError::Config(format!(
                    "duplicate column family: {}",
                    family.name()
                )));
            }
            validate_column_family_options(family.options())?;
        }

        Ok(())
    }

    /// Descriptor for the default column family
    pub(crate) fn default_family(&self) -> ColumnFamily {
        self.default_column_family.clone().unwrap_or_else(|| {
            ColumnFamily::new(DEFAULT_COLUMN_FAMILY, self.column_family_options.clone())
        })
    }
}

fn validate_column_family_options(options: &ColumnFamilyOptions) -> Result<()> {
    let bits = options.filter_policy.bits_per_key();
    if !(bits > 0.0) {
        return Err(AtlasError::Config(format!(
            "filter bits per key must be positive, got {}",
            bits
        )));
    }
    if options.table_block_size == 0 {
        return Err(AtlasError::Config(
            "table_block_size must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Builder for DatabaseOptions
#[derive(Default)]
pub struct DatabaseOptionsBuilder {
    options: DatabaseOptions,
}

impl DatabaseOptionsBuilder {
    /// Open in read-only mode
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.options.engine.read_only = read_only;
        self
    }

    /// Create the database if missing
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.options.engine.create_if_missing = create;
        self
    }

    /// Create missing column families on open
    pub fn create_missing_column_families(mut self, create: bool) -> Self {
        self.options.engine.create_missing_column_families = create;
        self
    }

    /// Set the background job budget
    pub fn max_background_jobs(mut self, jobs: u32) -> Self {
        self.options.engine.max_background_jobs = jobs;
        self
    }

    /// Set the incremental sync granularity (in bytes)
    pub fn bytes_per_sync(mut self, bytes: u64) -> Self {
        self.options.engine.bytes_per_sync = bytes;
        self
    }

    /// Set the open file cap (-1 = unlimited)
    pub fn max_open_files(mut self, files: i32) -> Self {
        self.options.engine.max_open_files = files;
        self
    }

    pub fn use_direct_reads(mut self, enabled: bool) -> Self {
        self.options.engine.use_direct_reads = enabled;
        self
    }

    pub fn use_direct_io_for_flush_and_compaction(mut self, enabled: bool) -> Self {
        self.options.engine.use_direct_io_for_flush_and_compaction = enabled;
        self
    }

    /// Replace all engine-level knobs at once
    pub fn engine_options(mut self, engine: EngineOptions) -> Self {
        self.options.engine = engine;
        self
    }

    /// Tuning for the default and string-named column families
    pub fn column_family_options(mut self, options: ColumnFamilyOptions) -> Self {
        self.options.column_family_options = options;
        self
    }

    /// Block size for the default and string-named column families
    pub fn table_block_size(mut self, size: u64) -> Self {
        self.options.column_family_options.table_block_size = size;
        self
    }

    /// Filter policy for the default and string-named column families
    pub fn filter_policy(mut self, policy: FilterPolicy) -> Self {
        self.options.column_family_options.filter_policy = policy;
        self
    }

    /// Use a prepared descriptor as the default column family
    pub fn default_column_family(mut self, family: ColumnFamily) -> Self {
        self.options.default_column_family = Some(family);
        self
    }

    /// Register an extra column family
    pub fn column_family(mut self, family: ColumnFamily) -> Self {
        self.options.column_families.push(family);
        self
    }

    /// Register an extra column family by name, with the shared tuning
    pub fn column_family_named(mut self, name: impl Into<String>) -> Self {
        let family = ColumnFamily::new(name, self.options.column_family_options.clone());
        self.options.column_families.push(family);
        self
    }

    /// Track the database in `registry` while it is open
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.options.registry = Some(registry);
        self
    }

    pub fn build(self) -> DatabaseOptions {
        self.options
    }
}
