//! # stratabd
//!
//! An on-demand container image data plane:
//! - LSMT layered block engine (immutable layers + one writable top)
//! - Interval indexes with punch-and-insert splitting
//! - Full-file cache pool with watermark-driven LRU eviction
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     LayerStack                               │
//! │              (one RW over K sealed layers)                   │
//! └───────────┬───────────────────────────────┬─────────────────┘
//!             │                               │
//! ┌───────────▼───────────┐       ┌───────────▼────────────┐
//! │      ComboIndex       │       │      Data Logs         │
//! │ (Index0 over merged)  │       │  (append / sparse)     │
//! └───────────────────────┘       └───────────┬────────────┘
//!                                             │
//!                                 ┌───────────▼────────────┐
//!                                 │      CachePool         │
//!                                 │ (keyed stores + LRU)   │
//!                                 └────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod index;
pub mod layer;
pub mod cache;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, StrataError};
pub use config::Config;

pub use index::{Index, Index0, LevelIndex, Segment, SegmentIndex, SegmentMapping};
pub use layer::{
    create_file_rw, merge_files_ro, open_file_ro, open_file_rw, stack_files, CreateArgs,
    LayerStack, RoLayer, RwLayer,
};
pub use cache::{CachePool, CacheStore};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of stratabd
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
