//! Layer File Module
//!
//! File abstractions over the interval index: immutable read-only layers,
//! a single-writer read/write layer with an append-only data log, and the
//! stacked view presenting one unified block device.
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header (4096 bytes)                                          │
//! │   Magic "STRATABD" (8) | Version (4) | Flags (4)             │
//! │   UUID (16) | ParentUUID (16) | VirtualSize (8)              │
//! │   DataOffset (8) | IndexOffset (8) | IndexCount (8)          │
//! │   RecordSize (4) | IndexCrc (4) | Reserved                   │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Data Log (variable)                                          │
//! │   extents addressed by moffset, in 512-byte sectors          │
//! │   (sparse layout: extent lives at its logical offset)        │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Index Trailer (IndexCount × 24 bytes)                        │
//! │   [Offset: u64][MOffset: u64][Length: u32][Zeroed][Tag][Pad] │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod header;
mod ro;
mod rw;
mod stack;

pub use header::{Header, FLAG_CHECKSUM, FLAG_SEALED, FLAG_SPARSE, FLAG_ZFILE};
pub use ro::{open_file_ro, RoLayer};
pub use rw::{create_file_rw, open_file_rw, CreateArgs, DataStat, RwLayer};
pub use stack::{merge_files_ro, stack_files, LayerStack};

/// Max number of read-only layers under one stack
pub const MAX_STACK_LAYERS: usize = 255;
