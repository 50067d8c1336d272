//! Read/write layer
//!
//! The single mutable layer of a stack. Writes append to the data log (or
//! land at their logical offset in sparse mode) and then update the in-memory
//! write index; the index trailer is persisted in groups and reloaded on
//! open. A finished layer either `commit`s to a fresh compacted file or
//! `close_seal`s in place.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{Result, StrataError};
use crate::index::{
    compress_raw_index, foreach_segments, ComboIndex, Index0, LevelIndex, Segment, SegmentMapping,
    ALIGNMENT,
};

use super::header::{
    decode_record, encode_record, Header, FLAG_CHECKSUM, FLAG_SEALED, FLAG_SPARSE, HEADER_SIZE,
    RECORD_SIZE,
};
use super::ro::{check_aligned, RoLayer};

/// Granularity required of `max_io_size`
const IO_SIZE_ALIGNMENT: usize = 4096;

/// Default split size for a single read/write operation
pub const DEFAULT_MAX_IO_SIZE: usize = 512 * 1024;

/// Default number of index inserts per trailer persistence
pub const DEFAULT_INDEX_GROUP_COMMIT: usize = 32;

/// Arguments for creating a fresh writable layer
#[derive(Debug, Clone)]
pub struct CreateArgs {
    pub virtual_size: u64,
    pub uuid: Uuid,
    pub parent_uuid: Uuid,
    /// Lay data out at its logical offset in a sparse file instead of
    /// append-packing the log
    pub sparse: bool,
}

impl CreateArgs {
    pub fn new(virtual_size: u64) -> Self {
        CreateArgs {
            virtual_size,
            uuid: Uuid::new_v4(),
            parent_uuid: Uuid::nil(),
            sparse: false,
        }
    }

    pub fn sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    pub fn parent(mut self, parent: Uuid) -> Self {
        self.parent_uuid = parent;
        self
    }
}

/// Data usage of the top RW layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataStat {
    /// Bytes ever appended to the data log, garbage included
    pub total_data_size: u64,
    /// Bytes reachable through the index
    pub valid_data_size: u64,
}

/// Create a new writable layer file at `path`
pub fn create_file_rw(path: &Path, args: &CreateArgs) -> Result<RwLayer> {
    if args.virtual_size == 0 || args.virtual_size % ALIGNMENT != 0 {
        return Err(StrataError::invalid(format!(
            "virtual_size must be a positive multiple of {}: {}",
            ALIGNMENT, args.virtual_size
        )));
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;

    let mut flags = FLAG_CHECKSUM;
    if args.sparse {
        flags |= FLAG_SPARSE;
    }
    let header = Header::new(args.virtual_size, args.uuid, args.parent_uuid, flags);
    file.write_all_at(&header.encode(), 0)?;
    if args.sparse {
        // Reserve the logical layout; holes stay unallocated.
        file.set_len(header.data_offset + args.virtual_size)?;
    }
    file.sync_all()?;

    Ok(RwLayer::new(file, header, Index0::new(), 0, 0))
}

/// Open an unsealed layer file, reloading its persisted index trailer
pub fn open_file_rw(path: &Path) -> Result<RwLayer> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut head = vec![0u8; HEADER_SIZE as usize];
    file.read_exact_at(&mut head, 0)?;
    let header = Header::decode(&head)?;

    if header.is_sealed() {
        return Err(StrataError::state(
            "layer file is sealed; open it read-only",
        ));
    }

    // Reload the trailer, then truncate it away so appending can resume
    // from the data tail.
    let mut index = Index0::new();
    let mut append_sectors;
    if header.index_offset != 0 {
        let nbytes = header.index_count * RECORD_SIZE as u64;
        let mut raw = vec![0u8; nbytes as usize];
        file.read_exact_at(&mut raw, header.index_offset)?;
        if header.has_checksum() && crc32fast::hash(&raw) != header.index_crc {
            return Err(StrataError::corrupt("index trailer checksum mismatch"));
        }
        for rec in raw.chunks_exact(RECORD_SIZE as usize) {
            index.insert(decode_record(rec)?);
        }
        append_sectors = (header.index_offset - header.data_offset) / ALIGNMENT;
        file.set_len(header.index_offset)?;
    } else {
        let len = file.metadata()?.len();
        append_sectors = len.saturating_sub(header.data_offset) / ALIGNMENT;
    }
    if header.is_sparse() {
        append_sectors = 0;
        file.set_len(header.data_offset + header.virtual_size)?;
    }

    let total = append_sectors * ALIGNMENT;
    Ok(RwLayer::new(file, header, index, append_sectors, total))
}

struct Writer {
    header: Header,
    /// Next free sector of the data log (append mode)
    append_sectors: u64,
    /// Bytes appended over the layer's lifetime
    total_written: u64,
    /// Index inserts since the trailer was last persisted
    dirty_inserts: usize,
}

/// The mutable top layer
pub struct RwLayer {
    file: File,
    index: RwLock<ComboIndex>,
    writer: Mutex<Writer>,
    virtual_size: u64,
    data_offset: u64,
    uuid: Uuid,
    parent_uuid: Uuid,
    sparse: bool,
    max_io_size: Mutex<usize>,
    group_commit: Mutex<usize>,
}

impl RwLayer {
    fn new(file: File, header: Header, index: Index0, append_sectors: u64, total: u64) -> Self {
        let virtual_size = header.virtual_size;
        let data_offset = header.data_offset;
        let uuid = header.uuid;
        let parent_uuid = header.parent_uuid;
        let sparse = header.is_sparse();
        RwLayer {
            file,
            index: RwLock::new(ComboIndex::new(index, Default::default())),
            writer: Mutex::new(Writer {
                header,
                append_sectors,
                total_written: total,
                dirty_inserts: 0,
            }),
            virtual_size,
            data_offset,
            uuid,
            parent_uuid,
            sparse,
            max_io_size: Mutex::new(DEFAULT_MAX_IO_SIZE),
            group_commit: Mutex::new(DEFAULT_INDEX_GROUP_COMMIT),
        }
    }

    pub fn virtual_size(&self) -> u64 {
        self.virtual_size
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn parent_uuid(&self) -> Uuid {
        self.parent_uuid
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse
    }

    /// The layered index; the backing half is populated once stacked
    pub fn index(&self) -> &RwLock<ComboIndex> {
        &self.index
    }

    /// Cap the size of a single split read/write operation
    pub fn set_max_io_size(&self, size: usize) -> Result<()> {
        if size == 0 || size % IO_SIZE_ALIGNMENT != 0 {
            return Err(StrataError::invalid(format!(
                "max_io_size must be a positive multiple of {}: {}",
                IO_SIZE_ALIGNMENT, size
            )));
        }
        *self.max_io_size.lock() = size;
        Ok(())
    }

    pub fn max_io_size(&self) -> usize {
        *self.max_io_size.lock()
    }

    /// Batch `n` index inserts per trailer persistence
    pub fn set_index_group_commit(&self, n: usize) {
        *self.group_commit.lock() = n.max(1);
    }

    /// Apply the engine knobs of a `Config`
    pub fn configure(&self, config: &crate::config::Config) -> Result<()> {
        self.set_max_io_size(config.max_io_size)?;
        self.set_index_group_commit(config.index_group_commit);
        Ok(())
    }

    /// Write `buf` at byte `offset`. Offset and length must be
    /// sector-aligned; unaligned tails are the stacked view's business.
    ///
    /// The data append happens before the index insert, so a failed append
    /// leaves the index untouched.
    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        check_aligned(offset, buf.len())?;
        if buf.is_empty() {
            return Ok(0);
        }
        if offset + buf.len() as u64 > self.virtual_size {
            return Err(StrataError::invalid(format!(
                "write [{}, {}) exceeds virtual size {}",
                offset,
                offset + buf.len() as u64,
                self.virtual_size
            )));
        }

        let max_io = self.max_io_size();
        let mut writer = self.writer.lock();
        let mut written = 0usize;
        while written < buf.len() {
            let n = (buf.len() - written).min(max_io);
            let chunk = &buf[written..written + n];
            let chunk_offset = offset + written as u64;
            self.append_chunk(&mut writer, chunk, chunk_offset)?;
            written += n;
        }
        Ok(written)
    }

    /// Append one sized chunk and publish its mapping
    fn append_chunk(&self, writer: &mut Writer, chunk: &[u8], offset: u64) -> Result<()> {
        let offset_sec = offset / ALIGNMENT;
        let len_sec = (chunk.len() as u64 / ALIGNMENT) as u32;
        let moffset = if self.sparse {
            offset_sec
        } else {
            writer.append_sectors
        };

        self.file
            .write_all_at(chunk, self.data_offset + moffset * ALIGNMENT)?;

        if !self.sparse {
            writer.append_sectors += len_sec as u64;
        }
        writer.total_written += chunk.len() as u64;

        self.index
            .write()
            .insert(SegmentMapping::new(offset_sec, len_sec, moffset));

        writer.dirty_inserts += 1;
        if writer.dirty_inserts >= *self.group_commit.lock() {
            self.flush_index(writer)?;
        }
        Ok(())
    }

    /// Read back through the layer's own index. Only valid while the layer
    /// is not stacked; backing hits are a state error here.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        check_aligned(offset, buf.len())?;
        let begin_sec = offset / ALIGNMENT;
        let want = (buf.len() as u64) / ALIGNMENT;
        let vend_sec = self.virtual_size / ALIGNMENT;
        let end_sec = (begin_sec + want).min(vend_sec);
        if begin_sec >= end_sec {
            return Ok(0);
        }

        buf.fill(0);
        let index = self.index.read();
        foreach_segments(
            &*index,
            Segment::new(begin_sec, (end_sec - begin_sec) as u32),
            vend_sec,
            |_| Ok(()),
            |m| {
                if m.zeroed {
                    return Ok(());
                }
                if m.tag != 0 {
                    return Err(StrataError::state(
                        "stacked mapping read through a bare layer",
                    ));
                }
                let at = ((m.offset - begin_sec) * ALIGNMENT) as usize;
                let len = (m.length as u64 * ALIGNMENT) as usize;
                self.read_extent(m, &mut buf[at..at + len])
            },
        )?;
        Ok(((end_sec - begin_sec) * ALIGNMENT) as usize)
    }

    pub(crate) fn read_extent(&self, m: &SegmentMapping, dst: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(dst, self.data_offset + m.moffset * ALIGNMENT)?;
        Ok(())
    }

    /// Persist the index trailer and sync the file
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        self.flush_index(&mut writer)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Rewrite the index trailer at the data tail and point the header at it
    fn flush_index(&self, writer: &mut Writer) -> Result<()> {
        let records = self.index.read().dump_top();
        let trailer_offset = self.data_end(writer);

        let mut raw = Vec::with_capacity(records.len() * RECORD_SIZE as usize);
        for m in &records {
            encode_record(m, &mut raw);
        }
        self.file.write_all_at(&raw, trailer_offset)?;
        self.file.set_len(trailer_offset + raw.len() as u64)?;
        self.file.sync_data()?;

        writer.header.index_offset = trailer_offset;
        writer.header.index_count = records.len() as u64;
        writer.header.index_crc = crc32fast::hash(&raw);
        self.file.write_all_at(&writer.header.encode(), 0)?;
        writer.dirty_inserts = 0;
        Ok(())
    }

    fn data_end(&self, writer: &Writer) -> u64 {
        if self.sparse {
            self.data_offset + self.virtual_size
        } else {
            self.data_offset + writer.append_sectors * ALIGNMENT
        }
    }

    /// Data usage of this layer
    pub fn data_stat(&self) -> DataStat {
        let writer = self.writer.lock();
        DataStat {
            total_data_size: writer.total_written,
            valid_data_size: self.index.read().block_count() * ALIGNMENT,
        }
    }

    /// Write a fresh sealed, append-packed copy of this layer to `dst`,
    /// dropping garbage extents and compacting the index.
    pub fn commit(&self, dst: &Path) -> Result<()> {
        let writer = self.writer.lock();

        let mut mappings = self.index.read().dump_top();
        compress_raw_index(&mut mappings);

        let out = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dst)?;

        let mut header = Header::new(
            self.virtual_size,
            writer.header.uuid,
            writer.header.parent_uuid,
            FLAG_SEALED | FLAG_CHECKSUM,
        );

        // Stream the live extents into the new data log in LBA order,
        // rewriting moffsets as we go.
        let mut cursor = 0u64;
        let mut committed = Vec::with_capacity(mappings.len());
        let mut copybuf = vec![0u8; self.max_io_size()];
        for m in &mappings {
            if m.zeroed {
                committed.push(SegmentMapping::zeroed(m.offset, m.length));
                continue;
            }
            copy_extent(
                &self.file,
                self.data_offset + m.moffset * ALIGNMENT,
                &out,
                header.data_offset + cursor * ALIGNMENT,
                m.length as u64 * ALIGNMENT,
                &mut copybuf,
            )?;
            committed.push(SegmentMapping::new(m.offset, m.length, cursor));
            cursor += m.length as u64;
        }
        drop(writer);

        write_sealed_index(&out, &mut header, cursor, &committed)?;
        out.sync_all()?;
        Ok(())
    }

    /// Seal in place: flush the compacted index trailer, mark the header
    /// sealed and hand back a read-only view over the same file.
    pub fn close_seal(self) -> Result<RoLayer> {
        let writer = self.writer.lock();

        let index = self.index.read().top().make_read_only_index();
        let mut header = writer.header.clone();

        let data_sectors = if self.sparse {
            self.virtual_size / ALIGNMENT
        } else {
            writer.append_sectors
        };
        write_sealed_index(&self.file, &mut header, data_sectors, index.buffer())?;
        self.file.sync_all()?;
        drop(writer);

        Ok(RoLayer::from_parts(
            self.file,
            header,
            LevelIndex::new(index),
        ))
    }
}

/// Copy `len` bytes between files through `buf`-sized chunks
fn copy_extent(
    src: &File,
    src_offset: u64,
    dst: &File,
    dst_offset: u64,
    len: u64,
    buf: &mut [u8],
) -> Result<()> {
    let mut done = 0u64;
    while done < len {
        let n = ((len - done) as usize).min(buf.len());
        src.read_exact_at(&mut buf[..n], src_offset + done)?;
        dst.write_all_at(&buf[..n], dst_offset + done)?;
        done += n as u64;
    }
    Ok(())
}

/// Write the index trailer after `data_sectors` of log and persist a sealed
/// header pointing at it. Shared by commit, close_seal and merge.
pub(super) fn write_sealed_index(
    file: &File,
    header: &mut Header,
    data_sectors: u64,
    mappings: &[SegmentMapping],
) -> Result<()> {
    let trailer_offset = header.data_offset + data_sectors * ALIGNMENT;
    let mut raw = Vec::with_capacity(mappings.len() * RECORD_SIZE as usize);
    for m in mappings {
        encode_record(m, &mut raw);
    }
    file.write_all_at(&raw, trailer_offset)?;
    file.set_len(trailer_offset + raw.len() as u64)?;

    header.flags |= FLAG_SEALED;
    header.index_offset = trailer_offset;
    header.index_count = mappings.len() as u64;
    header.index_crc = crc32fast::hash(&raw);
    file.write_all_at(&header.encode(), 0)?;
    Ok(())
}
