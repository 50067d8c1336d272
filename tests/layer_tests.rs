//! Tests for layer files
//!
//! These tests verify:
//! - Create / write / read on the RW layer, append and sparse layouts
//! - Commit round-trips and in-place sealing
//! - Index trailer group commit and reload on reopen
//! - Stacked reads with top-wins resolution and RMW writes
//! - Offline merge of sealed layers
//! - Corruption and state errors on open

use std::path::{Path, PathBuf};

use stratabd::error::StrataError;
use stratabd::index::{Segment, SegmentIndex, ALIGNMENT};
use stratabd::layer::{
    create_file_rw, merge_files_ro, open_file_ro, open_file_rw, stack_files, CreateArgs, RwLayer,
};
use tempfile::TempDir;

const KB: u64 = 1024;
const VSIZE: u64 = 1024 * KB;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup() -> (TempDir, PathBuf) {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("layer.strata");
    (temp, path)
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

fn read_all(read: impl Fn(&mut [u8], u64) -> stratabd::Result<usize>, len: usize, offset: u64) -> Vec<u8> {
    let mut buf = vec![0xAAu8; len];
    let n = read(&mut buf, offset).unwrap();
    buf.truncate(n);
    buf
}

fn new_layer(path: &Path) -> RwLayer {
    create_file_rw(path, &CreateArgs::new(VSIZE)).unwrap()
}

// =============================================================================
// RW Layer Basics
// =============================================================================

#[test]
fn test_create_write_read() {
    let (_temp, path) = setup();
    let layer = new_layer(&path);

    let data = pattern(8 * KB as usize, 1);
    layer.pwrite(&data, 0).unwrap();

    assert_eq!(read_all(|b, o| layer.pread(b, o), data.len(), 0), data);
}

#[test]
fn test_holes_read_as_zeros() {
    let (_temp, path) = setup();
    let layer = new_layer(&path);

    let data = pattern(4 * KB as usize, 2);
    layer.pwrite(&data, 16 * KB).unwrap();

    let got = read_all(|b, o| layer.pread(b, o), 24 * KB as usize, 0);
    assert_eq!(&got[..16 * KB as usize], &vec![0u8; 16 * KB as usize][..]);
    assert_eq!(&got[16 * KB as usize..20 * KB as usize], &data[..]);
    assert_eq!(&got[20 * KB as usize..], &vec![0u8; 4 * KB as usize][..]);
}

#[test]
fn test_overwrite_wins() {
    let (_temp, path) = setup();
    let layer = new_layer(&path);

    let old = pattern(8 * KB as usize, 3);
    let new = pattern(4 * KB as usize, 4);
    layer.pwrite(&old, 0).unwrap();
    layer.pwrite(&new, 4 * KB).unwrap();

    let got = read_all(|b, o| layer.pread(b, o), 8 * KB as usize, 0);
    assert_eq!(&got[..4 * KB as usize], &old[..4 * KB as usize]);
    assert_eq!(&got[4 * KB as usize..], &new[..]);
}

#[test]
fn test_unaligned_write_rejected() {
    let (_temp, path) = setup();
    let layer = new_layer(&path);

    let r = layer.pwrite(&[0u8; 512], 100);
    assert!(matches!(r, Err(StrataError::InvalidArgument(_))));
    let r = layer.pwrite(&[0u8; 100], 0);
    assert!(matches!(r, Err(StrataError::InvalidArgument(_))));
}

#[test]
fn test_write_beyond_virtual_size_rejected() {
    let (_temp, path) = setup();
    let layer = new_layer(&path);

    let r = layer.pwrite(&[0u8; 1024], VSIZE - 512);
    assert!(matches!(r, Err(StrataError::InvalidArgument(_))));
}

#[test]
fn test_read_clipped_to_virtual_size() {
    let (_temp, path) = setup();
    let layer = new_layer(&path);

    let mut buf = vec![0u8; 8 * KB as usize];
    let n = layer.pread(&mut buf, VSIZE - 4 * KB).unwrap();
    assert_eq!(n, 4 * KB as usize);
}

#[test]
fn test_max_io_size_split() {
    let (_temp, path) = setup();
    let layer = new_layer(&path);
    layer.set_max_io_size(4096).unwrap();
    assert!(layer.set_max_io_size(511 * 1024 as usize).is_err());

    let data = pattern(64 * KB as usize, 5);
    layer.pwrite(&data, 8 * KB).unwrap();
    assert_eq!(
        read_all(|b, o| layer.pread(b, o), data.len(), 8 * KB),
        data
    );
}

#[test]
fn test_configure_from_config() {
    let (_temp, path) = setup();
    let layer = new_layer(&path);

    let config = stratabd::Config {
        max_io_size: 64 * 1024,
        index_group_commit: 4,
        ..Default::default()
    };
    layer.configure(&config).unwrap();
    assert_eq!(layer.max_io_size(), 64 * 1024);

    let bad = stratabd::Config {
        max_io_size: 1000,
        ..Default::default()
    };
    assert!(layer.configure(&bad).is_err());
}

#[test]
fn test_data_stat_counts_garbage() {
    let (_temp, path) = setup();
    let layer = new_layer(&path);

    let data = pattern(8 * KB as usize, 6);
    layer.pwrite(&data, 0).unwrap();
    layer.pwrite(&data, 0).unwrap();

    let stat = layer.data_stat();
    assert_eq!(stat.total_data_size, 16 * KB);
    assert_eq!(stat.valid_data_size, 8 * KB);
}

// =============================================================================
// Group Commit and Reopen
// =============================================================================

#[test]
fn test_index_survives_reopen() {
    let (_temp, path) = setup();
    let data = pattern(4 * KB as usize, 7);
    {
        let layer = new_layer(&path);
        layer.set_index_group_commit(1);
        layer.pwrite(&data, 0).unwrap();
        layer.pwrite(&data, 64 * KB).unwrap();
        // dropped without sealing; the trailer was flushed per insert
    }

    let layer = open_file_rw(&path).unwrap();
    assert_eq!(read_all(|b, o| layer.pread(b, o), data.len(), 0), data);
    assert_eq!(
        read_all(|b, o| layer.pread(b, o), data.len(), 64 * KB),
        data
    );

    // Appending keeps working after the trailer was truncated away.
    let more = pattern(4 * KB as usize, 8);
    layer.pwrite(&more, 8 * KB).unwrap();
    assert_eq!(
        read_all(|b, o| layer.pread(b, o), more.len(), 8 * KB),
        more
    );
}

#[test]
fn test_sync_persists_index() {
    let (_temp, path) = setup();
    let data = pattern(4 * KB as usize, 9);
    {
        let layer = new_layer(&path);
        layer.pwrite(&data, 0).unwrap();
        layer.sync().unwrap();
    }
    let layer = open_file_rw(&path).unwrap();
    assert_eq!(read_all(|b, o| layer.pread(b, o), data.len(), 0), data);
}

// =============================================================================
// Commit and Seal
// =============================================================================

#[test]
fn test_commit_round_trip() {
    let (temp, path) = setup();
    let layer = new_layer(&path);

    let a = pattern(8 * KB as usize, 10);
    let b = pattern(4 * KB as usize, 11);
    layer.pwrite(&a, 0).unwrap();
    layer.pwrite(&b, 4 * KB).unwrap();
    layer.pwrite(&a, 128 * KB).unwrap();

    let source_dump = {
        let index = layer.index().read();
        let mut d = index.dump_top();
        stratabd::index::compress_raw_index(&mut d);
        d
    };

    let dst = temp.path().join("committed.strata");
    layer.commit(&dst).unwrap();

    let ro = open_file_ro(&dst).unwrap();
    assert_eq!(ro.virtual_size(), VSIZE);
    assert_eq!(ro.uuid(), layer.uuid());

    // The committed index matches the source dump up to moffset rewriting.
    let committed = ro.index().buffer();
    assert_eq!(committed.len(), source_dump.len());
    for (c, s) in committed.iter().zip(&source_dump) {
        assert_eq!((c.offset, c.length, c.zeroed), (s.offset, s.length, s.zeroed));
    }

    // Byte-for-byte equality over the whole device.
    let from_rw = read_all(|b, o| layer.pread(b, o), VSIZE as usize, 0);
    let from_ro = read_all(|b, o| ro.pread(b, o), VSIZE as usize, 0);
    assert_eq!(from_rw, from_ro);
}

#[test]
fn test_close_seal_in_place() {
    let (_temp, path) = setup();
    let layer = new_layer(&path);

    let data = pattern(16 * KB as usize, 12);
    layer.pwrite(&data, 32 * KB).unwrap();

    let ro = layer.close_seal().unwrap();
    assert_eq!(
        read_all(|b, o| ro.pread(b, o), data.len(), 32 * KB),
        data
    );

    // The sealed file reopens read-only, not writable.
    let reopened = open_file_ro(&path).unwrap();
    assert_eq!(
        read_all(|b, o| reopened.pread(b, o), data.len(), 32 * KB),
        data
    );
    assert!(matches!(
        open_file_rw(&path),
        Err(StrataError::State(_))
    ));
}

#[test]
fn test_open_ro_rejects_unsealed() {
    let (_temp, path) = setup();
    let _layer = new_layer(&path);
    assert!(matches!(open_file_ro(&path), Err(StrataError::State(_))));
}

#[test]
fn test_open_rejects_garbage() {
    let (_temp, path) = setup();
    std::fs::write(&path, vec![0x5Au8; 8192]).unwrap();
    assert!(matches!(
        open_file_ro(&path),
        Err(StrataError::Corrupt(_))
    ));
}

// =============================================================================
// Sparse Layout
// =============================================================================

#[test]
fn test_sparse_moffset_equals_offset() {
    let (_temp, path) = setup();
    let layer = create_file_rw(&path, &CreateArgs::new(VSIZE).sparse(true)).unwrap();

    let data = pattern(4 * KB as usize, 13);
    layer.pwrite(&data, 16 * KB).unwrap();
    layer.pwrite(&data, 256 * KB).unwrap();

    for m in layer.index().read().dump_top() {
        assert_eq!(m.moffset, m.offset);
    }
    assert_eq!(
        read_all(|b, o| layer.pread(b, o), data.len(), 16 * KB),
        data
    );
}

#[test]
fn test_sparse_seal_and_commit() {
    let (temp, path) = setup();
    let layer = create_file_rw(&path, &CreateArgs::new(VSIZE).sparse(true)).unwrap();

    let data = pattern(8 * KB as usize, 14);
    layer.pwrite(&data, 64 * KB).unwrap();

    // Commit produces an append-packed copy.
    let dst = temp.path().join("packed.strata");
    layer.commit(&dst).unwrap();
    let packed = open_file_ro(&dst).unwrap();
    assert_eq!(
        read_all(|b, o| packed.pread(b, o), data.len(), 64 * KB),
        data
    );
    let packed_len = std::fs::metadata(&dst).unwrap().len();

    // Sealing in place keeps the sparse layout.
    let sealed = layer.close_seal().unwrap();
    assert_eq!(
        read_all(|b, o| sealed.pread(b, o), data.len(), 64 * KB),
        data
    );
    assert!(packed_len < std::fs::metadata(&path).unwrap().len());
}

// =============================================================================
// Stacked View
// =============================================================================

fn commit_layer(dir: &Path, name: &str, writes: &[(u64, u8, usize)]) -> PathBuf {
    let tmp = dir.join(format!("{}.rw", name));
    let layer = create_file_rw(&tmp, &CreateArgs::new(VSIZE)).unwrap();
    for &(offset, seed, len) in writes {
        layer.pwrite(&pattern(len, seed), offset).unwrap();
    }
    let dst = dir.join(name);
    layer.commit(&dst).unwrap();
    dst
}

#[test]
fn test_stack_reads_topmost() {
    let (temp, path) = setup();
    let base = commit_layer(
        temp.path(),
        "base.strata",
        &[(0, 20, 8 * KB as usize), (16 * KB, 21, 8 * KB as usize)],
    );
    let mid = commit_layer(temp.path(), "mid.strata", &[(4 * KB, 22, 8 * KB as usize)]);

    let ro_base = open_file_ro(&base).unwrap();
    let ro_mid = open_file_ro(&mid).unwrap();
    let rw = new_layer(&path);
    let stack = stack_files(rw, vec![ro_mid, ro_base], false).unwrap();

    let got = read_all(|b, o| stack.pread(b, o), 24 * KB as usize, 0);
    let base_a = pattern(8 * KB as usize, 20);
    let base_b = pattern(8 * KB as usize, 21);
    let mid_c = pattern(8 * KB as usize, 22);

    assert_eq!(&got[..4 * KB as usize], &base_a[..4 * KB as usize]);
    assert_eq!(&got[4 * KB as usize..12 * KB as usize], &mid_c[..]);
    assert_eq!(
        &got[12 * KB as usize..16 * KB as usize],
        &vec![0u8; 4 * KB as usize][..]
    );
    assert_eq!(&got[16 * KB as usize..], &base_b[..]);

    // A write through the stack shadows everything below.
    let top = pattern(4 * KB as usize, 23);
    stack.pwrite(&top, 2 * KB).unwrap();
    let got = read_all(|b, o| stack.pread(b, o), 8 * KB as usize, 0);
    assert_eq!(&got[..2 * KB as usize], &base_a[..2 * KB as usize]);
    assert_eq!(&got[2 * KB as usize..6 * KB as usize], &top[..]);
}

#[test]
fn test_stack_unaligned_rmw() {
    let (temp, path) = setup();
    let base = commit_layer(temp.path(), "base.strata", &[(0, 30, 8 * KB as usize)]);
    let ro = open_file_ro(&base).unwrap();
    let stack = stack_files(new_layer(&path), vec![ro], false).unwrap();

    let patch = pattern(1000, 31);
    stack.pwrite(&patch, 100).unwrap();

    let got = read_all(|b, o| stack.pread(b, o), 2 * KB as usize, 0);
    let base_a = pattern(8 * KB as usize, 30);
    assert_eq!(&got[..100], &base_a[..100]);
    assert_eq!(&got[100..1100], &patch[..]);
    assert_eq!(&got[1100..], &base_a[1100..2 * KB as usize]);
}

#[test]
fn test_stack_order_check() {
    let (temp, path) = setup();
    let base = commit_layer(temp.path(), "base.strata", &[(0, 40, 4 * KB as usize)]);
    let ro = open_file_ro(&base).unwrap();

    // Parent chain mismatch is rejected when order checking is on.
    let rw = create_file_rw(
        &path,
        &CreateArgs::new(VSIZE).parent(uuid::Uuid::new_v4()),
    )
    .unwrap();
    assert!(matches!(
        stack_files(rw, vec![ro], true),
        Err(StrataError::InvalidArgument(_))
    ));

    // A matching chain stacks fine.
    let ro = open_file_ro(&base).unwrap();
    let rw = create_file_rw(
        &temp.path().join("upper2.strata"),
        &CreateArgs::new(VSIZE).parent(ro.uuid()),
    )
    .unwrap();
    assert!(stack_files(rw, vec![ro], true).is_ok());
}

#[test]
fn test_stack_replace_lower_layers() {
    let (temp, path) = setup();
    let base = commit_layer(temp.path(), "base.strata", &[(0, 50, 4 * KB as usize)]);
    let other = commit_layer(temp.path(), "other.strata", &[(0, 51, 4 * KB as usize)]);

    let mut stack = stack_files(
        new_layer(&path),
        vec![open_file_ro(&base).unwrap()],
        false,
    )
    .unwrap();
    let got = read_all(|b, o| stack.pread(b, o), 4 * KB as usize, 0);
    assert_eq!(got, pattern(4 * KB as usize, 50));

    stack
        .replace_lower_layers(vec![open_file_ro(&other).unwrap()])
        .unwrap();
    let got = read_all(|b, o| stack.pread(b, o), 4 * KB as usize, 0);
    assert_eq!(got, pattern(4 * KB as usize, 51));
}

// =============================================================================
// Offline Merge
// =============================================================================

#[test]
fn test_merge_files_ro() {
    let (temp, path) = setup();
    let bottom = commit_layer(
        temp.path(),
        "bottom.strata",
        &[(0, 60, 8 * KB as usize), (32 * KB, 61, 4 * KB as usize)],
    );
    let top = commit_layer(temp.path(), "top.strata", &[(4 * KB, 62, 8 * KB as usize)]);

    let merged_path = temp.path().join("merged.strata");
    merge_files_ro(
        &[open_file_ro(&top).unwrap(), open_file_ro(&bottom).unwrap()],
        &merged_path,
    )
    .unwrap();

    // The merged layer reads exactly like the stacked pair.
    let stack = stack_files(
        new_layer(&path),
        vec![open_file_ro(&top).unwrap(), open_file_ro(&bottom).unwrap()],
        false,
    )
    .unwrap();
    let merged = open_file_ro(&merged_path).unwrap();

    let want = read_all(|b, o| stack.pread(b, o), 64 * KB as usize, 0);
    let got = read_all(|b, o| merged.pread(b, o), 64 * KB as usize, 0);
    assert_eq!(got, want);

    // Tags are gone: the output is a single flat layer.
    assert!(merged.index().buffer().iter().all(|m| m.tag == 0));
    assert!(merged
        .index()
        .lookup(Segment::new(0, (VSIZE / ALIGNMENT) as u32))
        .iter()
        .all(|m| m.tag == 0));
}
