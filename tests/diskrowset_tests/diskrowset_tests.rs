//! Tests for DiskRowSet
//!
//! These tests verify:
//! - Writer produces a readable rowset and rejects bad input
//! - Base file checksum and structure validation on open
//! - Delta store persistence, torn-tail truncation, and corruption detection
//! - Visibility of base rows and deltas by snapshot
//! - Obsolete rowsets delete their directory once dropped

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tablet_store::diskrowset::{DiskRowSet, DiskRowSetWriter};
use tablet_store::rowset::RowSet;
use tablet_store::{
    BloomFilterSizing, ColumnSchema, DataType, DeltaSyncStrategy, MvccManager, RowBuilder,
    RowChangeList, RowChangeListEncoder, Schema, Timestamp,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_schema() -> Schema {
    Schema::new(
        vec![
            ColumnSchema::new("key", DataType::Int32),
            ColumnSchema::new("val", DataType::Int64),
        ],
        1,
    )
    .unwrap()
}

fn make_row(schema: &Schema, key: i32, val: i64) -> Vec<u8> {
    RowBuilder::new(schema).add(key).unwrap().add(val).unwrap().build().unwrap()
}

fn encoded_key(schema: &Schema, key: i32) -> Vec<u8> {
    let k = RowBuilder::key(schema).add(key).unwrap().build().unwrap();
    schema.encode_key(&k).unwrap()
}

fn set_val(schema: &Schema, val: i64) -> RowChangeList {
    RowChangeListEncoder::new(schema).update(1, val).unwrap().build().unwrap()
}

/// Write keys `0..count` (val = key * 10) at `insert_ts` into `rowset_{index}`
fn write_rowset(parent: &Path, schema: &Schema, index: u64, count: i32, insert_ts: Timestamp) -> PathBuf {
    let dir = parent.join(format!("rowset_{:06}", index));
    let mut writer =
        DiskRowSetWriter::new(&dir, index, schema.byte_size(), BloomFilterSizing::default()).unwrap();
    for key in 0..count {
        writer
            .add(&encoded_key(schema, key), insert_ts, &make_row(schema, key, i64::from(key) * 10))
            .unwrap();
    }
    let meta = writer.finish().unwrap();
    assert_eq!(meta.entry_count, count as u64);
    dir
}

fn open_rowset(dir: &Path, schema: &Schema) -> Arc<DiskRowSet> {
    Arc::new(DiskRowSet::open(dir, 1, schema.clone(), DeltaSyncStrategy::EveryWrite).unwrap())
}

fn scan_vals(rowset: &Arc<DiskRowSet>, mvcc: &MvccManager) -> Vec<(i32, i64)> {
    let schema = rowset.schema().clone();
    let mut iter = Arc::clone(rowset)
        .new_row_iterator(&schema, &mvcc.take_snapshot())
        .unwrap();
    iter.init().unwrap();
    iter.collect_rows()
        .unwrap()
        .iter()
        .map(|r| (schema.get::<i32>(r, 0).unwrap(), schema.get::<i64>(r, 1).unwrap()))
        .collect()
}

/// Committed timestamp to stamp base rows with
fn committed_ts(mvcc: &MvccManager) -> Timestamp {
    let ts = mvcc.begin_transaction();
    mvcc.commit_transaction(ts).unwrap();
    ts
}

// =============================================================================
// Writer Tests
// =============================================================================

#[test]
fn test_write_and_open() {
    let temp_dir = TempDir::new().unwrap();
    let mvcc = MvccManager::new();
    let schema = setup_schema();
    let dir = write_rowset(temp_dir.path(), &schema, 1, 100, committed_ts(&mvcc));

    assert!(dir.join("base.data").exists());
    assert!(dir.join("deltas.log").exists());

    let rowset = open_rowset(&dir, &schema);
    assert_eq!(rowset.base_row_count(), 100);
    assert_eq!(rowset.count_rows().unwrap(), 100);
    assert_eq!(rowset.num_deltas(), 0);
    assert_eq!(rowset.describe(), "DiskRowSet(1)");
    assert_eq!(rowset.durable_indices(), vec![1]);

    let (min, max) = rowset.key_bounds().unwrap();
    assert_eq!(min, encoded_key(&schema, 0));
    assert_eq!(max, encoded_key(&schema, 99));

    let rows = scan_vals(&rowset, &mvcc);
    assert_eq!(rows.len(), 100);
    assert_eq!(rows[42], (42, 420));
}

#[test]
fn test_writer_rejects_out_of_order_keys() {
    let temp_dir = TempDir::new().unwrap();
    let schema = setup_schema();
    let mut writer = DiskRowSetWriter::new(
        &temp_dir.path().join("rowset_000001"),
        1,
        schema.byte_size(),
        BloomFilterSizing::default(),
    )
    .unwrap();

    writer.add(&encoded_key(&schema, 5), Timestamp(1), &make_row(&schema, 5, 0)).unwrap();
    let err = writer
        .add(&encoded_key(&schema, 3), Timestamp(1), &make_row(&schema, 3, 0))
        .unwrap_err();
    assert!(err.is_invalid_argument());

    let err = writer
        .add(&encoded_key(&schema, 5), Timestamp(1), &make_row(&schema, 5, 0))
        .unwrap_err();
    assert!(err.is_invalid_argument());
    writer.abort();
}

#[test]
fn test_writer_rejects_wrong_row_width() {
    let temp_dir = TempDir::new().unwrap();
    let schema = setup_schema();
    let mut writer = DiskRowSetWriter::new(
        &temp_dir.path().join("rowset_000001"),
        1,
        schema.byte_size(),
        BloomFilterSizing::default(),
    )
    .unwrap();

    let err = writer.add(&encoded_key(&schema, 1), Timestamp(1), &[0u8; 4]).unwrap_err();
    assert!(err.is_invalid_argument());
}

#[test]
fn test_writer_refuses_existing_directory() {
    let temp_dir = TempDir::new().unwrap();
    let schema = setup_schema();
    let dir = write_rowset(temp_dir.path(), &schema, 1, 1, Timestamp(1));

    let err = DiskRowSetWriter::new(&dir, 1, schema.byte_size(), BloomFilterSizing::default())
        .unwrap_err();
    assert!(err.is_io_error());
}

#[test]
fn test_writer_abort_removes_directory() {
    let temp_dir = TempDir::new().unwrap();
    let schema = setup_schema();
    let dir = temp_dir.path().join("rowset_000007");
    let mut writer =
        DiskRowSetWriter::new(&dir, 7, schema.byte_size(), BloomFilterSizing::default()).unwrap();
    writer.add(&encoded_key(&schema, 1), Timestamp(1), &make_row(&schema, 1, 1)).unwrap();
    assert_eq!(writer.entry_count(), 1);
    assert!(writer.bytes_written() > 0);
    let shown = format!("{:?}", writer);
    assert!(shown.contains("index: 7"));
    assert!(shown.contains("entries: 1"));

    writer.abort();
    assert!(!dir.exists());
}

#[test]
fn test_empty_rowset() {
    let temp_dir = TempDir::new().unwrap();
    let mvcc = MvccManager::new();
    let schema = setup_schema();
    let dir = write_rowset(temp_dir.path(), &schema, 1, 0, Timestamp(1));

    let rowset = open_rowset(&dir, &schema);
    assert_eq!(rowset.count_rows().unwrap(), 0);
    assert!(rowset.key_bounds().is_none());
    assert!(scan_vals(&rowset, &mvcc).is_empty());
}

// =============================================================================
// Corruption Tests
// =============================================================================

#[test]
fn test_flipped_byte_is_corruption() {
    let temp_dir = TempDir::new().unwrap();
    let schema = setup_schema();
    let dir = write_rowset(temp_dir.path(), &schema, 1, 10, Timestamp(1));

    let base = dir.join("base.data");
    let mut data = fs::read(&base).unwrap();
    data[30] ^= 0xFF;
    fs::write(&base, &data).unwrap();

    let err = DiskRowSet::open(&dir, 1, schema, DeltaSyncStrategy::EveryWrite).unwrap_err();
    assert!(err.is_corruption());
}

#[test]
fn test_truncated_base_is_corruption() {
    let temp_dir = TempDir::new().unwrap();
    let schema = setup_schema();
    let dir = write_rowset(temp_dir.path(), &schema, 1, 10, Timestamp(1));

    let base = dir.join("base.data");
    let data = fs::read(&base).unwrap();
    fs::write(&base, &data[..data.len() - 5]).unwrap();

    let err = DiskRowSet::open(&dir, 1, schema, DeltaSyncStrategy::EveryWrite).unwrap_err();
    assert!(err.is_corruption());
}

#[test]
fn test_bad_magic_is_corruption() {
    let temp_dir = TempDir::new().unwrap();
    let schema = setup_schema();
    let dir = write_rowset(temp_dir.path(), &schema, 1, 3, Timestamp(1));

    let base = dir.join("base.data");
    let mut data = fs::read(&base).unwrap();
    data[0..4].copy_from_slice(b"XXXX");
    fs::write(&base, &data).unwrap();

    let err = DiskRowSet::open(&dir, 1, schema, DeltaSyncStrategy::EveryWrite).unwrap_err();
    assert!(err.is_corruption());
}

// =============================================================================
// Containment Tests
// =============================================================================

#[test]
fn test_check_row_present() {
    let temp_dir = TempDir::new().unwrap();
    let schema = setup_schema();
    let dir = write_rowset(temp_dir.path(), &schema, 1, 50, Timestamp(1));
    let rowset = open_rowset(&dir, &schema);

    for key in 0..50 {
        assert!(rowset.check_row_present(&encoded_key(&schema, key)).unwrap());
    }
    for key in 50..150 {
        assert!(!rowset.check_row_present(&encoded_key(&schema, key)).unwrap());
    }
    assert!(!rowset.check_row_present(&encoded_key(&schema, -1)).unwrap());
}

#[test]
fn test_deleted_row_still_present() {
    let temp_dir = TempDir::new().unwrap();
    let mvcc = MvccManager::new();
    let schema = setup_schema();
    let dir = write_rowset(temp_dir.path(), &schema, 1, 5, committed_ts(&mvcc));
    let rowset = open_rowset(&dir, &schema);

    let key = encoded_key(&schema, 2);
    let ts = mvcc.begin_transaction();
    rowset.mutate_row(ts, &key, &RowChangeList::delete().unwrap()).unwrap();
    mvcc.commit_transaction(ts).unwrap();

    assert!(rowset.check_row_present(&key).unwrap());
    assert_eq!(rowset.count_rows().unwrap(), 4);
    let err = rowset.mutate_row(Timestamp(100), &key, &set_val(&schema, 1)).unwrap_err();
    assert!(err.is_not_found());
}

// =============================================================================
// Delta Tests
// =============================================================================

#[test]
fn test_mutate_missing_key() {
    let temp_dir = TempDir::new().unwrap();
    let schema = setup_schema();
    let dir = write_rowset(temp_dir.path(), &schema, 1, 5, Timestamp(1));
    let rowset = open_rowset(&dir, &schema);

    let err = rowset
        .mutate_row(Timestamp(2), &encoded_key(&schema, 77), &set_val(&schema, 1))
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(rowset.num_deltas(), 0);
}

#[test]
fn test_deltas_visible_by_snapshot() {
    let temp_dir = TempDir::new().unwrap();
    let mvcc = MvccManager::new();
    let schema = setup_schema();
    let dir = write_rowset(temp_dir.path(), &schema, 1, 3, committed_ts(&mvcc));
    let rowset = open_rowset(&dir, &schema);

    let before = mvcc.take_snapshot();
    let ts = mvcc.begin_transaction();
    rowset.mutate_row(ts, &encoded_key(&schema, 1), &set_val(&schema, 111)).unwrap();
    mvcc.commit_transaction(ts).unwrap();

    let mut iter = Arc::clone(&rowset).new_row_iterator(&schema, &before).unwrap();
    iter.init().unwrap();
    let old_rows = iter.collect_rows().unwrap();
    assert_eq!(schema.get::<i64>(&old_rows[1], 1).unwrap(), 10);

    assert_eq!(scan_vals(&rowset, &mvcc), vec![(0, 0), (1, 111), (2, 20)]);
}

#[test]
fn test_uncommitted_base_rows_hidden() {
    let temp_dir = TempDir::new().unwrap();
    let mvcc = MvccManager::new();
    let schema = setup_schema();
    let dir = write_rowset(temp_dir.path(), &schema, 1, 3, Timestamp(1_000));
    let rowset = open_rowset(&dir, &schema);

    assert!(scan_vals(&rowset, &mvcc).is_empty());
}

#[test]
fn test_deltas_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let mvcc = MvccManager::new();
    let schema = setup_schema();
    let dir = write_rowset(temp_dir.path(), &schema, 1, 4, committed_ts(&mvcc));

    {
        let rowset = open_rowset(&dir, &schema);
        for (key, change) in [
            (0, set_val(&schema, -1)),
            (3, RowChangeList::delete().unwrap()),
        ] {
            let ts = mvcc.begin_transaction();
            rowset.mutate_row(ts, &encoded_key(&schema, key), &change).unwrap();
            mvcc.commit_transaction(ts).unwrap();
        }
        rowset.flush_deltas().unwrap();
    }

    let rowset = open_rowset(&dir, &schema);
    assert_eq!(rowset.num_deltas(), 2);
    assert_eq!(rowset.count_rows().unwrap(), 3);
    assert_eq!(scan_vals(&rowset, &mvcc), vec![(0, -1), (1, 10), (2, 20)]);
}

#[test]
fn test_torn_delta_tail_truncated() {
    let temp_dir = TempDir::new().unwrap();
    let mvcc = MvccManager::new();
    let schema = setup_schema();
    let dir = write_rowset(temp_dir.path(), &schema, 1, 2, committed_ts(&mvcc));

    {
        let rowset = open_rowset(&dir, &schema);
        let ts = mvcc.begin_transaction();
        rowset.mutate_row(ts, &encoded_key(&schema, 0), &set_val(&schema, 5)).unwrap();
        mvcc.commit_transaction(ts).unwrap();
    }

    let log = dir.join("deltas.log");
    let intact_len = fs::metadata(&log).unwrap().len();
    let mut file = OpenOptions::new().append(true).open(&log).unwrap();
    file.write_all(&[1, 0, 0, 0, 0, 0, 0, 0, 9, 9]).unwrap();
    drop(file);

    let rowset = open_rowset(&dir, &schema);
    assert_eq!(rowset.num_deltas(), 1);
    assert_eq!(fs::metadata(&log).unwrap().len(), intact_len);

    // Appends continue after the truncated tail
    let ts = mvcc.begin_transaction();
    rowset.mutate_row(ts, &encoded_key(&schema, 1), &set_val(&schema, 6)).unwrap();
    mvcc.commit_transaction(ts).unwrap();
    drop(rowset);

    let rowset = open_rowset(&dir, &schema);
    assert_eq!(scan_vals(&rowset, &mvcc), vec![(0, 5), (1, 6)]);
}

#[test]
fn test_corrupt_delta_record() {
    let temp_dir = TempDir::new().unwrap();
    let mvcc = MvccManager::new();
    let schema = setup_schema();
    let dir = write_rowset(temp_dir.path(), &schema, 1, 2, committed_ts(&mvcc));

    {
        let rowset = open_rowset(&dir, &schema);
        let ts = mvcc.begin_transaction();
        rowset.mutate_row(ts, &encoded_key(&schema, 0), &set_val(&schema, 5)).unwrap();
        mvcc.commit_transaction(ts).unwrap();
    }

    let log = dir.join("deltas.log");
    let mut data = fs::read(&log).unwrap();
    let last = data.len() - 1;
    data[last] ^= 0xFF;
    fs::write(&log, &data).unwrap();

    let err = DiskRowSet::open(&dir, 1, schema, DeltaSyncStrategy::EveryWrite).unwrap_err();
    assert!(err.is_corruption());
}

#[test]
fn test_collect_and_reapply_mutations() {
    let temp_dir = TempDir::new().unwrap();
    let mvcc = MvccManager::new();
    let schema = setup_schema();
    let base_ts = committed_ts(&mvcc);
    let src = open_rowset(&write_rowset(temp_dir.path(), &schema, 1, 3, base_ts), &schema);
    let dst = open_rowset(&write_rowset(temp_dir.path(), &schema, 2, 3, base_ts), &schema);

    let cutoff = mvcc.take_snapshot();
    let ts = mvcc.begin_transaction();
    src.mutate_row(ts, &encoded_key(&schema, 2), &set_val(&schema, 99)).unwrap();
    mvcc.commit_transaction(ts).unwrap();

    let missed = src.collect_mutations(&|ts| !cutoff.is_committed(ts)).unwrap();
    assert_eq!(missed.len(), 1);
    for m in &missed {
        dst.reapply_mutation(&m.key, &m.mutation).unwrap();
    }
    assert_eq!(scan_vals(&dst, &mvcc), scan_vals(&src, &mvcc));
}

// =============================================================================
// Compaction Input Tests
// =============================================================================

#[test]
fn test_compaction_input_keeps_insert_ts() {
    let temp_dir = TempDir::new().unwrap();
    let mvcc = MvccManager::new();
    let schema = setup_schema();
    let base_ts = committed_ts(&mvcc);
    let rowset = open_rowset(&write_rowset(temp_dir.path(), &schema, 1, 3, base_ts), &schema);

    let ts = mvcc.begin_transaction();
    rowset.mutate_row(ts, &encoded_key(&schema, 0), &RowChangeList::delete().unwrap()).unwrap();
    mvcc.commit_transaction(ts).unwrap();

    let rows: Vec<_> = Arc::clone(&rowset)
        .new_compaction_input(&mvcc.take_snapshot(), mvcc.ancient_history_mark())
        .unwrap()
        .collect::<tablet_store::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.insert_ts == base_ts));
    assert_eq!(rows[0].key, encoded_key(&schema, 1));
}

#[test]
fn test_compaction_input_carries_deltas_seen_by_live_snapshot() {
    let temp_dir = TempDir::new().unwrap();
    let mvcc = MvccManager::new();
    let schema = setup_schema();
    let base_ts = committed_ts(&mvcc);
    let rowset = open_rowset(&write_rowset(temp_dir.path(), &schema, 1, 3, base_ts), &schema);
    let reader = mvcc.take_snapshot();

    let ts = mvcc.begin_transaction();
    rowset.mutate_row(ts, &encoded_key(&schema, 0), &RowChangeList::delete().unwrap()).unwrap();
    rowset.mutate_row(ts, &encoded_key(&schema, 1), &set_val(&schema, 99)).unwrap();
    mvcc.commit_transaction(ts).unwrap();

    let rows: Vec<_> = Arc::clone(&rowset)
        .new_compaction_input(&mvcc.take_snapshot(), mvcc.ancient_history_mark())
        .unwrap()
        .collect::<tablet_store::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].key, encoded_key(&schema, 0));
    assert_eq!(rows[0].redo.len(), 1);
    assert!(rows[0].redo[0].change.is_delete().unwrap());
    assert_eq!(schema.get::<i64>(&rows[1].row, 1).unwrap(), 10);
    assert_eq!(rows[1].redo[0].ts, ts);
    assert!(rows[2].redo.is_empty());

    drop(reader);
    let rows: Vec<_> = Arc::clone(&rowset)
        .new_compaction_input(&mvcc.take_snapshot(), mvcc.ancient_history_mark())
        .unwrap()
        .collect::<tablet_store::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(schema.get::<i64>(&rows[0].row, 1).unwrap(), 99);
    assert!(rows.iter().all(|r| r.redo.is_empty()));
}

// =============================================================================
// Iterator Tests
// =============================================================================

#[test]
fn test_iterator_requires_init() {
    let temp_dir = TempDir::new().unwrap();
    let mvcc = MvccManager::new();
    let schema = setup_schema();
    let rowset = open_rowset(&write_rowset(temp_dir.path(), &schema, 1, 1, Timestamp(1)), &schema);

    let mut iter = Arc::clone(&rowset).new_row_iterator(&schema, &mvcc.take_snapshot()).unwrap();
    assert!(iter.next_row().is_err());
    iter.init().unwrap();
    assert!(iter.init().is_err());
}

// =============================================================================
// Obsolete Tests
// =============================================================================

#[test]
fn test_obsolete_rowset_removed_on_last_drop() {
    let temp_dir = TempDir::new().unwrap();
    let schema = setup_schema();
    let dir = write_rowset(temp_dir.path(), &schema, 1, 5, Timestamp(1));
    let rowset = open_rowset(&dir, &schema);
    let reader = Arc::clone(&rowset);

    rowset.mark_obsolete();
    assert!(rowset.is_obsolete());
    drop(rowset);
    assert!(dir.exists());

    drop(reader);
    assert!(!dir.exists());
}

#[test]
fn test_live_rowset_kept_on_drop() {
    let temp_dir = TempDir::new().unwrap();
    let schema = setup_schema();
    let dir = write_rowset(temp_dir.path(), &schema, 1, 5, Timestamp(1));
    drop(open_rowset(&dir, &schema));
    assert!(dir.exists());
}
