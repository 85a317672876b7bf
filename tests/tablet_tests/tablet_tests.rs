//! Tests for Tablet lifecycle, writes and reads
//!
//! These tests verify:
//! - create_new / open / open_existing error handling
//! - Insert, update and delete semantics and error kinds
//! - Projected scans and row ordering
//! - Snapshot isolation of iterators

mod common;

use common::*;
use tablet_store::schema::{ColumnUpdate, RowChange};
use tablet_store::{
    get_rowset_path, ColumnSchema, DataType, RowChangeList, Schema, Tablet, TabletConfig,
    TabletError,
};
use tempfile::TempDir;

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_create_and_open() {
    let (temp_dir, tablet) = setup_tablet();

    assert!(tablet.is_open());
    assert!(tablet_path(&temp_dir).join("tablet.meta").exists());
    assert_eq!(tablet.num_rowsets(), 0);
    assert_eq!(tablet.count_rows().unwrap(), 0);
    assert!(scan_all(&tablet).is_empty());
}

#[test]
fn test_create_new_on_existing_dir() {
    let temp_dir = TempDir::new().unwrap();
    let tablet = Tablet::new(setup_schema(), temp_dir.path()).unwrap();

    let err = tablet.create_new().unwrap_err();
    assert!(err.is_io_error());
}

#[test]
fn test_open_uninitialized_dir() {
    let temp_dir = TempDir::new().unwrap();
    let tablet = Tablet::new(setup_schema(), temp_dir.path()).unwrap();

    let err = tablet.open().unwrap_err();
    assert!(err.is_corruption());
    assert!(!tablet.is_open());
}

#[test]
fn test_open_twice() {
    let (_temp_dir, tablet) = setup_tablet();
    let err = tablet.open().unwrap_err();
    assert!(matches!(err, TabletError::IllegalState(_)));
}

#[test]
fn test_open_with_wrong_schema() {
    let (temp_dir, tablet) = setup_tablet();
    drop(tablet);

    let other = Schema::new(
        vec![
            ColumnSchema::new("key", DataType::Int32),
            ColumnSchema::new("val", DataType::Int32),
        ],
        1,
    )
    .unwrap();
    let tablet = Tablet::new(other, tablet_path(&temp_dir)).unwrap();
    assert!(tablet.open().unwrap_err().is_invalid_argument());
}

#[test]
fn test_open_existing_reads_schema() {
    let (temp_dir, tablet) = setup_tablet();
    drop(tablet);

    let tablet = reopen(&temp_dir);
    assert!(tablet.is_open());
    assert_eq!(tablet.schema(), &setup_schema());
}

#[test]
fn test_operations_require_open() {
    let temp_dir = TempDir::new().unwrap();
    let tablet = Tablet::new(setup_schema(), tablet_path(&temp_dir)).unwrap();
    tablet.create_new().unwrap();

    assert!(matches!(
        tablet.insert(&make_row(1, 1)).unwrap_err(),
        TabletError::IllegalState(_)
    ));
    assert!(tablet.new_row_iterator(tablet.schema()).is_err());
    assert!(tablet.flush().is_err());
    assert!(tablet.compact().is_err());
}

#[test]
fn test_keyless_schema_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let schema = Schema::new(vec![ColumnSchema::new("val", DataType::Int64)], 0).unwrap();
    let err = Tablet::new(schema, temp_dir.path()).unwrap_err();
    assert!(err.is_invalid_argument());
}

#[test]
fn test_invalid_config_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config = TabletConfig::builder().target_rowset_size(0).build();
    let err = Tablet::with_config(setup_schema(), temp_dir.path(), config).unwrap_err();
    assert!(matches!(err, TabletError::Config(_)));
}

#[test]
fn test_default_compaction_needs_two_rowsets() {
    let config = TabletConfig::default();
    assert_eq!(config.compaction.min_rowsets_to_compact, 2);

    let config = TabletConfig::builder().max_rowsets_per_compaction(1).build();
    assert!(matches!(config.validate(), Err(TabletError::Config(_))));
}

#[test]
fn test_get_rowset_path() {
    let temp_dir = TempDir::new().unwrap();
    assert_eq!(
        get_rowset_path(temp_dir.path(), 3),
        temp_dir.path().join("rowset_000003")
    );
    assert_eq!(
        get_rowset_path(temp_dir.path(), 1234567),
        temp_dir.path().join("rowset_1234567")
    );
}

// =============================================================================
// Insert Tests
// =============================================================================

#[test]
fn test_insert_and_scan() {
    let (_temp_dir, tablet) = setup_tablet();
    for key in [5, 1, 9, -4, 3] {
        tablet.insert(&make_row(key, i64::from(key) * 10)).unwrap();
    }

    assert_eq!(tablet.count_rows().unwrap(), 5);
    assert_eq!(
        scan_all(&tablet),
        vec![(-4, -40), (1, 10), (3, 30), (5, 50), (9, 90)]
    );
    assert!(tablet.memrowset_size() > 0);
}

#[test]
fn test_insert_duplicate() {
    let (_temp_dir, tablet) = setup_tablet();
    tablet.insert(&make_row(1, 10)).unwrap();

    let err = tablet.insert(&make_row(1, 11)).unwrap_err();
    assert!(err.is_already_present());
    assert_eq!(scan_all(&tablet), vec![(1, 10)]);
}

#[test]
fn test_insert_duplicate_of_flushed_row() {
    let (_temp_dir, tablet) = setup_tablet();
    tablet.insert(&make_row(1, 10)).unwrap();
    tablet.flush().unwrap();

    assert!(tablet.insert(&make_row(1, 11)).unwrap_err().is_already_present());
    assert_eq!(tablet.count_rows().unwrap(), 1);
}

#[test]
fn test_insert_wrong_width() {
    let (_temp_dir, tablet) = setup_tablet();
    let err = tablet.insert(&[1, 2, 3]).unwrap_err();
    assert!(err.is_invalid_argument());
    assert_eq!(tablet.mvcc_manager().num_in_flight(), 0);
}

#[test]
fn test_failed_insert_aborts_transaction() {
    let (_temp_dir, tablet) = setup_tablet();
    tablet.insert(&make_row(1, 10)).unwrap();
    assert!(tablet.insert(&make_row(1, 10)).is_err());

    assert_eq!(tablet.mvcc_manager().num_in_flight(), 0);
    let snap = tablet.mvcc_manager().take_snapshot();
    assert!(snap.in_flight().is_empty());
}

// =============================================================================
// Update / Delete Tests
// =============================================================================

#[test]
fn test_update_row() {
    let (_temp_dir, tablet) = setup_tablet();
    insert_range(&tablet, 0..3);

    update_val(&tablet, 1, 111);
    assert_eq!(scan_all(&tablet), vec![(0, 0), (1, 111), (2, 20)]);
}

#[test]
fn test_update_missing_key() {
    let (_temp_dir, tablet) = setup_tablet();
    let err = tablet.update_row(&make_key(42), &set_val(1)).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_update_key_column_rejected() {
    let (_temp_dir, tablet) = setup_tablet();
    insert_range(&tablet, 0..1);

    let change = RowChangeList::from_change(&RowChange::Update(vec![ColumnUpdate {
        column: 0,
        value: 7i32.to_le_bytes().to_vec(),
    }]))
    .unwrap();
    let err = tablet.update_row(&make_key(0), &change).unwrap_err();
    assert!(err.is_invalid_argument());
    assert_eq!(scan_all(&tablet), vec![(0, 0)]);
}

#[test]
fn test_update_accepts_full_row_as_key() {
    let (_temp_dir, tablet) = setup_tablet();
    insert_range(&tablet, 0..2);

    tablet.update_row(&make_row(1, 999), &set_val(5)).unwrap();
    assert_eq!(scan_all(&tablet), vec![(0, 0), (1, 5)]);
}

#[test]
fn test_delete_row() {
    let (_temp_dir, tablet) = setup_tablet();
    insert_range(&tablet, 0..3);

    tablet.delete_row(&make_key(1)).unwrap();
    assert_eq!(scan_all(&tablet), vec![(0, 0), (2, 20)]);
    assert_eq!(tablet.count_rows().unwrap(), 2);
}

#[test]
fn test_deleted_row_rejects_update_and_reinsert() {
    let (_temp_dir, tablet) = setup_tablet();
    insert_range(&tablet, 0..1);
    tablet.delete_row(&make_key(0)).unwrap();

    assert!(tablet.update_row(&make_key(0), &set_val(1)).unwrap_err().is_not_found());
    assert!(tablet.delete_row(&make_key(0)).unwrap_err().is_not_found());
    // The deleted row keeps its key until a flush drops it
    assert!(tablet.insert(&make_row(0, 1)).unwrap_err().is_already_present());
}

#[test]
fn test_update_and_delete_on_disk_rows() {
    let (_temp_dir, tablet) = setup_tablet();
    insert_range(&tablet, 0..4);
    tablet.flush().unwrap();

    update_val(&tablet, 2, -2);
    tablet.delete_row(&make_key(3)).unwrap();

    assert_eq!(scan_all(&tablet), vec![(0, 0), (1, 10), (2, -2)]);
    assert_eq!(tablet.count_rows().unwrap(), 3);
    assert!(tablet.update_row(&make_key(3), &set_val(0)).unwrap_err().is_not_found());
}

// =============================================================================
// Projection Tests
// =============================================================================

#[test]
fn test_projected_scan() {
    let (_temp_dir, tablet) = setup_tablet();
    insert_range(&tablet, 0..3);
    tablet.flush().unwrap();
    insert_range(&tablet, 3..5);

    let projection = Schema::new(vec![ColumnSchema::new("val", DataType::Int64)], 0).unwrap();
    let mut iter = tablet.new_row_iterator(&projection).unwrap();
    assert_eq!(iter.schema(), &projection);
    iter.init().unwrap();

    let vals: Vec<i64> = iter
        .collect_rows()
        .unwrap()
        .iter()
        .map(|r| projection.get::<i64>(r, 0).unwrap())
        .collect();
    assert_eq!(vals, vec![0, 10, 20, 30, 40]);
}

#[test]
fn test_projection_unknown_column() {
    let (_temp_dir, tablet) = setup_tablet();
    let projection = Schema::new(vec![ColumnSchema::new("nope", DataType::Int64)], 0).unwrap();
    assert!(matches!(
        tablet.new_row_iterator(&projection),
        Err(e) if e.is_invalid_argument()
    ));
}

#[test]
fn test_projection_type_mismatch() {
    let (_temp_dir, tablet) = setup_tablet();
    let projection = Schema::new(vec![ColumnSchema::new("val", DataType::Int32)], 0).unwrap();
    assert!(matches!(
        tablet.new_row_iterator(&projection),
        Err(e) if e.is_invalid_argument()
    ));
}

#[test]
fn test_iterator_requires_init() {
    let (_temp_dir, tablet) = setup_tablet();
    insert_range(&tablet, 0..1);
    let mut iter = tablet.new_row_iterator(tablet.schema()).unwrap();
    assert!(iter.next_row().is_err());
}

// =============================================================================
// Snapshot Isolation Tests
// =============================================================================

#[test]
fn test_iterator_ignores_later_writes() {
    let (_temp_dir, tablet) = setup_tablet();
    insert_range(&tablet, 0..3);

    let mut iter = tablet.new_row_iterator(tablet.schema()).unwrap();
    insert_range(&tablet, 3..6);
    update_val(&tablet, 0, 7);
    tablet.delete_row(&make_key(1)).unwrap();

    iter.init().unwrap();
    let schema = tablet.schema();
    let seen: Vec<(i32, i64)> = iter
        .collect_rows()
        .unwrap()
        .iter()
        .map(|r| (schema.get::<i32>(r, 0).unwrap(), schema.get::<i64>(r, 1).unwrap()))
        .collect();
    assert_eq!(seen, vec![(0, 0), (1, 10), (2, 20)]);
}

#[test]
fn test_scan_at_snapshot() {
    let (_temp_dir, tablet) = setup_tablet();
    insert_range(&tablet, 0..2);
    let snap = tablet.mvcc_manager().take_snapshot();

    update_val(&tablet, 1, 100);
    insert_range(&tablet, 2..3);

    assert_eq!(scan_at(&tablet, &snap), vec![(0, 0), (1, 10)]);
    assert_eq!(scan_all(&tablet), vec![(0, 0), (1, 100), (2, 20)]);
}

#[test]
fn test_snapshot_survives_flush() {
    let (_temp_dir, tablet) = setup_tablet();
    insert_range(&tablet, 0..3);
    let snap = tablet.mvcc_manager().take_snapshot();
    insert_range(&tablet, 3..5);

    tablet.flush().unwrap();

    // Flushed rows keep their insert timestamps
    assert_eq!(scan_at(&tablet, &snap), vec![(0, 0), (1, 10), (2, 20)]);
    assert_eq!(scan_all(&tablet).len(), 5);
}

#[test]
fn test_timestamps_advance_per_write() {
    let (_temp_dir, tablet) = setup_tablet();
    let before = tablet.mvcc_manager().take_snapshot().all_committed_before();
    insert_range(&tablet, 0..3);
    update_val(&tablet, 0, 1);
    let after = tablet.mvcc_manager().take_snapshot().all_committed_before();

    assert_eq!(after.value() - before.value(), 4);
}
