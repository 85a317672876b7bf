//! Shared helpers for the tablet test binaries

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use tablet_store::{
    ColumnSchema, DataType, DeltaSyncStrategy, MvccSnapshot, RowBuilder, RowChangeList,
    RowChangeListEncoder, Schema, Tablet, TabletConfig,
};
use tempfile::TempDir;

pub fn setup_schema() -> Schema {
    Schema::new(
        vec![
            ColumnSchema::new("key", DataType::Int32),
            ColumnSchema::new("val", DataType::Int64),
        ],
        1,
    )
    .unwrap()
}

pub fn test_config() -> TabletConfig {
    TabletConfig::builder()
        .delta_sync(DeltaSyncStrategy::EveryWrite)
        .build()
}

pub fn tablet_path(temp_dir: &TempDir) -> PathBuf {
    temp_dir.path().join("tablet")
}

/// Create and open a tablet in a fresh temp directory
pub fn setup_tablet() -> (TempDir, Arc<Tablet>) {
    setup_tablet_with_config(test_config())
}

pub fn setup_tablet_with_config(config: TabletConfig) -> (TempDir, Arc<Tablet>) {
    let temp_dir = TempDir::new().unwrap();
    let tablet = Tablet::with_config(setup_schema(), tablet_path(&temp_dir), config).unwrap();
    tablet.create_new().unwrap();
    tablet.open().unwrap();
    (temp_dir, Arc::new(tablet))
}

pub fn reopen(temp_dir: &TempDir) -> Tablet {
    Tablet::open_existing(tablet_path(temp_dir), test_config()).unwrap()
}

pub fn make_row(key: i32, val: i64) -> Vec<u8> {
    let schema = setup_schema();
    let row = RowBuilder::new(&schema).add(key).unwrap().add(val).unwrap().build().unwrap();
    row
}

pub fn make_key(key: i32) -> Vec<u8> {
    let schema = setup_schema();
    let key = RowBuilder::key(&schema).add(key).unwrap().build().unwrap();
    key
}

pub fn set_val(val: i64) -> RowChangeList {
    let schema = setup_schema();
    let change = RowChangeListEncoder::new(&schema).update(1, val).unwrap().build().unwrap();
    change
}

/// Insert keys in `range` with `val = key * 10`
pub fn insert_range(tablet: &Tablet, range: std::ops::Range<i32>) {
    for key in range {
        tablet.insert(&make_row(key, i64::from(key) * 10)).unwrap();
    }
}

pub fn update_val(tablet: &Tablet, key: i32, val: i64) {
    tablet.update_row(&make_key(key), &set_val(val)).unwrap();
}

/// (key, val) pairs of every row visible now, in key order
pub fn scan_all(tablet: &Tablet) -> Vec<(i32, i64)> {
    let mut iter = tablet.new_row_iterator(tablet.schema()).unwrap();
    collect_pairs(tablet, iter.as_mut())
}

/// (key, val) pairs of every row visible in `snap`
pub fn scan_at(tablet: &Tablet, snap: &MvccSnapshot) -> Vec<(i32, i64)> {
    let mut iter = tablet
        .new_row_iterator_with_snapshot(tablet.schema(), snap)
        .unwrap();
    collect_pairs(tablet, iter.as_mut())
}

fn collect_pairs(tablet: &Tablet, iter: &mut dyn tablet_store::RowwiseIterator) -> Vec<(i32, i64)> {
    let schema = tablet.schema();
    iter.init().unwrap();
    iter.collect_rows()
        .unwrap()
        .iter()
        .map(|r| (schema.get::<i32>(r, 0).unwrap(), schema.get::<i64>(r, 1).unwrap()))
        .collect()
}

/// Rowset directories present on disk, sorted
pub fn rowset_dirs(temp_dir: &TempDir) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(tablet_path(temp_dir))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("rowset_"))
        .collect();
    names.sort();
    names
}
