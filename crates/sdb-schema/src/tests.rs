use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::{
    ColumnDef, DataType, IndexDef, IndexStatus, IndexType, SchemaError, TableColumn, TableIndex,
    MAX_INDEX_NUM,
};

fn col(name: &str, id: u32) -> ColumnDef {
    ColumnDef::new(name, id, DataType::String)
}

// ============================================================================
// TableColumn
// ============================================================================

#[test]
fn column_registry_preserves_schema_order() {
    let mut columns = TableColumn::new();
    columns.add_column(col("card", 0)).expect("add");
    columns.add_column(col("mcc", 1)).expect("add");
    columns
        .add_column(ColumnDef::new("image", 2, DataType::Blob))
        .expect("add");

    assert_eq!(columns.len(), 3);
    assert_eq!(columns.get_column(0).expect("col").name(), "card");
    assert_eq!(columns.get_column(2).expect("col").name(), "image");
    assert!(columns.get_column(3).is_none());

    let names: Vec<&str> = columns.get_all_column().iter().map(|c| c.name()).collect();
    assert_eq!(names, vec!["card", "mcc", "image"]);
}

#[test]
fn column_lookup_by_name() {
    let mut columns = TableColumn::new();
    columns.add_column(col("card", 0)).expect("add");

    assert_eq!(columns.get_column_by_name("card").expect("col").id(), 0);
    assert!(columns.get_column_by_name("missing").is_none());
}

#[test]
fn duplicate_column_is_rejected() {
    let mut columns = TableColumn::new();
    columns.add_column(col("card", 0)).expect("add");

    let err = columns.add_column(col("card", 1)).expect_err("duplicate");
    assert_eq!(
        err,
        SchemaError::DuplicateColumn {
            name: "card".to_string()
        }
    );
    assert_eq!(columns.len(), 1);
}

#[test]
fn blob_columns_are_tracked() {
    let mut columns = TableColumn::new();
    columns.add_column(col("card", 0)).expect("add");
    columns
        .add_column(ColumnDef::new("photo", 7, DataType::Blob))
        .expect("add");
    columns
        .add_column(ColumnDef::new("scan", 9, DataType::Blob))
        .expect("add");

    assert_eq!(columns.blob_idxs(), &[7, 9]);
}

// ============================================================================
// TableIndex
// ============================================================================

#[test]
fn add_index_and_lookup() {
    let index = TableIndex::new();
    index
        .add_index(IndexDef::new("card", 0, IndexType::PrimaryKey, vec![col("card", 0)]))
        .expect("add");
    index
        .add_index(IndexDef::new("mcc", 1, IndexType::Normal, vec![col("mcc", 1)]))
        .expect("add");

    assert_eq!(index.len(), 2);
    assert_eq!(index.get_index(1).expect("index").name(), "mcc");
    assert!(index.get_index(2).is_none());
    assert_eq!(index.get_index_by_name("card").expect("index").id(), 0);
    assert!(index.get_index_by_name("missing").is_none());
}

#[test]
fn capacity_is_enforced() {
    let index = TableIndex::new();
    for i in 0..MAX_INDEX_NUM {
        index
            .add_index(IndexDef::new(
                format!("idx{i}"),
                i as u32,
                IndexType::Normal,
                vec![col(&format!("c{i}"), i as u32)],
            ))
            .expect("add within capacity");
    }

    let err = index
        .add_index(IndexDef::new("overflow", 99, IndexType::Normal, vec![col("x", 99)]))
        .expect_err("over capacity");
    assert_eq!(err, SchemaError::IndexCapacity { max: MAX_INDEX_NUM });
    assert_eq!(index.len(), MAX_INDEX_NUM);
}

#[test]
fn combine_name_round_trip() {
    let index = TableIndex::new();
    index
        .add_index(IndexDef::new(
            "card_mcc",
            0,
            IndexType::Normal,
            vec![col("card", 0), col("mcc", 1)],
        ))
        .expect("add");

    let found = index
        .get_index_by_combine_name("card_mcc")
        .expect("combined lookup");
    assert_eq!(found.name(), "card_mcc");
    assert_eq!(found.combine_name(), "card_mcc");
    assert!(index.get_index_by_combine_name("mcc_card").is_none());
}

#[test]
fn find_col_name_scans_all_indexes() {
    let index = TableIndex::new();
    index
        .add_index(IndexDef::new(
            "card_mcc",
            0,
            IndexType::Normal,
            vec![col("card", 0), col("mcc", 1)],
        ))
        .expect("add");
    index
        .add_index(IndexDef::new("amt", 1, IndexType::Normal, vec![col("amt", 2)]))
        .expect("add");

    assert!(index.find_col_name("card"));
    assert!(index.find_col_name("amt"));
    assert!(!index.find_col_name("merchant"));
}

#[test]
fn last_primary_key_wins() {
    let index = TableIndex::new();
    index
        .add_index(IndexDef::new("card", 0, IndexType::PrimaryKey, vec![col("card", 0)]))
        .expect("add");
    assert_eq!(index.get_pk_index().expect("pk").name(), "card");
    assert_eq!(index.has_auto_gen().expect("pk exists"), false);

    index
        .add_index(IndexDef::new("rowid", 1, IndexType::AutoGen, vec![col("rowid", 1)]))
        .expect("add");
    assert_eq!(index.get_pk_index().expect("pk").name(), "rowid");
    assert_eq!(index.has_auto_gen().expect("pk exists"), true);
}

#[test]
fn has_auto_gen_requires_primary_key() {
    let index = TableIndex::new();
    assert_eq!(index.has_auto_gen(), Err(SchemaError::NoPrimaryKey));

    index
        .add_index(IndexDef::new("mcc", 0, IndexType::Normal, vec![col("mcc", 0)]))
        .expect("add");
    // A normal index does not establish a primary key.
    assert_eq!(index.has_auto_gen(), Err(SchemaError::NoPrimaryKey));
}

#[test]
fn reset_clears_every_view() {
    let index = TableIndex::new();
    index
        .add_index(IndexDef::new("card", 0, IndexType::PrimaryKey, vec![col("card", 0)]))
        .expect("add");

    index.reset();

    assert!(index.is_empty());
    assert!(index.get_pk_index().is_none());
    assert!(index.get_index_by_combine_name("card").is_none());
    assert!(!index.find_col_name("card"));

    // The slot freed by reset is usable again.
    index
        .add_index(IndexDef::new("card", 0, IndexType::PrimaryKey, vec![col("card", 0)]))
        .expect("re-add after reset");
    assert_eq!(index.len(), 1);
}

#[test]
fn index_status_defaults_to_ready() {
    let def = IndexDef::new("card", 0, IndexType::Normal, vec![col("card", 0)]);
    assert_eq!(def.status(), IndexStatus::Ready);

    let waiting = def.with_status(IndexStatus::Waiting);
    assert_eq!(waiting.status(), IndexStatus::Waiting);
}

#[test]
fn readers_never_observe_a_torn_snapshot() {
    let index = Arc::new(TableIndex::new());
    let stop = Arc::new(AtomicBool::new(false));

    let mut readers = Vec::new();
    for _ in 0..4 {
        let index = Arc::clone(&index);
        let stop = Arc::clone(&stop);
        readers.push(thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                // Every index visible in the list must be reachable through
                // the combine map and the flat column-name list; the map and
                // list are only ever published together with the list.
                for def in index.get_all_index() {
                    let combine = def.combine_name();
                    let via_map = index
                        .get_index_by_combine_name(&combine)
                        .expect("combine map lags the index list");
                    assert_eq!(via_map.id(), def.id());
                    for col in def.columns() {
                        assert!(
                            index.find_col_name(col.name()),
                            "column list lags the index list"
                        );
                    }
                }
            }
        }));
    }

    for i in 0..MAX_INDEX_NUM {
        index
            .add_index(IndexDef::new(
                format!("idx{i}"),
                i as u32,
                IndexType::Normal,
                vec![col(&format!("c{i}a"), i as u32 * 2), col(&format!("c{i}b"), i as u32 * 2 + 1)],
            ))
            .expect("add");
        thread::yield_now();
    }

    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().expect("reader panicked");
    }

    assert_eq!(index.len(), MAX_INDEX_NUM);
}
