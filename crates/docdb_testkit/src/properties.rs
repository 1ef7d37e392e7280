//! Property suites for the engine's core guarantees.

use crate::checks::{apply_tree_op, check_cache, check_tree, ids, same_results, TreeModel};
use crate::fixtures::{memory_tree, snapshot_dir, TestDatabase};
use crate::generators::*;
use docdb_core::index::BTree;
use docdb_core::recovery::replay_into;
use docdb_core::storage::{CacheOptions, CachePolicy, StorageManager};
use docdb_core::wal::{WalManager, WalOptions, WalRecord};
use docdb_core::{
    CollectionSchema, Config, DatabaseDir, DatabaseStats, Document, Filter, IndexDefinition, Query,
    SortDirection,
};
use docdb_storage::{FileBlobStore, MemoryBlobStore};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn fail(message: String) -> TestCaseError {
    TestCaseError::fail(message)
}

proptest! {
    #![proptest_config(PropTestConfig::default().to_proptest_config())]

    #[test]
    fn btree_invariants_hold_after_every_operation(
        order in 2usize..5,
        ops in tree_ops_strategy(1, 150),
    ) {
        let tree = memory_tree(order);
        let mut model = TreeModel::new();
        for op in &ops {
            let expected = model.apply(op);
            prop_assert_eq!(apply_tree_op(&tree, op).map_err(fail)?, expected, "op {:?}", op);
            check_tree(&tree, &model).map_err(fail)?;
        }
    }

    #[test]
    fn cache_evicts_by_policy(
        capacity in 1usize..8,
        policy in prop::sample::select(vec![CachePolicy::Lru, CachePolicy::Lfu]),
        ops in cache_ops_strategy(12, 200),
    ) {
        check_cache(capacity, policy, &ops).map_err(fail)?;
    }

    #[test]
    fn cached_and_disk_reads_agree(docs in documents_strategy(20)) {
        let storage = StorageManager::new(
            "items",
            Arc::new(MemoryBlobStore::new()),
            CacheOptions::from_config(&Config::new().cache_capacity(4)),
            Arc::new(DatabaseStats::new()),
        )
        .map_err(|e| fail(e.to_string()))?;

        for value in docs {
            let doc = Document::from_value(value).map_err(|e| fail(e.to_string()))?;
            let id = doc.id().unwrap_or_default().to_string();
            storage.write(&id, &doc).map_err(|e| fail(e.to_string()))?;
            let read_back = storage.read(&id).map_err(|e| fail(e.to_string()))?;
            prop_assert_eq!(read_back.as_ref(), Some(&doc));
            let read_disk = storage.read_from_disk(&id).map_err(|e| fail(e.to_string()))?;
            prop_assert_eq!(
                read_disk.as_ref(),
                Some(&doc)
            );
        }
    }
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn btree_content_survives_reopen(order in 2usize..4, ops in tree_ops_strategy(1, 80)) {
        let temp = TempDir::new().map_err(|e| fail(e.to_string()))?;
        let open = || -> Result<BTree, TestCaseError> {
            let store = FileBlobStore::open(temp.path(), "json").map_err(|e| fail(e.to_string()))?;
            BTree::open("prop", Box::new(store), order, 4, Duration::from_secs(5))
                .map_err(|e| fail(e.to_string()))
        };

        let mut model = TreeModel::new();
        {
            let tree = open()?;
            for op in &ops {
                model.apply(op);
                apply_tree_op(&tree, op).map_err(fail)?;
            }
        }
        check_tree(&open()?, &model).map_err(fail)?;
    }

    #[test]
    fn indexed_and_unindexed_queries_agree(
        docs in documents_strategy(40),
        filters in prop::collection::vec(filter_strategy(), 1..6),
        doomed in filter_strategy(),
    ) {
        let test_db = TestDatabase::new();
        let indexed = test_db
            .collection(
                "indexed",
                CollectionSchema::parse("name:string; age:number; *tags; [name+age]")
                    .map_err(|e| fail(e.to_string()))?,
            )
            .map_err(|e| fail(e.to_string()))?;
        for field in ["age", "name", "address.city"] {
            indexed
                .create_index(IndexDefinition::plain(field))
                .map_err(|e| fail(e.to_string()))?;
        }
        let plain = test_db
            .collection("plain", CollectionSchema::new())
            .map_err(|e| fail(e.to_string()))?;

        for coll in [&indexed, &plain] {
            let result = coll.insert_many(docs.clone()).map_err(|e| fail(e.to_string()))?;
            prop_assert!(result.is_complete(), "{:?}", result.failures);
        }

        let check = |filters: &[Filter]| -> Result<(), TestCaseError> {
            for filter in filters {
                same_results(&indexed, &plain, &Query::new(filter.clone())).map_err(fail)?;
                let paged = Query::new(filter.clone())
                    .order_by("age", SortDirection::Descending)
                    .skip(1)
                    .limit(5);
                same_results(&indexed, &plain, &paged).map_err(fail)?;
            }
            Ok(())
        };
        check(&filters)?;

        // Index maintenance on removal.
        let a = indexed.delete_many(&doomed).map_err(|e| fail(e.to_string()))?;
        let b = plain.delete_many(&doomed).map_err(|e| fail(e.to_string()))?;
        prop_assert_eq!(a.success, b.success);
        check(&filters)?;
        prop_assert!(indexed
            .verify()
            .map_err(|e| fail(e.to_string()))?
            .iter()
            .all(|report| report.is_healthy()));
    }

    #[test]
    fn wal_replay_is_idempotent(ops in doc_ops_strategy(60)) {
        let temp = TempDir::new().map_err(|e| fail(e.to_string()))?;
        let dir = DatabaseDir::open(temp.path(), true).map_err(|e| fail(e.to_string()))?;
        let config = Config::new().sync_on_write(false);
        let stats = Arc::new(DatabaseStats::new());
        let wal = WalManager::open(
            &dir.wal_dir(),
            WalOptions {
                max_segment_size: 512,
                sync_on_write: false,
                ..WalOptions::default()
            },
        )
        .map_err(|e| fail(e.to_string()))?;

        let mut model: BTreeMap<String, i64> = BTreeMap::new();
        for (chunk_no, chunk) in ops.chunks(3).enumerate() {
            let mut records = Vec::new();
            for op in chunk {
                let record = match op {
                    DocOp::Put { id, n } => {
                        let document = Document::from_value(json!({"id": id, "n": n}))
                            .map_err(|e| fail(e.to_string()))?;
                        let (collection, id) = ("items".to_string(), id.clone());
                        match model.insert(id.clone(), *n) {
                            Some(_) => WalRecord::Update { collection, id, document },
                            None => WalRecord::Create { collection, id, document },
                        }
                    }
                    DocOp::Delete { id } => {
                        model.remove(id);
                        WalRecord::Delete { collection: "items".into(), id: id.clone() }
                    }
                };
                records.push(record);
            }
            if chunk_no % 2 == 1 {
                wal.log(WalRecord::Batch { collection: "items".into(), operations: records })
                    .map_err(|e| fail(e.to_string()))?;
            } else {
                for record in records {
                    wal.log(record).map_err(|e| fail(e.to_string()))?;
                }
            }
        }

        let items = temp.path().join("items");
        replay_into(&dir, wal.replay().map_err(|e| fail(e.to_string()))?, &config, &stats)
            .map_err(|e| fail(e.to_string()))?;
        let once = snapshot_dir(&items);
        let again = replay_into(&dir, wal.replay().map_err(|e| fail(e.to_string()))?, &config, &stats)
            .map_err(|e| fail(e.to_string()))?;
        prop_assert_eq!(again.documents_written, 0);
        prop_assert_eq!(again.documents_deleted, 0);
        prop_assert!(snapshot_dir(&items) == once, "second replay changed files");

        if !ops.is_empty() {
            let storage = StorageManager::open("items", &items, &config, Arc::clone(&stats))
                .map_err(|e| fail(e.to_string()))?;
            let mut on_disk: Vec<String> = storage
                .ids()
                .map_err(|e| fail(e.to_string()))?
                .collect::<Result<_, _>>()
                .map_err(|e| fail(e.to_string()))?;
            on_disk.sort();
            prop_assert_eq!(on_disk, model.keys().cloned().collect::<Vec<_>>());
            for (id, n) in &model {
                let doc = storage.read(id).map_err(|e| fail(e.to_string()))?;
                prop_assert_eq!(doc.and_then(|d| d.get("n").cloned()), Some(json!(n)));
            }
        }
    }

    #[test]
    fn recovery_restores_lost_document_files(ops in doc_ops_strategy(40)) {
        let test_db = TestDatabase::new();
        let mut model: BTreeMap<String, i64> = BTreeMap::new();
        {
            let items = test_db
                .collection("items", CollectionSchema::parse("n:number").map_err(|e| fail(e.to_string()))?)
                .map_err(|e| fail(e.to_string()))?;
            items.create_index(IndexDefinition::plain("n")).map_err(|e| fail(e.to_string()))?;
            for op in &ops {
                match op {
                    DocOp::Put { id, n } if model.contains_key(id) => {
                        items.update(id, json!({"n": n})).map_err(|e| fail(e.to_string()))?;
                        model.insert(id.clone(), *n);
                    }
                    DocOp::Put { id, n } => {
                        items.insert(json!({"id": id, "n": n})).map_err(|e| fail(e.to_string()))?;
                        model.insert(id.clone(), *n);
                    }
                    DocOp::Delete { id } => {
                        let existed = items.delete(id).map_err(|e| fail(e.to_string()))?;
                        prop_assert_eq!(existed, model.remove(id).is_some());
                    }
                }
            }
        }

        // Lose every document file written since the last checkpoint.
        let test_db = test_db.while_closed(|path| {
            if let Ok(entries) = std::fs::read_dir(path.join("items")) {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.ends_with(".json") && !name.starts_with('_') {
                        let _ = std::fs::remove_file(entry.path());
                    }
                }
            }
        });

        let items = test_db
            .collection("items", CollectionSchema::parse("n:number").map_err(|e| fail(e.to_string()))?)
            .map_err(|e| fail(e.to_string()))?;
        let all = items.find(&Query::default()).map_err(|e| fail(e.to_string()))?;
        prop_assert_eq!(ids(&all), model.keys().cloned().collect::<Vec<_>>());
        prop_assert_eq!(
            items.metadata().map_err(|e| fail(e.to_string()))?.document_count,
            model.len() as u64
        );
        for (id, n) in &model {
            let hits = items.count(&Filter::eq("n", *n)).map_err(|e| fail(e.to_string()))?;
            prop_assert!(hits >= 1, "index lost {}", id);
        }
        prop_assert!(items
            .verify()
            .map_err(|e| fail(e.to_string()))?
            .iter()
            .all(|report| report.is_healthy()));
    }
}
