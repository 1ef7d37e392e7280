//! Test fixtures and database helpers.
//!
//! Provides convenience functions for setting up test databases
//! and common test scenarios.

use docdb_core::index::BTree;
use docdb_core::{Config, Database};
use docdb_storage::MemoryBlobStore;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Configuration tuned for tests: tiny B-tree order, small caches and no
/// fsync.
#[must_use]
pub fn test_config() -> Config {
    Config::new()
        .btree_order(2)
        .node_cache_capacity(8)
        .cache_capacity(16)
        .sync_on_write(false)
}

/// A test database in a temporary directory, removed on drop.
pub struct TestDatabase {
    /// The database instance.
    pub db: Database,
    config: Config,
    // Declared last so the directory outlives the handle.
    temp_dir: TempDir,
}

impl TestDatabase {
    /// Creates a database with [`test_config`].
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Creates a database with a custom configuration.
    pub fn with_config(config: Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db = Database::open_with_config(temp_dir.path(), config.clone())
            .expect("Failed to open database");
        Self {
            db,
            config,
            temp_dir,
        }
    }

    /// Returns the database directory.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Closes the handle and opens the directory again, running recovery.
    pub fn reopen(self) -> Self {
        let Self {
            db,
            config,
            temp_dir,
        } = self;
        drop(db);
        let db = Database::open_with_config(temp_dir.path(), config.clone())
            .expect("Failed to reopen database");
        Self {
            db,
            config,
            temp_dir,
        }
    }

    /// Runs `f` with the handle closed, e.g. to tamper with files.
    pub fn while_closed<F>(self, f: F) -> Self
    where
        F: FnOnce(&Path),
    {
        let Self {
            db,
            config,
            temp_dir,
        } = self;
        drop(db);
        f(temp_dir.path());
        let db = Database::open_with_config(temp_dir.path(), config.clone())
            .expect("Failed to reopen database");
        Self {
            db,
            config,
            temp_dir,
        }
    }
}

impl Default for TestDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Runs a test with a temporary database.
///
/// # Example
///
/// ```rust,ignore
/// use docdb_testkit::with_temp_db;
///
/// #[test]
/// fn my_test() {
///     with_temp_db(|db| {
///         let items = db.collection("items", CollectionSchema::new()).unwrap();
///         // ... test operations
///     });
/// }
/// ```
pub fn with_temp_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database) -> R,
{
    let test_db = TestDatabase::new();
    f(&test_db.db)
}

/// A B-tree over an in-memory blob store.
pub fn memory_tree(order: usize) -> BTree {
    BTree::open(
        "test",
        Box::new(MemoryBlobStore::new()),
        order,
        8,
        Duration::from_secs(5),
    )
    .expect("Failed to open in-memory tree")
}

/// Every regular file under `dir`, relative path to contents.
///
/// Used to compare on-disk state before and after an operation.
pub fn snapshot_dir(dir: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<(PathBuf, Vec<u8>)>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries {
            let path = entry.expect("Failed to read directory entry").path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let relative = path.strip_prefix(root).expect("path under root").to_path_buf();
                out.push((relative, std::fs::read(&path).expect("Failed to read file")));
            }
        }
    }

    let mut out = Vec::new();
    walk(dir, dir, &mut out);
    out.sort();
    out
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;
    use docdb_core::{Collection, CollectionSchema, IndexDefinition};
    use std::sync::Arc;

    /// Schema of the `users` collection used across scenarios.
    pub const USERS_SCHEMA: &str = "&email; name:string; age:number; *tags; [name+age]";

    /// Opens `users` and fills it with `count` documents `u000`, `u001`, ...
    ///
    /// Ages cycle through 18..68, names through five values, and every
    /// user carries two tags.
    pub fn populated_users(db: &Database, count: usize) -> Arc<Collection> {
        let users = db
            .collection("users", CollectionSchema::parse(USERS_SCHEMA).expect("valid schema"))
            .expect("Failed to open users");
        users
            .create_index(IndexDefinition::plain("age"))
            .expect("Failed to index age");

        let names = ["ada", "bob", "cy", "dee", "eve"];
        let docs: Vec<_> = (0..count)
            .map(|i| {
                json!({
                    "id": format!("u{i:03}"),
                    "email": format!("user{i}@example.com"),
                    "name": names[i % names.len()],
                    "age": 18 + (i % 50),
                    "tags": [format!("t{}", i % 3), format!("t{}", i % 7)],
                })
            })
            .collect();
        let result = users.insert_many(docs).expect("Failed to insert users");
        assert!(result.is_complete(), "seed data rejected: {:?}", result.failures);
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docdb_core::{CollectionSchema, Filter};

    #[test]
    fn test_with_temp_db() {
        let names = with_temp_db(|db| {
            db.collection("test", CollectionSchema::new()).unwrap();
            db.collection_names().unwrap()
        });
        assert_eq!(names, vec!["test"]);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let test_db = TestDatabase::new();
        scenarios::populated_users(&test_db, 20);

        let test_db = test_db.reopen();
        let users = test_db
            .collection("users", CollectionSchema::parse(scenarios::USERS_SCHEMA).unwrap())
            .unwrap();
        assert_eq!(users.count(&Filter::all()).unwrap(), 20);
        assert_eq!(users.indexes().len(), 4);
    }

    #[test]
    fn test_snapshot_is_sorted_and_relative() {
        let test_db = TestDatabase::new();
        let items = test_db.collection("items", CollectionSchema::new()).unwrap();
        items.insert(json!({"id": "a"})).unwrap();

        let snapshot = snapshot_dir(test_db.path());
        assert!(snapshot.iter().any(|(p, _)| p == Path::new("items/a.json")));
        assert!(snapshot.windows(2).all(|w| w[0].0 <= w[1].0));
    }
}
