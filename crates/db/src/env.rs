//! The embedded engine environment.

use crate::{DatabaseError, IndexStore, Table};
use std::path::{Path, PathBuf};

/// One embedded engine instance rooted at a directory.
///
/// Every [`Table`] opens as a named tree inside the environment. The chain
/// keeps two environments: `index/` (rebuildable) and `raw_chain/` (the block
/// archive).
#[derive(Debug, Clone)]
pub struct StoreEnv {
    db: sled::Db,
    path: PathBuf,
}

impl StoreEnv {
    /// Opens (or creates) the environment at `path`.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        let db = sled::open(path)?;
        Ok(Self { db, path: path.to_path_buf() })
    }

    /// The directory this environment lives in.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the store for a table.
    pub fn store<T: Table>(&self) -> Result<IndexStore<T>, DatabaseError> {
        Ok(IndexStore::new(self.db.open_tree(T::NAME)?))
    }

    /// Moves every entry of the tree named `from` into the tree named `to`,
    /// clearing `from`. Used by the reindex path in place of a directory
    /// rename.
    pub fn rename_tree(&self, from: &str, to: &str) -> Result<(), DatabaseError> {
        let src = self.db.open_tree(from)?;
        let dst = self.db.open_tree(to)?;
        dst.clear()?;
        for item in src.iter() {
            let (key, value) = item?;
            dst.insert(key, value)?;
        }
        src.clear()?;
        Ok(())
    }

    /// Drops the tree named `name`, discarding its contents.
    pub fn drop_tree(&self, name: &str) -> Result<(), DatabaseError> {
        self.db.drop_tree(name)?;
        Ok(())
    }

    /// Flushes the engine to disk.
    pub fn flush(&self) -> Result<(), DatabaseError> {
        self.db.flush()?;
        Ok(())
    }
}
