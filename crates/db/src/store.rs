//! The typed ordered store handle.

use crate::{DatabaseError, KeyEncode, Table};
use calder_primitives::packing;
use parking_lot::Mutex;
use std::{collections::BTreeMap, marker::PhantomData, ops::Bound, path::Path};

/// Pending mutations accumulated while write-through is disabled.
/// `None` marks a deletion.
type WriteCache = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// A typed, ordered keyed store over one tree of the embedded engine.
///
/// In steady state every mutation goes straight to the engine. With
/// write-through disabled the store buffers mutations in memory and reads
/// consult the buffer first; re-enabling write-through flushes the buffer.
pub struct IndexStore<T: Table> {
    tree: sled::Tree,
    cache: Mutex<Option<WriteCache>>,
    _table: PhantomData<T>,
}

impl<T: Table> std::fmt::Debug for IndexStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStore").field("table", &T::NAME).finish_non_exhaustive()
    }
}

impl<T: Table> IndexStore<T> {
    pub(crate) fn new(tree: sled::Tree) -> Self {
        Self { tree, cache: Mutex::new(None), _table: PhantomData }
    }

    fn decode_value(bytes: &[u8]) -> Result<T::Value, DatabaseError> {
        packing::unpack(bytes)
            .map_err(|err| DatabaseError::Decode { table: T::NAME, reason: err.to_string() })
    }

    fn decode_key(bytes: &[u8]) -> Result<T::Key, DatabaseError> {
        T::Key::decode_key(bytes).ok_or(DatabaseError::DecodeKey { table: T::NAME })
    }

    /// Inserts or replaces the value under `key`.
    pub fn insert(&self, key: &T::Key, value: &T::Value) -> Result<(), DatabaseError> {
        let raw_key = key.encode_key();
        let raw_value = packing::pack(value);
        let mut cache = self.cache.lock();
        match cache.as_mut() {
            Some(buffer) => {
                buffer.insert(raw_key, Some(raw_value));
            }
            None => {
                self.tree.insert(raw_key, raw_value)?;
            }
        }
        Ok(())
    }

    /// Removes the entry under `key`, if present.
    pub fn remove(&self, key: &T::Key) -> Result<(), DatabaseError> {
        let raw_key = key.encode_key();
        let mut cache = self.cache.lock();
        match cache.as_mut() {
            Some(buffer) => {
                buffer.insert(raw_key, None);
            }
            None => {
                self.tree.remove(raw_key)?;
            }
        }
        Ok(())
    }

    /// The value under `key`, if present.
    pub fn get(&self, key: &T::Key) -> Result<Option<T::Value>, DatabaseError> {
        let raw_key = key.encode_key();
        if let Some(buffer) = self.cache.lock().as_ref() {
            if let Some(entry) = buffer.get(&raw_key) {
                return entry.as_deref().map(Self::decode_value).transpose();
            }
        }
        self.tree.get(raw_key)?.as_deref().map(Self::decode_value).transpose()
    }

    /// The value under `key`, or [`DatabaseError::Missing`].
    pub fn fetch(&self, key: &T::Key) -> Result<T::Value, DatabaseError> {
        self.get(key)?.ok_or(DatabaseError::Missing { table: T::NAME })
    }

    /// `true` if `key` has a value.
    pub fn contains(&self, key: &T::Key) -> Result<bool, DatabaseError> {
        Ok(self.get(key)?.is_some())
    }

    /// Iterates all entries in ascending key order.
    pub fn iter(&self) -> StoreIter<T> {
        self.iter_range(None)
    }

    /// Iterates entries with keys `>= lower` in ascending key order.
    pub fn iter_from(&self, lower: &T::Key) -> StoreIter<T> {
        self.iter_range(Some(lower.encode_key()))
    }

    fn iter_range(&self, lower: Option<Vec<u8>>) -> StoreIter<T> {
        let tree_iter = match &lower {
            Some(bound) => {
                self.tree.range((Bound::Included(bound.clone()), Bound::<Vec<u8>>::Unbounded))
            }
            None => self.tree.iter(),
        };
        let cached: Vec<(Vec<u8>, Option<Vec<u8>>)> = match self.cache.lock().as_ref() {
            Some(buffer) => match &lower {
                Some(bound) => buffer
                    .range::<Vec<u8>, _>((Bound::Included(bound), Bound::Unbounded))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                None => buffer.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            },
            None => Vec::new(),
        };
        StoreIter { tree_iter, tree_peeked: None, cached, cached_pos: 0, _table: PhantomData }
    }

    /// The entry with the smallest key, if any.
    pub fn first(&self) -> Result<Option<(T::Key, T::Value)>, DatabaseError> {
        self.iter().next().transpose()
    }

    /// The entry with the largest key, if any.
    pub fn last(&self) -> Result<Option<(T::Key, T::Value)>, DatabaseError> {
        // Iterating the merged view backwards is only needed here, so the
        // simple linear scan over the (bounded) cache plus the engine's own
        // reverse cursor keeps the merge logic one-directional.
        let cache = self.cache.lock();
        let Some(buffer) = cache.as_ref() else {
            drop(cache);
            return match self.tree.last()? {
                Some((key, value)) => {
                    Ok(Some((Self::decode_key(&key)?, Self::decode_value(&value)?)))
                }
                None => Ok(None),
            };
        };

        // Walk the engine backwards past keys the cache deleted.
        let mut tree_last = None;
        for item in self.tree.iter().rev() {
            let (key, value) = item?;
            match buffer.get(key.as_ref()) {
                // Cache overrides this key; covered by the cache walk below.
                Some(_) => continue,
                None => {
                    tree_last = Some((key.to_vec(), value.to_vec()));
                    break;
                }
            }
        }
        let cache_last = buffer
            .iter()
            .rev()
            .find_map(|(k, v)| v.as_ref().map(|value| (k.clone(), value.clone())));

        let best = match (tree_last, cache_last) {
            (Some(a), Some(b)) => Some(if a.0 >= b.0 { a } else { b }),
            (a, b) => a.or(b),
        };
        match best {
            Some((key, value)) => Ok(Some((Self::decode_key(&key)?, Self::decode_value(&value)?))),
            None => Ok(None),
        }
    }

    /// Number of entries in the merged view.
    pub fn len(&self) -> Result<usize, DatabaseError> {
        if self.cache.lock().is_none() {
            return Ok(self.tree.len());
        }
        let mut count = 0;
        for item in self.iter() {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// `true` when the merged view has no entries.
    pub fn is_empty(&self) -> Result<bool, DatabaseError> {
        Ok(self.first()?.is_none())
    }

    /// Removes every entry, including buffered ones.
    pub fn clear(&self) -> Result<(), DatabaseError> {
        if let Some(buffer) = self.cache.lock().as_mut() {
            buffer.clear();
        }
        self.tree.clear()?;
        Ok(())
    }

    /// Toggles write-through. Disabling starts buffering mutations in memory;
    /// enabling flushes the buffer to the engine.
    pub fn set_write_through(&self, write_through: bool) -> Result<(), DatabaseError> {
        let mut cache = self.cache.lock();
        if write_through {
            if let Some(buffer) = cache.take() {
                for (key, value) in buffer {
                    match value {
                        Some(value) => self.tree.insert(key, value)?,
                        None => self.tree.remove(key)?,
                    };
                }
            }
        } else if cache.is_none() {
            *cache = Some(WriteCache::new());
        }
        Ok(())
    }

    /// Exports the merged view as a JSON array of `{key, value}` objects.
    pub fn export_to_json(&self, path: &Path) -> Result<(), DatabaseError> {
        let mut entries = Vec::new();
        for item in self.iter() {
            let (key, value) = item?;
            entries.push(serde_json::json!({
                "key": serde_json::to_value(&key).map_err(std::io::Error::other)?,
                "value": serde_json::to_value(&value).map_err(std::io::Error::other)?,
            }));
        }
        let rendered = serde_json::to_string_pretty(&entries).map_err(std::io::Error::other)?;
        std::fs::write(path, rendered)?;
        Ok(())
    }
}

/// Ascending merged iterator over the engine tree and the write buffer.
pub struct StoreIter<T: Table> {
    tree_iter: sled::Iter,
    tree_peeked: Option<(Vec<u8>, Vec<u8>)>,
    cached: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    cached_pos: usize,
    _table: PhantomData<T>,
}

impl<T: Table> StoreIter<T> {
    fn peek_tree(&mut self) -> Result<Option<&(Vec<u8>, Vec<u8>)>, DatabaseError> {
        if self.tree_peeked.is_none() {
            self.tree_peeked = match self.tree_iter.next() {
                Some(item) => {
                    let (key, value) = item?;
                    Some((key.to_vec(), value.to_vec()))
                }
                None => None,
            };
        }
        Ok(self.tree_peeked.as_ref())
    }

    fn next_raw(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, DatabaseError> {
        loop {
            let cache_key = self.cached.get(self.cached_pos).map(|(k, _)| k.clone());
            let tree_key = self.peek_tree()?.map(|(k, _)| k.clone());

            match (cache_key, tree_key) {
                (None, None) => return Ok(None),
                (Some(ck), tk) => {
                    let take_cache = match &tk {
                        Some(tk) => ck <= *tk,
                        None => true,
                    };
                    if take_cache {
                        if tk.as_ref() == Some(&ck) {
                            // The buffer overrides this engine entry.
                            self.tree_peeked = None;
                        }
                        let (key, value) = self.cached[self.cached_pos].clone();
                        self.cached_pos += 1;
                        match value {
                            Some(value) => return Ok(Some((key, value))),
                            None => continue, // buffered deletion
                        }
                    } else {
                        return Ok(self.tree_peeked.take());
                    }
                }
                (None, Some(_)) => return Ok(self.tree_peeked.take()),
            }
        }
    }
}

impl<T: Table> Iterator for StoreIter<T> {
    type Item = Result<(T::Key, T::Value), DatabaseError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_raw() {
            Ok(Some((key, value))) => {
                let decoded = IndexStore::<T>::decode_key(&key)
                    .and_then(|k| Ok((k, IndexStore::<T>::decode_value(&value)?)));
                Some(decoded)
            }
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreEnv;

    struct Numbers;

    impl Table for Numbers {
        const NAME: &'static str = "numbers";
        type Key = u32;
        type Value = String;
    }

    fn store() -> (tempfile::TempDir, IndexStore<Numbers>) {
        let dir = tempfile::tempdir().unwrap();
        let env = StoreEnv::open(dir.path()).unwrap();
        let store = env.store::<Numbers>().unwrap();
        (dir, store)
    }

    #[test]
    fn ordered_iteration() {
        let (_dir, store) = store();
        for key in [3u32, 1, 2] {
            store.insert(&key, &key.to_string()).unwrap();
        }
        let keys: Vec<u32> = store.iter().map(|item| item.unwrap().0).collect();
        assert_eq!(keys, vec![1, 2, 3]);

        let from_two: Vec<u32> = store.iter_from(&2).map(|item| item.unwrap().0).collect();
        assert_eq!(from_two, vec![2, 3]);
    }

    #[test]
    fn deferred_writes_are_visible_and_flushed() {
        let (_dir, store) = store();
        store.insert(&1, &"persisted".into()).unwrap();

        store.set_write_through(false).unwrap();
        store.insert(&2, &"buffered".into()).unwrap();
        store.remove(&1).unwrap();

        // The merged view already reflects the buffer.
        assert_eq!(store.get(&2).unwrap().as_deref(), Some("buffered"));
        assert_eq!(store.get(&1).unwrap(), None);
        let keys: Vec<u32> = store.iter().map(|item| item.unwrap().0).collect();
        assert_eq!(keys, vec![2]);

        store.set_write_through(true).unwrap();
        assert_eq!(store.get(&2).unwrap().as_deref(), Some("buffered"));
        assert_eq!(store.get(&1).unwrap(), None);
    }

    #[test]
    fn last_respects_buffered_deletions() {
        let (_dir, store) = store();
        store.insert(&1, &"a".into()).unwrap();
        store.insert(&9, &"z".into()).unwrap();

        store.set_write_through(false).unwrap();
        store.remove(&9).unwrap();
        assert_eq!(store.last().unwrap().unwrap().0, 1);

        store.insert(&12, &"w".into()).unwrap();
        assert_eq!(store.last().unwrap().unwrap().0, 12);
    }

    #[test]
    fn fetch_missing_is_an_error() {
        let (_dir, store) = store();
        assert!(matches!(store.fetch(&42), Err(DatabaseError::Missing { .. })));
    }
}
