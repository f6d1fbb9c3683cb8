use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

/// Volatile backend used by tests and `--backend memory`.
///
/// Each column is its own ordered table; a batch takes the single write lock,
/// so readers never see half of one.
pub struct MemoryStore {
    tables: RwLock<Vec<Table>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            tables: RwLock::new(vec![Table::new(); Column::ALL.len()]),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows currently held in `column`.
    pub fn len(&self, column: Column) -> usize {
        self.read()
            .map(|tables| tables[column.index()].len())
            .unwrap_or(0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Vec<Table>>, StoreError> {
        self.tables.read().map_err(|_| poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<Table>>, StoreError> {
        self.tables.write().map_err(|_| poisoned())
    }
}

fn poisoned() -> StoreError {
    StoreError::Backend("memory store lock poisoned".to_string())
}

fn with_prefix<'a>(
    table: &'a Table,
    prefix: &'a [u8],
) -> impl Iterator<Item = (&'a Vec<u8>, &'a Vec<u8>)> + 'a {
    table
        .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
        .take_while(move |(key, _)| key.starts_with(prefix))
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.read()?[column.index()].get(key).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.write()?[column.index()].insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.write()?[column.index()].remove(key);
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let tables = self.read()?;
        Ok(with_prefix(&tables[column.index()], prefix)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let tables = self.read()?;
        for (key, value) in with_prefix(&tables[column.index()], prefix) {
            if !visitor(key, value)? {
                break;
            }
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    tables[column.index()].insert(key.as_slice().to_vec(), value.as_slice().to_vec());
                }
                WriteOp::Delete { column, key } => {
                    tables[column.index()].remove(key.as_slice());
                }
            }
        }
        Ok(())
    }
}
