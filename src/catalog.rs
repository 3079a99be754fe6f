use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{DbError, Result};
use crate::heap_file::PageStore;
use crate::TableId;

/// Registry of the page stores backing each table.
///
/// Injected into the buffer pool rather than reached through a process-wide
/// handle, so independent databases can be stood up side by side.
#[derive(Default)]
pub struct Catalog {
    files: RwLock<HashMap<TableId, Arc<dyn PageStore>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the store backing `table_id`.
    pub fn register_file(&self, table_id: TableId, file: Arc<dyn PageStore>) {
        self.files.write().insert(table_id, file);
    }

    pub fn file_for(&self, table_id: TableId) -> Result<Arc<dyn PageStore>> {
        self.files
            .read()
            .get(&table_id)
            .cloned()
            .ok_or(DbError::UnknownTable(table_id))
    }
}
