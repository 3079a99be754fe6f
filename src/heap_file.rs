use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{lock_recover, Result};
use crate::page::{Page, PageId};
use crate::{TableId, PAGE_SIZE};

/// The page I/O capability the buffer pool reads through and flushes
/// through. One store per table, registered in the
/// [`Catalog`](crate::catalog::Catalog).
pub trait PageStore: Send + Sync {
    /// Reads the page-sized block at `pid`'s offset into a fresh, clean page.
    fn read_page(&self, pid: PageId) -> Result<Page>;

    /// Writes the page's bytes at its offset, durably before returning.
    fn write_page(&self, page: &Page) -> Result<()>;
}

/// A heap file: contiguous fixed-size pages in a single on-disk file.
pub struct HeapFile {
    table_id: TableId,
    file: Mutex<File>,
}

impl HeapFile {
    pub fn open<P: AsRef<Path>>(table_id: TableId, path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        crate::basalt_debug_log!("[HeapFile::open] table {table_id} at {path_ref:?}");
        if let Some(parent) = path_ref.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path_ref)?;
        Ok(Self {
            table_id,
            file: Mutex::new(file),
        })
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    /// Number of whole pages currently in the backing file.
    pub fn num_pages(&self) -> Result<u32> {
        let file = lock_recover(&self.file);
        Ok((file.metadata()?.len() / PAGE_SIZE as u64) as u32)
    }
}

impl PageStore for HeapFile {
    fn read_page(&self, pid: PageId) -> Result<Page> {
        let offset = pid.page_no() as u64 * PAGE_SIZE as u64;
        let mut data = [0u8; PAGE_SIZE];
        let mut file = lock_recover(&self.file);
        file.seek(SeekFrom::Start(offset))?;
        // A read short of PAGE_SIZE, or past the end of the file, leaves the
        // tail of the buffer zeroed.
        let bytes_read = file.read(&mut data)?;
        crate::basalt_debug_log!("[HeapFile::read_page] {pid:?}: {bytes_read} byte(s) from disk");
        Ok(Page::with_data(pid, data))
    }

    fn write_page(&self, page: &Page) -> Result<()> {
        let pid = page.id();
        let offset = pid.page_no() as u64 * PAGE_SIZE as u64;
        let mut file = lock_recover(&self.file);
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&page.data()[..])?;
        file.sync_all()?;
        crate::basalt_debug_log!("[HeapFile::write_page] wrote {pid:?}");
        Ok(())
    }
}
