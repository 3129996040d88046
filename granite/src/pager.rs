//! The Pager is responsible for reading and writing the pages of one table file.
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::debug;

use crate::{Page, PageId, PAGE_SIZE};

/// Reads and writes pages of a single table file; page `n` lives at `n * PAGE_SIZE`.
pub struct Pager {
    file: File,
    num_pages: u32,
    sync_writes: bool,
}

impl Pager {
    /// Opens the table file, creating it and its parent directories if they don't exist.
    pub fn open<P: AsRef<Path>>(path: P, sync_writes: bool) -> io::Result<Self> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path_ref)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as u32;
        debug!(path = ?path_ref, file_size, num_pages, "opened table file");

        Ok(Self {
            file,
            num_pages,
            sync_writes,
        })
    }

    /// Number of page ids handed out so far, written or not.
    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    /// Reads a page from the file. A page beyond the end of the file reads as a
    /// new, initialised page.
    pub fn read_page(&mut self, page_id: PageId) -> io::Result<Page> {
        let mut page = Page::new(page_id);
        let offset = page_id as u64 * PAGE_SIZE as u64;
        if offset >= self.file.metadata()?.len() {
            return Ok(page);
        }

        self.file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < PAGE_SIZE {
            let n = self.file.read(&mut page.data[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled < PAGE_SIZE {
            // A short tail can only come from a torn extension; treat it as unwritten.
            debug!(page_id, filled, "short read, using fresh page");
            page = Page::new(page_id);
        } else if page.data.iter().all(|&b| b == 0) {
            // A hole left by a later page being written first.
            page = Page::new(page_id);
        }
        Ok(page)
    }

    /// Writes a page to the file.
    pub fn write_page(&mut self, page: &Page) -> io::Result<()> {
        let offset = page.id as u64 * PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&page.data)?;
        if self.sync_writes {
            self.file.sync_data()?;
        }
        self.ensure_allocated(page.id);
        Ok(())
    }

    /// Hands out the next page id. Ids are never reused.
    pub fn allocate_page(&mut self) -> PageId {
        let page_id = self.num_pages;
        self.num_pages += 1;
        debug!(page_id, num_pages = self.num_pages, "allocated page");
        page_id
    }

    /// Makes sure `page_id` will not be handed out by `allocate_page`.
    pub fn ensure_allocated(&mut self, page_id: PageId) {
        if page_id >= self.num_pages {
            self.num_pages = page_id + 1;
        }
    }
}
