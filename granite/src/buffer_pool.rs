//! Manages the buffer pool, a collection of in-memory frames that cache table pages.
//!
//! Pages are addressed by [`PageKey`] and cached in a fixed number of frames,
//! replaced with a clock (second-chance) sweep. A dirty page is written back
//! only after the log is durable up to its `page_lsn`.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace};

use crate::config::EngineConfig;
use crate::failpoint;
use crate::log_manager::LogManager;
use crate::pager::Pager;
use crate::{Oid, Page, PageId, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageKey {
    pub db_oid: Oid,
    pub oid: Oid,
    pub page_id: PageId,
}

impl PageKey {
    pub fn new(db_oid: Oid, oid: Oid, page_id: PageId) -> Self {
        Self {
            db_oid,
            oid,
            page_id,
        }
    }
}

#[derive(Debug, Default)]
struct FrameMeta {
    key: Option<PageKey>,
    is_dirty: bool,
    pin_count: u32,
    recently_used: bool,
}

/// A single frame in the buffer pool.
#[derive(Debug)]
struct Frame {
    page: RwLock<Page>,
    meta: Mutex<FrameMeta>,
}

impl Frame {
    fn pin(&self) {
        let mut meta = self.meta.lock();
        meta.pin_count += 1;
        meta.recently_used = true;
    }
}

#[derive(Debug)]
struct PoolState {
    page_table: HashMap<PageKey, usize>,
    free_list: Vec<usize>,
    clock_hand: usize,
}

/// A pinned page. The frame cannot be evicted while the guard is alive.
pub struct PageGuard {
    key: PageKey,
    frame: Arc<Frame>,
}

impl PageGuard {
    pub fn key(&self) -> PageKey {
        self.key
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.frame.page.read()
    }

    /// Latches the page for modification and marks it dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        let page = self.frame.page.write();
        self.frame.meta.lock().is_dirty = true;
        page
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        let mut meta = self.frame.meta.lock();
        meta.pin_count = meta.pin_count.saturating_sub(1);
    }
}

/// The buffer pool manager.
pub struct BufferPool {
    config: EngineConfig,
    frames: Vec<Arc<Frame>>,
    state: Mutex<PoolState>,
    pagers: Mutex<HashMap<(Oid, Oid), Arc<Mutex<Pager>>>>,
    log_manager: RwLock<Weak<LogManager>>,
}

impl BufferPool {
    pub fn new(config: &EngineConfig) -> Self {
        let frame_count = config.buffer_pool_frames.max(1);
        let frames = (0..frame_count)
            .map(|_| {
                Arc::new(Frame {
                    page: RwLock::new(Page::new(0)),
                    meta: Mutex::new(FrameMeta::default()),
                })
            })
            .collect();
        Self {
            config: config.clone(),
            frames,
            state: Mutex::new(PoolState {
                page_table: HashMap::new(),
                free_list: (0..frame_count).rev().collect(),
                clock_hand: 0,
            }),
            pagers: Mutex::new(HashMap::new()),
            log_manager: RwLock::new(Weak::new()),
        }
    }

    /// Installs the log manager that enforces the WAL rule on write-back.
    pub fn set_log_manager(&self, log_manager: Weak<LogManager>) {
        *self.log_manager.write() = log_manager;
    }

    /// Fetches a page, reading it from its table file if it is not cached.
    pub fn get_page(&self, key: PageKey) -> Result<PageGuard> {
        self.fetch(key, false)
    }

    /// Makes `key` an initialised, empty page, whether or not it was cached.
    pub fn new_page(&self, key: PageKey) -> Result<PageGuard> {
        let guard = self.fetch(key, true)?;
        *guard.write() = Page::new(key.page_id);
        Ok(guard)
    }

    /// Hands out a fresh page id for the table and returns the initialised page.
    pub fn allocate_page(&self, db_oid: Oid, oid: Oid) -> Result<PageGuard> {
        let page_id = self.pager(db_oid, oid)?.lock().allocate_page();
        self.new_page(PageKey::new(db_oid, oid, page_id))
    }

    /// Keeps the id in `key` from being handed out again by `allocate_page`.
    pub fn ensure_allocated(&self, key: PageKey) -> Result<()> {
        self.pager(key.db_oid, key.oid)?
            .lock()
            .ensure_allocated(key.page_id);
        Ok(())
    }

    fn fetch(&self, key: PageKey, init: bool) -> Result<PageGuard> {
        let mut state = self.state.lock();

        // 1. Check if the page is already cached.
        if let Some(&frame_index) = state.page_table.get(&key) {
            let frame = self.frames[frame_index].clone();
            frame.pin();
            return Ok(PageGuard { key, frame });
        }

        // 2. If not, find a free frame or evict one.
        let frame_index = self
            .find_victim_frame(&mut state)
            .ok_or_else(|| io::Error::other("all buffer pool frames are pinned"))?;
        let frame = self.frames[frame_index].clone();
        self.evict(&mut state, frame_index)?;

        // 3. Load the page.
        let page = match self.load(key, init) {
            Ok(page) => page,
            Err(e) => {
                state.free_list.push(frame_index);
                return Err(e);
            }
        };

        // 4. Install it in the frame and the page table.
        *frame.page.write() = page;
        *frame.meta.lock() = FrameMeta {
            key: Some(key),
            is_dirty: init,
            pin_count: 1,
            recently_used: true,
        };
        state.page_table.insert(key, frame_index);
        trace!(?key, frame_index, init, "page loaded");
        Ok(PageGuard { key, frame })
    }

    fn load(&self, key: PageKey, init: bool) -> Result<Page> {
        let pager = self.pager(key.db_oid, key.oid)?;
        let mut pager = pager.lock();
        if init {
            pager.ensure_allocated(key.page_id);
            Ok(Page::new(key.page_id))
        } else {
            let page = pager.read_page(key.page_id)?;
            Ok(page)
        }
    }

    fn find_victim_frame(&self, state: &mut PoolState) -> Option<usize> {
        if let Some(frame_index) = state.free_list.pop() {
            return Some(frame_index);
        }

        let frame_count = self.frames.len();
        // Two full passes: the first can clear second-chance bits, the second picks a victim.
        for _ in 0..(frame_count * 2) {
            let frame_index = state.clock_hand;
            state.clock_hand = (state.clock_hand + 1) % frame_count;

            let mut meta = self.frames[frame_index].meta.lock();
            if meta.pin_count == 0 {
                if meta.recently_used {
                    meta.recently_used = false;
                } else {
                    return Some(frame_index);
                }
            }
        }

        None
    }

    /// Writes back the victim if it is dirty and unmaps it.
    fn evict(&self, state: &mut PoolState, frame_index: usize) -> Result<()> {
        let frame = &self.frames[frame_index];
        let (old_key, is_dirty) = {
            let meta = frame.meta.lock();
            (meta.key, meta.is_dirty)
        };
        if let Some(old_key) = old_key {
            if is_dirty {
                debug!(key = ?old_key, "evicting dirty page");
                if let Err(e) = self.write_back(old_key, frame) {
                    // Leave the victim cached so its changes are not lost.
                    frame.meta.lock().recently_used = true;
                    return Err(e);
                }
            }
            state.page_table.remove(&old_key);
            frame.meta.lock().key = None;
        }
        Ok(())
    }

    /// Writes a frame to its table file under the WAL rule.
    fn write_back(&self, key: PageKey, frame: &Frame) -> Result<()> {
        let page = frame.page.read();
        let pager = self.pager(key.db_oid, key.oid)?;
        let write = || -> Result<()> {
            failpoint::maybe_fail(failpoint::PAGE_WRITE)?;
            pager.lock().write_page(&page)?;
            Ok(())
        };
        let log_manager = self.log_manager.read().upgrade();
        match log_manager {
            Some(log) => log.flush_page(key.oid, key.page_id, page.table().page_lsn(), write)?,
            None => write()?,
        }
        frame.meta.lock().is_dirty = false;
        Ok(())
    }

    /// Writes the page back if it is cached and dirty.
    pub fn flush_page(&self, key: PageKey) -> Result<()> {
        let frame = {
            let state = self.state.lock();
            match state.page_table.get(&key) {
                Some(&frame_index) => {
                    let frame = self.frames[frame_index].clone();
                    frame.pin();
                    frame
                }
                None => return Ok(()),
            }
        };
        let guard = PageGuard { key, frame };
        if guard.frame.meta.lock().is_dirty {
            self.write_back(key, &guard.frame)?;
        }
        Ok(())
    }

    pub fn flush_all(&self) -> Result<()> {
        let mut keys: Vec<PageKey> = self.state.lock().page_table.keys().copied().collect();
        keys.sort();
        for key in keys {
            self.flush_page(key)?;
        }
        Ok(())
    }

    /// Keys of cached pages with unwritten changes.
    pub fn dirty_pages(&self) -> Vec<PageKey> {
        let mut dirty: Vec<PageKey> = self
            .frames
            .iter()
            .filter_map(|frame| {
                let meta = frame.meta.lock();
                if meta.is_dirty {
                    meta.key
                } else {
                    None
                }
            })
            .collect();
        dirty.sort();
        dirty
    }

    /// Discards every frame without writing anything back, as a crash would.
    pub fn drop_all(&self) {
        let mut state = self.state.lock();
        for frame in &self.frames {
            *frame.meta.lock() = FrameMeta::default();
        }
        state.page_table.clear();
        state.free_list = (0..self.frames.len()).rev().collect();
        state.clock_hand = 0;
        self.pagers.lock().clear();
        debug!("dropped all frames");
    }

    fn pager(&self, db_oid: Oid, oid: Oid) -> Result<Arc<Mutex<Pager>>> {
        let mut pagers = self.pagers.lock();
        if let Some(pager) = pagers.get(&(db_oid, oid)) {
            return Ok(pager.clone());
        }
        let pager = Pager::open(
            self.config.table_path(db_oid, oid),
            self.config.sync_writes,
        )?;
        let pager = Arc::new(Mutex::new(pager));
        pagers.insert((db_oid, oid), pager.clone());
        Ok(pager)
    }
}
