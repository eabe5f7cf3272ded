//! In-enclave page cache over the untrusted page store.
//!
//! The cache is split into stripes by page-number modulus. Each stripe
//! tracks its loaded pages, a least-recently-unpinned eviction list and a
//! byte budget. Handles are pin tokens: while a handle exists the page
//! cannot be evicted, and dropping the last handle re-inserts the page at
//! the head of the eviction list.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};

use crate::error::{CResult, Error};
use crate::page::{page_filename, PageStore};
use crate::types::PageNo;

const NUM_STRIPES: usize = 32;

/// Fraction of the stripe budget eviction shrinks the cache down to.
const EVICT_TARGET: f64 = 0.8;

/// A page that can live in the buffer cache.
///
/// Pages use interior mutability for their contents; mutations go through
/// shared references under the owning shard or stripe lock.
pub trait PageType: Send + Sync + 'static {
    fn from_bytes(page_no: PageNo, bytes: &[u8]) -> CResult<Self>
    where
        Self: Sized;

    fn to_bytes(&self) -> CResult<Vec<u8>>;

    /// Memory the page currently occupies, for the eviction budget.
    fn byte_size(&self) -> usize;
}

/// Pages that embed a logical version number in their serialized form.
/// Used for staleness detection on downstream replicas.
pub trait Versioned {
    fn page_version(&self) -> u32;
}

trait CachedPage: Send + Sync {
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn to_bytes(&self) -> CResult<Vec<u8>>;
    fn byte_size(&self) -> usize;
}

impl<T: PageType> CachedPage for T {
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn to_bytes(&self) -> CResult<Vec<u8>> {
        PageType::to_bytes(self)
    }

    fn byte_size(&self) -> usize {
        PageType::byte_size(self)
    }
}

struct PageMeta {
    page_no: PageNo,
    pins: AtomicU32,
    dirty: AtomicBool,
    size: AtomicUsize,
    page: Mutex<Arc<dyn CachedPage>>,
}

impl PageMeta {
    fn current(&self) -> Arc<dyn CachedPage> {
        self.page.lock().unwrap().clone()
    }
}

struct Stripe {
    metas: RwLock<HashMap<PageNo, Arc<PageMeta>>>,
    evict_list: Mutex<VecDeque<PageNo>>,
    evict_cond: Condvar,
    loaded_size: AtomicUsize,
    budget: usize,
}

impl Stripe {
    fn new(budget: usize) -> Self {
        Self {
            metas: RwLock::new(HashMap::new()),
            evict_list: Mutex::new(VecDeque::new()),
            evict_cond: Condvar::new(),
            loaded_size: AtomicUsize::new(0),
            budget,
        }
    }

    fn pin(&self, meta: &PageMeta) {
        let old = meta.pins.fetch_add(1, Ordering::SeqCst);
        if old == 0 {
            let mut list = self.evict_list.lock().unwrap();
            list.retain(|no| *no != meta.page_no);
        }
    }

    fn unpin(&self, meta: &PageMeta) {
        let old = meta.pins.fetch_sub(1, Ordering::SeqCst);
        assert!(old > 0, "unpin without pin");
        if old == 1 {
            let mut list = self.evict_list.lock().unwrap();
            if !list.contains(&meta.page_no) {
                list.push_front(meta.page_no);
                self.evict_cond.notify_all();
            }
        }
    }
}

/// Cache of deserialized pages, shared by every subsystem that touches the
/// page store.
pub struct BufferManager {
    weak_self: Weak<BufferManager>,
    store: Arc<dyn PageStore>,
    prefix: String,
    stripes: Vec<Stripe>,
    next_page_no: AtomicU32,
}

impl BufferManager {
    pub fn new(store: Arc<dyn PageStore>, prefix: &str, buffer_size: usize) -> Arc<Self> {
        let stripes = (0..NUM_STRIPES).map(|_| Stripe::new(buffer_size / NUM_STRIPES)).collect();

        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            store,
            prefix: prefix.to_string(),
            stripes,
            next_page_no: AtomicU32::new(1),
        })
    }

    fn arc(&self) -> Arc<BufferManager> {
        self.weak_self.upgrade().expect("buffer manager already dropped")
    }

    pub fn is_remote(&self) -> bool {
        self.store.is_remote()
    }

    /// Direct access to the backing store, e.g. to serve a downstream
    /// replica's page reads.
    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.store
    }

    fn stripe(&self, page_no: PageNo) -> &Stripe {
        &self.stripes[page_no as usize % NUM_STRIPES]
    }

    fn page_name(&self, page_no: PageNo) -> String {
        page_filename(&self.prefix, page_no)
    }

    /// Allocate a fresh page number and insert the given page, pinned.
    pub fn new_page<T: PageType>(&self, build: impl FnOnce(PageNo) -> T) -> CResult<PageHandle<T>> {
        let page_no = self.next_page_no.fetch_add(1, Ordering::SeqCst);
        let page = Arc::new(build(page_no));
        let size = PageType::byte_size(&*page);

        let meta = Arc::new(PageMeta {
            page_no,
            pins: AtomicU32::new(1),
            dirty: AtomicBool::new(true),
            size: AtomicUsize::new(size),
            page: Mutex::new(page.clone()),
        });

        let stripe = self.stripe(page_no);
        stripe.metas.write().unwrap().insert(page_no, meta.clone());
        stripe.loaded_size.fetch_add(size, Ordering::SeqCst);
        self.check_evict(page_no);

        Ok(PageHandle { page, meta, buffer: self.arc() })
    }

    /// Returns a pinned handle to the page, loading it from the store if
    /// it is not cached.
    pub fn get_page<T: PageType>(&self, page_no: PageNo) -> CResult<PageHandle<T>> {
        let stripe = self.stripe(page_no);

        loop {
            if let Some(meta) = stripe.metas.read().unwrap().get(&page_no).cloned() {
                stripe.pin(&meta);
                return self.handle_from(meta);
            }

            // Not cached. Load outside any stripe lock, then race to insert.
            let page = Arc::new(self.load::<T>(page_no)?);
            let size = PageType::byte_size(&*page);

            let meta = Arc::new(PageMeta {
                page_no,
                pins: AtomicU32::new(1),
                dirty: AtomicBool::new(false),
                size: AtomicUsize::new(size),
                page: Mutex::new(page.clone()),
            });

            {
                let mut metas = stripe.metas.write().unwrap();
                if metas.contains_key(&page_no) {
                    // Someone else loaded it first; use theirs.
                    continue;
                }
                metas.insert(page_no, meta.clone());
            }
            stripe.loaded_size.fetch_add(size, Ordering::SeqCst);
            self.check_evict(page_no);

            return Ok(PageHandle { page, meta, buffer: self.arc() });
        }
    }

    /// Like `get_page` but only returns cached pages.
    pub fn get_page_if_cached<T: PageType>(&self, page_no: PageNo) -> CResult<Option<PageHandle<T>>> {
        let stripe = self.stripe(page_no);
        match stripe.metas.read().unwrap().get(&page_no).cloned() {
            Some(meta) => {
                stripe.pin(&meta);
                Ok(Some(self.handle_from(meta)?))
            }
            None => Ok(None),
        }
    }

    /// Fetch a page, requiring at least `expected` as its embedded version.
    ///
    /// Smaller versions are dropped and reloaded (on a replica the upstream
    /// may still be pushing the write, so we keep retrying); a version
    /// larger than expected means the caller's knowledge is stale and is an
    /// error.
    pub fn get_page_versioned<T>(&self, page_no: PageNo, expected: u32) -> CResult<PageHandle<T>>
    where
        T: PageType + Versioned,
    {
        let remote = self.is_remote();

        loop {
            let hdl = self.get_page::<T>(page_no)?;
            let version = hdl.page_version();

            if version == expected {
                return Ok(hdl);
            } else if version > expected {
                return Err(Error::Staleness(format!(
                    "page {} has version {}, expected {}",
                    page_no, version, expected
                )));
            }

            drop(hdl);
            self.reload::<T>(page_no)?;

            if !remote {
                let hdl = self.get_page::<T>(page_no)?;
                let version = hdl.page_version();
                if version < expected {
                    return Err(Error::Staleness(format!(
                        "page {} stuck at version {}, expected {}",
                        page_no, version, expected
                    )));
                }
                if version > expected {
                    return Err(Error::Staleness(format!(
                        "page {} has version {}, expected {}",
                        page_no, version, expected
                    )));
                }
                return Ok(hdl);
            }
        }
    }

    /// Mark the page dirty and refresh its size accounting.
    pub fn mark_page_dirty(&self, page_no: PageNo) {
        let stripe = self.stripe(page_no);
        let meta = match stripe.metas.read().unwrap().get(&page_no).cloned() {
            Some(meta) => meta,
            None => {
                log::error!("mark_page_dirty: page {} is not cached", page_no);
                return;
            }
        };

        meta.dirty.store(true, Ordering::SeqCst);
        let new_size = meta.current().byte_size();
        let old_size = meta.size.swap(new_size, Ordering::SeqCst);
        if new_size >= old_size {
            stripe.loaded_size.fetch_add(new_size - old_size, Ordering::SeqCst);
        } else {
            stripe.loaded_size.fetch_sub(old_size - new_size, Ordering::SeqCst);
        }
    }

    /// Write the page through to the store if it is dirty.
    pub fn flush_page(&self, page_no: PageNo) -> CResult<()> {
        let meta = match self.stripe(page_no).metas.read().unwrap().get(&page_no).cloned() {
            Some(meta) => meta,
            None => return Ok(()),
        };
        self.flush_meta(&meta)
    }

    pub fn flush_all_pages(&self) -> CResult<()> {
        for stripe in &self.stripes {
            let metas: Vec<_> = stripe.metas.read().unwrap().values().cloned().collect();
            for meta in metas {
                self.flush_meta(&meta)?;
            }
        }
        Ok(())
    }

    fn flush_meta(&self, meta: &PageMeta) -> CResult<()> {
        if meta.dirty.swap(false, Ordering::SeqCst) {
            let bytes = meta.current().to_bytes()?;
            self.store.write(&self.page_name(meta.page_no), &bytes)?;
        }
        Ok(())
    }

    /// Drop the cached copy without writing it back. Used by replicas when
    /// the upstream invalidates a page.
    pub fn discard_cache(&self, page_no: PageNo) {
        let stripe = self.stripe(page_no);
        let mut metas = stripe.metas.write().unwrap();

        if let Some(meta) = metas.get(&page_no).cloned() {
            if meta.pins.load(Ordering::SeqCst) != 0 {
                log::error!("cannot discard pinned page {}", page_no);
                return;
            }

            stripe.evict_list.lock().unwrap().retain(|no| *no != page_no);
            stripe.loaded_size.fetch_sub(meta.size.load(Ordering::SeqCst), Ordering::SeqCst);
            metas.remove(&page_no);
        }
    }

    /// Drop the cached copy and remove the page from the untrusted store.
    pub fn delete_page(&self, page_no: PageNo) -> CResult<()> {
        self.discard_cache(page_no);
        self.store.remove(&self.page_name(page_no))
    }

    /// Flush and unload every unpinned page.
    pub fn clear_cache(&self) -> CResult<()> {
        for stripe in &self.stripes {
            let mut metas = stripe.metas.write().unwrap();
            let mut list = stripe.evict_list.lock().unwrap();

            let unpinned: Vec<_> = metas
                .values()
                .filter(|m| m.pins.load(Ordering::SeqCst) == 0)
                .cloned()
                .collect();

            for meta in unpinned {
                self.flush_meta(&meta)?;
                list.retain(|no| *no != meta.page_no);
                stripe.loaded_size.fetch_sub(meta.size.load(Ordering::SeqCst), Ordering::SeqCst);
                metas.remove(&meta.page_no);
            }

            let remaining = metas.len();
            if remaining > 0 {
                log::info!("after clear_cache: {} pinned pages remain in stripe", remaining);
            }
        }
        Ok(())
    }

    /// Replace the cached copy with a freshly deserialized one.
    ///
    /// Outstanding handles keep the old value alive and keep observing it;
    /// they pick up the new contents on their next page fetch.
    pub fn reload<T: PageType>(&self, page_no: PageNo) -> CResult<()> {
        let meta = match self.stripe(page_no).metas.read().unwrap().get(&page_no).cloned() {
            Some(meta) => meta,
            None => return Ok(()), // next get_page loads fresh anyway
        };

        let page = Arc::new(self.load::<T>(page_no)?);
        let new_size = PageType::byte_size(&*page);

        let stripe = self.stripe(page_no);
        let old_size = meta.size.swap(new_size, Ordering::SeqCst);
        *meta.page.lock().unwrap() = page;
        meta.dirty.store(false, Ordering::SeqCst);

        if new_size >= old_size {
            stripe.loaded_size.fetch_add(new_size - old_size, Ordering::SeqCst);
        } else {
            stripe.loaded_size.fetch_sub(old_size - new_size, Ordering::SeqCst);
        }
        Ok(())
    }

    fn load<T: PageType>(&self, page_no: PageNo) -> CResult<T> {
        let name = self.page_name(page_no);
        let bytes = self
            .store
            .read(&name)?
            .ok_or_else(|| Error::Internal(format!("no such page: {}", name)))?;
        T::from_bytes(page_no, &bytes)
    }

    fn handle_from<T: PageType>(&self, meta: Arc<PageMeta>) -> CResult<PageHandle<T>> {
        let page = meta
            .current()
            .as_any_arc()
            .downcast::<T>()
            .map_err(|_| Error::Internal(format!("page {} has unexpected type", meta.page_no)))?;
        Ok(PageHandle { page, meta, buffer: self.arc() })
    }

    /// Evict pages until the stripe is back under its target size.
    ///
    /// Blocks on the stripe condvar if everything is pinned; pinned callers
    /// never evict, so this cannot deadlock them.
    fn check_evict(&self, page_no: PageNo) {
        let stripe = self.stripe(page_no);
        if stripe.loaded_size.load(Ordering::SeqCst) < stripe.budget {
            return;
        }

        let target = (stripe.budget as f64 * EVICT_TARGET) as usize;

        while stripe.loaded_size.load(Ordering::SeqCst) > target {
            let victim = {
                let mut list = stripe.evict_list.lock().unwrap();
                loop {
                    if let Some(no) = list.pop_back() {
                        break no;
                    }
                    if stripe.loaded_size.load(Ordering::SeqCst) <= target {
                        return;
                    }
                    list = stripe.evict_cond.wait(list).unwrap();
                }
            };

            let mut metas = stripe.metas.write().unwrap();
            let meta = match metas.get(&victim).cloned() {
                Some(meta) => meta,
                None => continue,
            };
            if meta.pins.load(Ordering::SeqCst) != 0 {
                // Re-pinned between list pop and here; skip it.
                continue;
            }

            if let Err(err) = self.flush_meta(&meta) {
                log::error!("failed to flush page {} during eviction: {}", victim, err);
                stripe.evict_list.lock().unwrap().push_front(victim);
                return;
            }

            stripe.loaded_size.fetch_sub(meta.size.load(Ordering::SeqCst), Ordering::SeqCst);
            metas.remove(&victim);
        }
    }

    fn unpin(&self, meta: &PageMeta) {
        self.stripe(meta.page_no).unpin(meta);
    }
}

/// A pinned reference to a cached page.
pub struct PageHandle<T: PageType> {
    page: Arc<T>,
    meta: Arc<PageMeta>,
    buffer: Arc<BufferManager>,
}

impl<T: PageType> std::fmt::Debug for PageHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle")
            .field("page_no", &self.meta.page_no)
            .finish()
    }
}

impl<T: PageType> PageHandle<T> {
    pub fn page_no(&self) -> PageNo {
        self.meta.page_no
    }

    pub fn mark_dirty(&self) {
        self.buffer.mark_page_dirty(self.meta.page_no);
    }

    pub fn flush(&self) -> CResult<()> {
        self.buffer.flush_page(self.meta.page_no)
    }
}

impl<T: PageType> std::ops::Deref for PageHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.page
    }
}

impl<T: PageType> Clone for PageHandle<T> {
    fn clone(&self) -> Self {
        self.buffer.stripe(self.meta.page_no).pin(&self.meta);
        Self { page: self.page.clone(), meta: self.meta.clone(), buffer: self.buffer.clone() }
    }
}

impl<T: PageType> Drop for PageHandle<T> {
    fn drop(&mut self) {
        self.buffer.unpin(&self.meta);
    }
}
