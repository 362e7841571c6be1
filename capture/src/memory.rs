//! Device-memory region tracker
//!
//! A flat, preallocated list of live device regions. Hooks run on the
//! runtime's own threads, and growing a container there can re-enter an
//! allocator that is itself hooked on some runtimes — so the list never grows
//! past its preallocated capacity and an overflowing insert drops the region
//! and bumps a counter instead of blocking. Removal is swap-with-last to keep
//! the hot paths constant-time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Preallocated region capacity. Inserts beyond it are dropped.
pub const REGION_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Born from a memory-pool allocation; dies on pool-free.
    Pool,
    /// Born from a vmem address reservation; mapped and unmapped explicitly.
    Vmem,
}

/// A contiguous range of device virtual addresses.
#[derive(Debug, Clone, Copy)]
pub struct DeviceRegion {
    pub base: u64,
    pub size: usize,
    pub kind: RegionKind,
    /// Backing allocation handle for mapped vmem regions; 0 while a vmem
    /// region is reserved but unmapped, always 0 for pool regions.
    pub handle: u64,
    /// Accumulated OR of permission bits granted via set-access.
    pub access_mask: u32,
}

struct Regions {
    list: Vec<DeviceRegion>,
    /// Live vmem backing handles, between handle-create and handle-release.
    handles: Vec<u64>,
}

pub struct RegionTracker {
    inner: Mutex<Regions>,
    dropped: AtomicU64,
}

impl RegionTracker {
    pub fn new() -> Self {
        Self::with_capacity(REGION_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Regions {
                list: Vec::with_capacity(capacity),
                handles: Vec::with_capacity(capacity),
            }),
            dropped: AtomicU64::new(0),
        }
    }

    fn insert(&self, region: DeviceRegion) {
        let mut inner = self.inner.lock().unwrap();
        if inner.list.len() == inner.list.capacity() {
            drop(inner);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        inner.list.push(region);
    }

    pub fn insert_pool(&self, base: u64, size: usize) {
        self.insert(DeviceRegion {
            base,
            size,
            kind: RegionKind::Pool,
            handle: 0,
            access_mask: 0,
        });
    }

    pub fn insert_reserved(&self, base: u64, size: usize) {
        self.insert(DeviceRegion {
            base,
            size,
            kind: RegionKind::Vmem,
            handle: 0,
            access_mask: 0,
        });
    }

    /// Remove the region whose base matches exactly. Live regions never
    /// overlap, so at most one can match.
    pub fn remove(&self, base: u64) -> Option<DeviceRegion> {
        let mut inner = self.inner.lock().unwrap();
        let pos = inner.list.iter().position(|r| r.base == base)?;
        Some(inner.list.swap_remove(pos))
    }

    /// A mapping landed on a reserved vmem range: attach the backing handle
    /// and the final mapped size.
    pub fn attach_mapping(&self, base: u64, size: usize, handle: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(region) = inner
            .list
            .iter_mut()
            .find(|r| r.kind == RegionKind::Vmem && r.base == base)
        {
            region.handle = handle;
            region.size = size;
        }
    }

    pub fn grant_access(&self, base: u64, mask: u32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(region) = inner
            .list
            .iter_mut()
            .find(|r| r.kind == RegionKind::Vmem && r.base == base)
        {
            region.access_mask |= mask;
        }
    }

    pub fn record_handle_created(&self, handle: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.handles.len() < inner.handles.capacity() {
            inner.handles.push(handle);
        }
    }

    pub fn record_handle_released(&self, handle: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner.handles.iter().position(|&h| h == handle) {
            inner.handles.swap_remove(pos);
        }
    }

    /// Consistent copy of the live region list, taken under the lock. The
    /// caller does its I/O and device copies outside.
    pub fn snapshot(&self) -> Vec<DeviceRegion> {
        self.inner.lock().unwrap().list.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Regions dropped because the tracker was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for RegionTracker {
    fn default() -> Self {
        Self::new()
    }
}
