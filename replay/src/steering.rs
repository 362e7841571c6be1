//! Aperture steering
//!
//! During its own init the runtime reserves large SVM apertures at addresses
//! it picks heuristically from the live VA layout. If that heuristic lands
//! on a captured region, the later strict reservation relocates and the
//! capture's device pointers dangle. The workaround: before init, occupy
//! every captured range with an anonymous `PROT_NONE` mapping placed with
//! `MAP_FIXED_NOREPLACE`, so the heuristic routes around them; after init,
//! release the placeholders and hand the now-free ranges to the runtime's
//! strict reservation.
//!
//! Placement failures are ignored on purpose: a range the kernel refuses
//! here will fail loudly at reservation time, with a better message.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use tracing::{debug, warn};

use crate::plan::RegionPlan;

/// Successful placeholder mappings, released after runtime init.
pub struct Placeholders {
    mappings: Vec<(NonNull<c_void>, usize)>,
}

impl Placeholders {
    /// Attempt a placeholder for every planned region.
    pub fn reserve(plans: &[RegionPlan]) -> Self {
        let mut mappings = Vec::with_capacity(plans.len());
        for plan in plans {
            match place(plan.aligned_base, plan.aligned_size) {
                Some(mapping) => {
                    debug!(
                        "placeholder at {:#x} (+{:#x})",
                        plan.aligned_base, plan.aligned_size
                    );
                    mappings.push((mapping, plan.aligned_size));
                }
                None => warn!(
                    "could not place a placeholder at {:#x}; the runtime may claim it",
                    plan.aligned_base
                ),
            }
        }
        Self { mappings }
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Unmap every placeholder, freeing the ranges for strict reservation.
    pub fn release(mut self) {
        for (addr, len) in self.mappings.drain(..) {
            if let Err(e) = unsafe { munmap(addr, len) } {
                warn!("failed to release placeholder at {:p}: {e}", addr.as_ptr());
            }
        }
    }
}

impl Drop for Placeholders {
    fn drop(&mut self) {
        // Backstop for early-error paths; `release` drains on the happy path.
        for (addr, len) in self.mappings.drain(..) {
            let _ = unsafe { munmap(addr, len) };
        }
    }
}

fn place(base: u64, size: usize) -> Option<NonNull<c_void>> {
    let addr = NonZeroUsize::new(base as usize)?;
    let length = NonZeroUsize::new(size)?;
    let mapping = unsafe {
        mmap_anonymous(
            Some(addr),
            length,
            ProtFlags::PROT_NONE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED_NOREPLACE,
        )
    }
    .ok()?;

    // Kernels without MAP_FIXED_NOREPLACE support fall back to hint
    // placement; a mapping anywhere else is useless as a placeholder.
    if mapping.as_ptr() as u64 != base {
        let _ = unsafe { munmap(mapping, size) };
        return None;
    }
    Some(mapping)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::RegionPlan;
    use isolate_shared::RegionRecord;

    /// Find a VA range the kernel considers free by mapping without a hint,
    /// then releasing it.
    fn free_range(size: usize) -> u64 {
        let mapping = unsafe {
            mmap_anonymous(
                None,
                NonZeroUsize::new(size).unwrap(),
                ProtFlags::PROT_NONE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .unwrap();
        let base = mapping.as_ptr() as u64;
        unsafe { munmap(mapping, size).unwrap() };
        base
    }

    fn plan_at(base: u64, size: u64) -> RegionPlan {
        RegionPlan::new(RegionRecord {
            base,
            size,
            is_pool: false,
            is_vmem: true,
            handle: 0,
            access: 3,
        })
    }

    #[test]
    fn placeholder_occupies_then_frees_the_range() {
        let size = 2 * 4096;
        let base = free_range(size);

        let placeholders = Placeholders::reserve(&[plan_at(base, size as u64)]);
        assert_eq!(placeholders.len(), 1);

        // While held, a non-replacing mapping of the same range must fail.
        assert!(place(base, size).is_none());

        placeholders.release();

        // Released: the range is free again.
        let reclaimed = place(base, size).expect("range should be free after release");
        unsafe { munmap(reclaimed, size).unwrap() };
    }

    #[test]
    fn occupied_range_is_skipped_not_fatal() {
        let size = 4096;
        let base = free_range(size);
        let holder = place(base, size).unwrap();

        let placeholders = Placeholders::reserve(&[plan_at(base, size as u64)]);
        assert!(placeholders.is_empty());
        placeholders.release();

        unsafe { munmap(holder, size).unwrap() };
    }
}
