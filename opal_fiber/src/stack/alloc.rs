//! Stack allocation and the size-class cache.
//!
//! Stacks come in geometric size classes: class `k` holds
//! `fiber_words << k` words. Freed class-sized segments go on a private
//! LIFO free list per class and are handed back verbatim on the next
//! request for that exact class, keeping fiber churn off the system
//! allocator. Requests larger than the top class are sized exactly and
//! never pooled.
//!
//! The allocator belongs to one execution unit; the cache is therefore
//! unlocked. Only the id source is shared across units.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::FiberConfig;
use crate::effects::FiberError;
use crate::memory::StackRegion;
use crate::stack::{HandlerTriple, StackBox, StackSegment};
use crate::stats::FiberStats;

/// Shared source of stack identities.
///
/// Ids are process-unique and never reused; a stack keeps its id across
/// growth. Clone to hand the same sequence to every allocator.
#[derive(Debug, Clone, Default)]
pub struct StackIdSource(Arc<AtomicU64>);

impl StackIdSource {
    /// A fresh id sequence starting at 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// The next id.
    #[inline]
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Per-execution-unit stack allocator with a size-class cache.
pub struct StackAllocator {
    config: FiberConfig,
    ids: StackIdSource,
    stats: Arc<FiberStats>,
    /// One LIFO free list per size class.
    cache: Vec<Vec<StackBox>>,
}

impl StackAllocator {
    /// Create an allocator drawing ids from `ids`.
    pub fn new(config: FiberConfig, ids: StackIdSource) -> Self {
        let classes = config.size_class_count;
        Self {
            config,
            ids,
            stats: Arc::new(FiberStats::new()),
            cache: (0..classes).map(|_| Vec::new()).collect(),
        }
    }

    /// The allocator's configuration.
    #[inline]
    pub fn config(&self) -> &FiberConfig {
        &self.config
    }

    /// Shared activity counters.
    #[inline]
    pub fn stats(&self) -> &Arc<FiberStats> {
        &self.stats
    }

    /// Words held by class `k` stacks.
    #[inline]
    pub fn class_words(&self, class: u8) -> usize {
        self.config.fiber_words << class
    }

    /// The smallest pooled class holding at least `request` words, or
    /// `None` if the request exceeds the top class.
    pub fn size_class_for(&self, request: usize) -> Option<u8> {
        (0..self.config.size_class_count as u8).find(|&k| self.class_words(k) >= request)
    }

    /// Allocate a stack of at least `request` words with the given
    /// handler triple.
    pub fn alloc(&mut self, request: usize, triple: HandlerTriple) -> Result<StackBox, FiberError> {
        let id = self.ids.next();
        self.alloc_with_id(request, triple, id)
    }

    /// Allocate the main stack at the configured initial size.
    pub fn alloc_main(&mut self) -> Result<StackBox, FiberError> {
        self.alloc(self.config.clamped_initial_words(), HandlerTriple::UNIT)
    }

    /// Allocate under a caller-supplied id; growth reuses the old id.
    pub(crate) fn alloc_with_id(
        &mut self,
        request: usize,
        triple: HandlerTriple,
        id: u64,
    ) -> Result<StackBox, FiberError> {
        let class = self.size_class_for(request);

        if let Some(k) = class {
            if let Some(mut seg) = self.cache[k as usize].pop() {
                seg.reset_for_reuse(triple, id);
                FiberStats::bump(&self.stats.stacks_reused);
                return Ok(seg);
            }
        }

        let wsize = match class {
            Some(k) => self.class_words(k),
            None => request,
        };
        self.fresh_segment(wsize, class, triple, id)
    }

    /// Allocate exactly `wsize` words, bypassing the class cache.
    ///
    /// Growth uses this when the smallest adequate class would exceed
    /// the configured maximum stack size.
    pub(crate) fn alloc_exact_with_id(
        &mut self,
        wsize: usize,
        triple: HandlerTriple,
        id: u64,
    ) -> Result<StackBox, FiberError> {
        self.fresh_segment(wsize, None, triple, id)
    }

    fn fresh_segment(
        &mut self,
        wsize: usize,
        class: Option<u8>,
        triple: HandlerTriple,
        id: u64,
    ) -> Result<StackBox, FiberError> {
        let bytes = StackSegment::region_bytes(wsize);
        let region = if self.config.guard_pages {
            StackRegion::mapped_with_guard(bytes)
        } else {
            StackRegion::heap(bytes)
        };
        let region = region.ok_or(FiberError::OutOfMemory)?;
        FiberStats::bump(&self.stats.stacks_allocated);
        Ok(StackSegment::from_region(region, wsize, class, triple, id))
    }

    /// Return a segment to the allocator. Class-sized segments go on
    /// the free list for their class; exact-sized segments are released
    /// immediately.
    pub fn free(&mut self, mut seg: StackBox) {
        seg.check_magic();
        debug_assert!(
            seg.parent_ptr().is_null(),
            "freeing a segment with a linked parent; free the chain instead"
        );
        match seg.size_class() {
            Some(k) => {
                if self.config.poison_freed {
                    seg.poison();
                }
                FiberStats::bump(&self.stats.stacks_cached);
                self.cache[k as usize].push(seg);
            }
            None => {
                FiberStats::bump(&self.stats.stacks_released);
                drop(seg);
            }
        }
    }

    /// Free a whole segment chain, head first.
    pub fn free_chain(&mut self, mut head: StackBox) {
        while let Some(parent) = head.take_parent() {
            self.free(head);
            head = parent;
        }
        self.free(head);
    }

    /// Drop every cached segment, returning the memory to the system.
    pub fn drain_cache(&mut self) {
        for list in &mut self.cache {
            for seg in list.drain(..) {
                FiberStats::bump(&self.stats.stacks_released);
                drop(seg);
            }
        }
    }

    /// Number of cached segments in one class, for diagnostics.
    #[cfg(test)]
    pub(crate) fn cached_in_class(&self, class: u8) -> usize {
        self.cache[class as usize].len()
    }
}

impl Drop for StackAllocator {
    fn drop(&mut self) {
        self.drain_cache();
    }
}
