//! Stack growth with pointer fixup.
//!
//! A stack that runs out of room is reallocated at the next sufficient
//! doubling of its size, the live suffix `[sp, high)` is copied to the
//! same distance below the new high end, and every absolute pointer
//! into the old region is rewritten before the old region is released.
//!
//! Fixup is open-ended: each pointer family that can reference stack
//! interior addresses registers a [`PatchSite`] with the
//! [`FixupRegistry`], and growth offers each site a [`Relocation`]
//! describing the move. Chain walks read successor links from the
//! already-copied suffix; old storage is never dereferenced once the
//! copy is done.

use crate::effects::FiberError;
use crate::stack::{StackAllocator, StackBox, StackSegment};
use crate::stats::FiberStats;
use opal_core::Value;

// =============================================================================
// Relocation
// =============================================================================

/// Description of one stack move, offered to every patch site.
///
/// Addresses are translated by preserving the distance to the high end:
/// `new = new_high - (old_high - old)`.
pub struct Relocation {
    /// The segment being vacated. Identity comparison only.
    pub old_segment: *mut StackSegment,
    /// The replacement segment.
    pub new_segment: *mut StackSegment,
    old_base: usize,
    old_high: usize,
    new_high: usize,
}

impl Relocation {
    /// Whether `addr` points at a slot of the old stack, `[base, high)`.
    #[inline]
    pub fn in_old_slots(&self, addr: usize) -> bool {
        addr >= self.old_base && addr < self.old_high
    }

    /// Whether `addr` points into the old stack's chain range,
    /// `(base, high]`. Trap records sit above the slot they guard, so a
    /// chain entry may equal `high` but never `base`.
    #[inline]
    pub fn in_old_chain(&self, addr: usize) -> bool {
        addr > self.old_base && addr <= self.old_high
    }

    /// Translate an old-stack address to its new-stack equivalent.
    #[inline]
    pub fn translate(&self, addr: usize) -> usize {
        self.new_high - (self.old_high - addr)
    }
}

// =============================================================================
// Patch sites
// =============================================================================

/// One family of absolute pointers that growth must rewrite.
pub trait PatchSite {
    /// Rewrite every pointer of this family per `relo`.
    fn patch(&mut self, relo: &Relocation);
}

/// Registered patch sites, applied in registration order on each grow.
#[derive(Default)]
pub struct FixupRegistry {
    sites: Vec<Box<dyn PatchSite>>,
}

impl FixupRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a patch site for the lifetime of the registry.
    pub fn register(&mut self, site: Box<dyn PatchSite>) {
        self.sites.push(site);
    }

    /// Offer `relo` to every registered site.
    pub fn apply_all(&mut self, relo: &Relocation) {
        for site in &mut self.sites {
            site.patch(relo);
        }
    }
}

/// Rewrites the exception trap chain, a linked list threaded through
/// stack slots where each entry holds the address of the next outer
/// entry. An optional alias cell (the asynchronous-exception trap) is
/// kept consistent with whichever entry it equals.
pub struct TrapChainPatch {
    head: *mut *mut Value,
    async_alias: *mut *mut Value,
}

impl TrapChainPatch {
    /// Track the chain rooted at `head`.
    ///
    /// `head` and `async_alias` (nullable) must outlive the registry
    /// and be exclusively updated through it during growth.
    pub fn new(head: *mut *mut Value, async_alias: *mut *mut Value) -> Self {
        Self { head, async_alias }
    }
}

impl PatchSite for TrapChainPatch {
    fn patch(&mut self, relo: &Relocation) {
        let mut cell = self.head;
        unsafe {
            loop {
                let entry = *cell as usize;
                if !relo.in_old_chain(entry) {
                    break;
                }
                let moved = relo.translate(entry);
                if !self.async_alias.is_null() && *self.async_alias as usize == entry {
                    *self.async_alias = moved as *mut Value;
                }
                *cell = moved as *mut Value;
                // The next link lives in the copied suffix.
                cell = moved as *mut *mut Value;
            }
        }
    }
}

/// Rewrites the saved-frame-pointer chain threaded through compiled
/// frames. Entries stored in the old stack are recomputed at their
/// translated address and read from the copy.
pub struct FramePointerPatch {
    head: *mut usize,
}

impl FramePointerPatch {
    /// Track the chain rooted at the (off-stack) cell `head`.
    pub fn new(head: *mut usize) -> Self {
        Self { head }
    }
}

impl PatchSite for FramePointerPatch {
    fn patch(&mut self, relo: &Relocation) {
        let mut cell = self.head;
        unsafe {
            loop {
                let fp = *cell;
                if !relo.in_old_slots(fp) {
                    break;
                }
                let moved = relo.translate(fp);
                *cell = moved;
                // The saved-fp slot moved with the suffix.
                cell = moved as *mut usize;
            }
        }
    }
}

/// One foreign-call boundary record: where managed execution left off
/// before entering foreign code.
#[repr(C)]
pub struct NativeLink {
    /// The managed segment execution will return to.
    pub segment: *mut StackSegment,
    /// Saved stack top within that segment.
    pub sp: *mut Value,
    /// Saved asynchronous trap entry, or null when none was armed
    /// before entering foreign code.
    pub async_trap: *mut Value,
    /// Next outer boundary, or null.
    pub prev: *mut NativeLink,
}

/// Rewrites the foreign-call boundary list: every record naming the
/// vacated segment is repointed and its saved top translated, and any
/// saved async trap entry inside the old bounds follows the move.
pub struct NativeLinkPatch {
    head: *mut NativeLink,
}

impl NativeLinkPatch {
    /// Track the boundary list rooted at `head` (nullable).
    pub fn new(head: *mut NativeLink) -> Self {
        Self { head }
    }
}

impl PatchSite for NativeLinkPatch {
    fn patch(&mut self, relo: &Relocation) {
        let mut link = self.head;
        while !link.is_null() {
            unsafe {
                let l = &mut *link;
                if l.segment == relo.old_segment {
                    l.segment = relo.new_segment;
                    l.sp = relo.translate(l.sp as usize) as *mut Value;
                }
                let trap = l.async_trap as usize;
                if relo.in_old_chain(trap) {
                    l.async_trap = relo.translate(trap) as *mut Value;
                }
                link = l.prev;
            }
        }
    }
}

// =============================================================================
// Growth
// =============================================================================

impl StackAllocator {
    /// Grow `stack` so at least `needed` more words fit above `sp`.
    ///
    /// The size doubles from the current capacity until it covers
    /// `used + needed`; hitting the configured maximum first fails with
    /// [`FiberError::StackOverflow`] and leaves the stack untouched, as
    /// does an [`FiberError::OutOfMemory`] from the replacement region.
    /// On success the segment keeps its id, handler triple, parent
    /// link, and live contents; `fixups` has been applied and the old
    /// region is back in the cache.
    pub fn grow(
        &mut self,
        stack: &mut StackBox,
        needed: usize,
        fixups: &mut FixupRegistry,
    ) -> Result<(), FiberError> {
        stack.check_magic();
        let used = stack.used_words();
        let max = self.config().max_stack_words;

        let mut wsize = stack.capacity_words();
        loop {
            if wsize >= max {
                FiberStats::bump(&self.stats().grow_failures);
                return Err(FiberError::StackOverflow);
            }
            wsize *= 2;
            if wsize >= used + needed {
                break;
            }
        }
        let wsize = wsize.min(max);
        if wsize < used + needed {
            FiberStats::bump(&self.stats().grow_failures);
            return Err(FiberError::StackOverflow);
        }

        // The class the cache would round up to may overshoot the
        // maximum; allocate the clamped size exactly in that case.
        let class_within_cap = match self.size_class_for(wsize) {
            Some(k) => self.class_words(k) <= max,
            None => true, // oversize requests are sized exactly anyway
        };
        let fresh = if class_within_cap {
            self.alloc_with_id(wsize, stack.triple(), stack.id())
        } else {
            self.alloc_exact_with_id(wsize, stack.triple(), stack.id())
        };
        let mut fresh = match fresh {
            Ok(fresh) => fresh,
            Err(e) => {
                FiberStats::bump(&self.stats().grow_failures);
                return Err(e);
            }
        };

        // Copy the live suffix to the same distance below the new high.
        unsafe {
            let dst = fresh.high().sub(used);
            std::ptr::copy_nonoverlapping(stack.sp() as *const Value, dst, used);
            fresh.set_sp(dst);
        }
        fresh.set_parent(stack.take_parent());

        let old = std::mem::replace(stack, fresh);
        let relo = Relocation {
            old_segment: &*old as *const StackSegment as *mut StackSegment,
            new_segment: &mut **stack as *mut StackSegment,
            old_base: old.base() as usize,
            old_high: old.high() as usize,
            new_high: stack.high() as usize,
        };
        fixups.apply_all(&relo);

        FiberStats::bump(&self.stats().grows);
        self.free(old);
        Ok(())
    }
}
