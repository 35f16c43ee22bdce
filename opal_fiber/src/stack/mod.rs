//! Stack segments and handler records.
//!
//! A segment owns one raw region laid out as:
//!
//! ```text
//! low                                               high
//! +------------+----------------------+---+----------------+
//! | guard page |     value stack      |pad| HandlerRecord  |
//! | (optional) |  grows downward      |   | (16-aligned)   |
//! +------------+----------------------+---+----------------+
//!              ^base            sp^       ^high == handler
//! ```
//!
//! `base` and `high` never change; `sp` moves only under the owning
//! fiber (or growth, which replaces the segment wholesale). The handler
//! record is co-located at the high end for locality and holds the
//! parent link, so a chain of nested suspensions is a singly linked
//! list threaded through handler records. A segment is owned by exactly
//! one fiber or continuation at a time.

mod alloc;
pub mod grow;

pub use alloc::{StackAllocator, StackIdSource};
pub use grow::{FixupRegistry, PatchSite, Relocation};

use crate::memory::StackRegion;
use opal_core::{Value, WORD};

/// Debug magic stamped into every live segment.
const SEGMENT_MAGIC: u32 = 0xF1BE;

/// Poison byte written over pooled stack memory in debug builds.
pub(crate) const POISON_BYTE: u8 = 0x42;

/// The three control-transfer targets a suspended fiber reports to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerTriple {
    /// Receives the fiber's normal return value.
    pub on_return: Value,
    /// Receives an exception escaping the fiber.
    pub on_exception: Value,
    /// Receives an effect the fiber performs.
    pub on_effect: Value,
}

impl HandlerTriple {
    /// A triple of unit placeholders, used for the main stack.
    pub const UNIT: HandlerTriple = HandlerTriple {
        on_return: Value::UNIT,
        on_exception: Value::UNIT,
        on_effect: Value::UNIT,
    };
}

/// The handler record at the high end of every segment.
///
/// Field order is load-bearing: the scanner visits the three handler
/// values as roots, and the parent slot threads the segment chain.
#[repr(C)]
pub struct HandlerRecord {
    /// Normal-return handler value.
    pub handle_return: Value,
    /// Exception handler value.
    pub handle_exception: Value,
    /// Effect handler value.
    pub handle_effect: Value,
    /// Segment this one returns control to; null at the chain's end.
    pub parent: *mut StackSegment,
}

/// An owned stack segment. Box ownership mirrors the single-owner rule.
pub type StackBox = Box<StackSegment>;

/// A contiguous downward-growing value stack plus its handler record.
pub struct StackSegment {
    region: StackRegion,
    base: *mut Value,
    high: *mut Value,
    sp: *mut Value,
    handler: *mut HandlerRecord,
    /// Pooled size class, or `None` for individually sized segments.
    cache_class: Option<u8>,
    /// Identity; survives growth.
    id: u64,
    magic: u32,
}

// Safety: a segment is exclusively owned; continuation hand-off moves
// the whole chain to another execution unit.
unsafe impl Send for StackSegment {}

impl StackSegment {
    /// Bytes of region needed for a stack of `wsize` words.
    pub(crate) fn region_bytes(wsize: usize) -> usize {
        // Pad so the handler record lands 16-aligned above the stack.
        let handler_off = (wsize * WORD + 15) & !15;
        handler_off + std::mem::size_of::<HandlerRecord>()
    }

    /// Build a segment over a freshly allocated region.
    pub(crate) fn from_region(
        region: StackRegion,
        wsize: usize,
        cache_class: Option<u8>,
        triple: HandlerTriple,
        id: u64,
    ) -> StackBox {
        let base = region.usable_base() as *mut Value;
        let handler_off = (wsize * WORD + 15) & !15;
        debug_assert!(handler_off + std::mem::size_of::<HandlerRecord>() <= region.usable_len());

        let handler = unsafe { (base as *mut u8).add(handler_off) } as *mut HandlerRecord;
        let high = handler as *mut Value;

        let mut seg = Box::new(StackSegment {
            region,
            base,
            high,
            sp: high,
            handler,
            cache_class,
            id,
            magic: SEGMENT_MAGIC,
        });
        seg.install_handler(triple);
        seg
    }

    fn install_handler(&mut self, triple: HandlerTriple) {
        unsafe {
            self.handler.write(HandlerRecord {
                handle_return: triple.on_return,
                handle_exception: triple.on_exception,
                handle_effect: triple.on_effect,
                parent: std::ptr::null_mut(),
            });
        }
    }

    /// Reinitialize a pooled segment for a new fiber.
    pub(crate) fn reset_for_reuse(&mut self, triple: HandlerTriple, id: u64) {
        self.check_magic();
        self.sp = self.high;
        self.id = id;
        self.install_handler(triple);
    }

    /// Verify the debug magic; a mismatch means the segment descriptor
    /// itself was corrupted.
    #[inline]
    pub(crate) fn check_magic(&self) {
        debug_assert_eq!(self.magic, SEGMENT_MAGIC, "corrupted stack segment");
    }

    /// Lowest usable stack address.
    #[inline]
    pub fn base(&self) -> *mut Value {
        self.base
    }

    /// One past the highest stack slot; equals the handler address.
    #[inline]
    pub fn high(&self) -> *mut Value {
        self.high
    }

    /// Current stack top (grows downward).
    #[inline]
    pub fn sp(&self) -> *mut Value {
        self.sp
    }

    /// Move the stack top. The owning fiber only.
    #[inline]
    pub fn set_sp(&mut self, sp: *mut Value) {
        debug_assert!(self.base <= sp && sp <= self.high);
        self.sp = sp;
    }

    /// Push one value, growing the stack downward.
    ///
    /// Returns `false` if the segment is full; the caller is expected
    /// to grow and retry.
    #[inline]
    pub fn push(&mut self, v: Value) -> bool {
        if self.sp == self.base {
            return false;
        }
        unsafe {
            self.sp = self.sp.sub(1);
            self.sp.write(v);
        }
        true
    }

    /// Words currently in use (`sp` to `high`).
    #[inline]
    pub fn used_words(&self) -> usize {
        unsafe { self.high.offset_from(self.sp) as usize }
    }

    /// Total stack capacity in words.
    #[inline]
    pub fn capacity_words(&self) -> usize {
        unsafe { self.high.offset_from(self.base) as usize }
    }

    /// The pooled size class, or `None` for uncached segments.
    #[inline]
    pub fn size_class(&self) -> Option<u8> {
        self.cache_class
    }

    /// Segment identity. Assigned once; survives growth.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the backing region carries a guard page.
    #[inline]
    pub fn has_guard(&self) -> bool {
        self.region.has_guard()
    }

    /// Check if an address falls inside the stack range `[base, high)`.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base as usize;
        let high = self.high as usize;
        addr >= base && addr < high
    }

    /// The handler record.
    #[inline]
    pub fn handler(&self) -> &HandlerRecord {
        unsafe { &*self.handler }
    }

    /// Mutable handler record access. The owning fiber only.
    #[inline]
    pub fn handler_mut(&mut self) -> &mut HandlerRecord {
        unsafe { &mut *self.handler }
    }

    /// Raw handler record pointer, for the scanner's slot addresses.
    #[inline]
    pub(crate) fn handler_ptr(&self) -> *mut HandlerRecord {
        self.handler
    }

    /// The current handler triple.
    pub fn triple(&self) -> HandlerTriple {
        let h = self.handler();
        HandlerTriple {
            on_return: h.handle_return,
            on_exception: h.handle_exception,
            on_effect: h.handle_effect,
        }
    }

    /// Overwrite the handler triple, keeping the parent link.
    pub fn set_triple(&mut self, triple: HandlerTriple) {
        let h = self.handler_mut();
        h.handle_return = triple.on_return;
        h.handle_exception = triple.on_exception;
        h.handle_effect = triple.on_effect;
    }

    /// Raw parent pointer; null at the end of the chain.
    #[inline]
    pub fn parent_ptr(&self) -> *mut StackSegment {
        self.handler().parent
    }

    /// Borrow the parent segment, if any.
    #[inline]
    pub fn parent(&self) -> Option<&StackSegment> {
        unsafe { self.parent_ptr().as_ref() }
    }

    /// Link a parent chain below this segment, taking ownership.
    pub fn set_parent(&mut self, parent: Option<StackBox>) {
        debug_assert!(self.parent_ptr().is_null(), "parent already linked");
        self.handler_mut().parent = match parent {
            Some(p) => Box::into_raw(p),
            None => std::ptr::null_mut(),
        };
    }

    /// Detach and return the parent chain, if any.
    pub fn take_parent(&mut self) -> Option<StackBox> {
        let p = self.handler().parent;
        if p.is_null() {
            return None;
        }
        self.handler_mut().parent = std::ptr::null_mut();
        Some(unsafe { Box::from_raw(p) })
    }

    /// Poison the stack range, catching stale reads of pooled memory.
    pub(crate) fn poison(&mut self) {
        unsafe {
            std::ptr::write_bytes(
                self.base as *mut u8,
                POISON_BYTE,
                self.capacity_words() * WORD,
            );
        }
    }
}

impl Drop for StackSegment {
    fn drop(&mut self) {
        // Release the whole chain iteratively; Box recursion on a long
        // chain would overflow the host stack.
        let mut parent = self.take_parent();
        while let Some(mut seg) = parent {
            parent = seg.take_parent();
        }
    }
}

impl std::fmt::Debug for StackSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackSegment")
            .field("id", &self.id)
            .field("capacity_words", &self.capacity_words())
            .field("used_words", &self.used_words())
            .field("size_class", &self.cache_class)
            .field("has_parent", &!self.parent_ptr().is_null())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::StackRegion;

    fn segment(wsize: usize) -> StackBox {
        let region = StackRegion::heap(StackSegment::region_bytes(wsize)).expect("region");
        StackSegment::from_region(region, wsize, Some(0), HandlerTriple::UNIT, 1)
    }

    #[test]
    fn test_fresh_segment_invariants() {
        let seg = segment(64);
        assert!(seg.base() <= seg.sp() && seg.sp() <= seg.high());
        assert_eq!(seg.sp(), seg.high());
        assert_eq!(seg.used_words(), 0);
        assert!(seg.capacity_words() >= 64);
        assert_eq!(seg.id(), 1);
    }

    #[test]
    fn test_handler_is_colocated_above_high() {
        let seg = segment(64);
        assert_eq!(seg.high() as usize, seg.handler_ptr() as usize);
        assert_eq!(seg.handler_ptr() as usize % 16, 0);
    }

    #[test]
    fn test_push_moves_sp_down() {
        let mut seg = segment(64);
        assert!(seg.push(Value::int(7)));
        assert_eq!(seg.used_words(), 1);
        assert!(seg.base() <= seg.sp() && seg.sp() <= seg.high());
        assert_eq!(unsafe { *seg.sp() }, Value::int(7));
    }

    #[test]
    fn test_push_rejects_overflow() {
        let mut seg = segment(16);
        let cap = seg.capacity_words();
        for i in 0..cap {
            assert!(seg.push(Value::int(i as isize)));
        }
        assert!(!seg.push(Value::int(-1)));
        assert_eq!(seg.used_words(), cap);
    }

    #[test]
    fn test_parent_chain_link_and_detach() {
        let mut child = segment(32);
        let parent = segment(32);
        child.set_parent(Some(parent));
        assert!(child.parent().is_some());

        let detached = child.take_parent().expect("parent");
        assert!(child.parent().is_none());
        assert_eq!(detached.used_words(), 0);
    }

    #[test]
    fn test_triple_round_trip() {
        let mut seg = segment(32);
        let triple = HandlerTriple {
            on_return: Value::int(1),
            on_exception: Value::int(2),
            on_effect: Value::int(3),
        };
        seg.set_triple(triple);
        assert_eq!(seg.triple(), triple);
        // Parent untouched by a triple overwrite.
        assert!(seg.parent_ptr().is_null());
    }

    #[test]
    fn test_long_chain_drop_is_iterative() {
        let mut head = segment(16);
        for _ in 0..10_000 {
            let mut next = segment(16);
            next.set_parent(Some(head));
            head = next;
        }
        drop(head); // must not overflow the host stack
    }
}
