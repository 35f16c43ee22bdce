//! Region-scoped local arenas and their reachability walk.
//!
//! Locals are bump-allocated downward inside per-scope arenas and die
//! with the scope, so the collector never moves them; it only needs to
//! know which arena blocks are reachable and to trace their heap
//! fields. Allocation order gives the key invariant: a local block may
//! only reference older locals, which sit at higher addresses in the
//! same arena or in an earlier arena. One linear walk per arena from
//! newest block to oldest therefore discovers the whole transitive
//! closure: a block's referents are always walked after the block
//! itself. A backward reference would have been passed over already
//! and silently lost, so finding one is a runtime defect.
//!
//! Reachability for the current pass lives in the [`ScanPass`] mark
//! set; the walk itself writes nothing, though the visitor may forward
//! heap fields in place like any other root slot.

use std::cell::UnsafeCell;

use smallvec::SmallVec;

use crate::scan::{RootVisitor, ScanPass, tag_is_scannable};
use opal_core::{Color, Header, TAG_INTERIOR, Value, WORD};

/// One bump-allocated region of locals.
///
/// The top word holds a boundary sentinel header; the object walk runs
/// from the newest block upward and stops there. Storage is interiorly
/// mutable because the scan hands field slots of shared arenas to the
/// visitor for forwarding.
pub struct LocalArena {
    storage: Vec<UnsafeCell<usize>>,
    /// Word index of the lowest allocated header; the sentinel index
    /// while the arena is empty.
    next: usize,
}

impl LocalArena {
    /// An arena able to hold `words` words of blocks (headers included).
    pub fn with_capacity(words: usize) -> Self {
        let mut storage: Vec<UnsafeCell<usize>> =
            (0..=words).map(|_| UnsafeCell::new(0)).collect();
        *storage[words].get_mut() = Header::SENTINEL.raw();
        Self {
            storage,
            next: words,
        }
    }

    /// Allocate a block of `wosize` fields, zero-initialized.
    ///
    /// Returns `None` when the arena is full; the caller falls back to
    /// the heap. Local blocks are colored not-markable: the major
    /// collector never manages them.
    pub fn alloc(&mut self, tag: u8, wosize: usize) -> Option<Value> {
        let need = wosize + 1;
        if self.next < need {
            return None;
        }
        self.next -= need;
        *self.storage[self.next].get_mut() = Header::new(tag, Color::NotMarkable, wosize).raw();
        for slot in &mut self.storage[self.next + 1..self.next + 1 + wosize] {
            *slot.get_mut() = Value::UNIT.raw();
        }
        Some(Value::from_ptr(
            self.storage[self.next + 1].get() as *const (),
        ))
    }

    /// Words still available.
    pub fn remaining_words(&self) -> usize {
        self.next
    }

    fn range(&self) -> ArenaRange {
        let start = self.storage.as_ptr() as usize;
        ArenaRange {
            start,
            end: start + self.storage.len() * WORD,
            first_header: start + self.next * WORD,
        }
    }
}

#[derive(Clone, Copy)]
struct ArenaRange {
    start: usize,
    end: usize,
    first_header: usize,
}

/// Few arenas are open at once; keep range snapshots off the heap.
type Ranges = SmallVec<[ArenaRange; 4]>;

/// Resolve `addr` to the arena holding it and the payload address of
/// the enclosing block, stepping out of an interior pointer if needed.
fn find_base(ranges: &[ArenaRange], addr: usize) -> Option<(usize, usize)> {
    for (ix, r) in ranges.iter().enumerate() {
        if addr >= r.start + WORD && addr < r.end {
            let header = Header::from_raw(unsafe { *((addr - WORD) as *const usize) });
            let base = if header.tag() == TAG_INTERIOR {
                addr - header.interior_offset_words() * WORD
            } else {
                addr
            };
            return Some((ix, base));
        }
    }
    None
}

/// The live arenas of one execution unit, oldest first.
#[derive(Default)]
pub struct ArenaSet {
    arenas: Vec<LocalArena>,
}

impl ArenaSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new (newest) arena.
    pub fn push(&mut self, arena: LocalArena) {
        self.arenas.push(arena);
    }

    /// Close and discard the newest arena.
    pub fn pop(&mut self) -> Option<LocalArena> {
        self.arenas.pop()
    }

    /// The newest arena, for allocation.
    pub fn current_mut(&mut self) -> Option<&mut LocalArena> {
        self.arenas.last_mut()
    }

    /// Number of open arenas.
    pub fn len(&self) -> usize {
        self.arenas.len()
    }

    /// Whether no arena is open.
    pub fn is_empty(&self) -> bool {
        self.arenas.is_empty()
    }

    /// Record a root discovered by the stack scan.
    ///
    /// Returns `true` if `v` points into one of the arenas (the root is
    /// a local and the collector must not treat it as a heap root);
    /// interior pointers mark their enclosing block.
    pub fn mark_root(&self, pass: &mut ScanPass<'_>, v: Value) -> bool {
        if !v.is_block() {
            return false;
        }
        let ranges: Ranges = self.arenas.iter().map(LocalArena::range).collect();
        match find_base(&ranges, v.raw()) {
            Some((_, base)) => {
                pass.mark(base);
                true
            }
            None => false,
        }
    }

    /// Walk every arena, tracing marked blocks.
    ///
    /// Heap fields of reachable blocks are offered to `visitor`; local
    /// fields extend the mark set. Arenas are walked newest first and
    /// each arena newest block first, so every referent is walked after
    /// the block referencing it. A reference violating that order is
    /// fatal.
    pub fn scan(&self, pass: &mut ScanPass<'_>, visitor: &mut dyn RootVisitor) {
        let ranges: Ranges = self.arenas.iter().map(LocalArena::range).collect();

        for aix in (0..ranges.len()).rev() {
            let mut hp = ranges[aix].first_header;
            loop {
                let header = Header::from_raw(unsafe { *(hp as *const usize) });
                if header.is_sentinel() {
                    break;
                }
                let payload = hp + WORD;
                if pass.is_marked(payload) && tag_is_scannable(header.tag()) {
                    for i in 0..header.wosize() {
                        let slot = (payload + i * WORD) as *mut Value;
                        let field = unsafe { *slot };
                        if !field.is_block() {
                            continue;
                        }
                        match find_base(&ranges, field.raw()) {
                            Some((tix, base)) => {
                                let backward = tix > aix || (tix == aix && base < payload);
                                if backward {
                                    crate::fatal("backward local pointer");
                                }
                                pass.mark(base);
                            }
                            None => pass.offer(visitor, slot),
                        }
                    }
                }
                hp = payload + header.wosize() * WORD;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::test_support::Recorder;

    fn heap_block() -> (Box<[usize; 2]>, Value) {
        let block = Box::new([Header::new(0, Color::Unmarked, 1).raw(), 0usize]);
        let payload = &block[1] as *const usize as *const ();
        (block, Value::from_ptr(payload))
    }

    fn write_field(block: Value, i: usize, v: Value) {
        unsafe { (block.as_ptr() as *mut Value).add(i).write(v) };
    }

    #[test]
    fn test_alloc_bumps_downward() {
        let mut arena = LocalArena::with_capacity(64);
        let older = arena.alloc(0, 2).expect("older");
        let newer = arena.alloc(0, 2).expect("newer");
        assert!(newer.raw() < older.raw());
        assert_eq!(arena.remaining_words(), 64 - 6);
    }

    #[test]
    fn test_alloc_fails_when_full() {
        let mut arena = LocalArena::with_capacity(4);
        assert!(arena.alloc(0, 3).is_some());
        assert!(arena.alloc(0, 1).is_none());
    }

    #[test]
    fn test_transitive_marking_and_heap_fields() {
        let (_b, heap_root) = heap_block();

        let mut set = ArenaSet::new();
        set.push(LocalArena::with_capacity(64));
        let arena = set.current_mut().expect("arena");
        let older = arena.alloc(0, 1).expect("older");
        let newer = arena.alloc(0, 2).expect("newer");
        write_field(newer, 0, older); // forward reference
        write_field(older, 0, heap_root);

        let mut pass = ScanPass::new(false);
        assert!(set.mark_root(&mut pass, newer));

        let mut rec = Recorder::default();
        set.scan(&mut pass, &mut rec);

        assert!(pass.is_marked(older.raw()));
        assert_eq!(rec.values(), vec![heap_root]);
    }

    #[test]
    fn test_unreachable_blocks_are_not_traced() {
        let (_b, heap_root) = heap_block();

        let mut set = ArenaSet::new();
        set.push(LocalArena::with_capacity(64));
        let arena = set.current_mut().expect("arena");
        let unreached = arena.alloc(0, 1).expect("block");
        write_field(unreached, 0, heap_root);

        let mut pass = ScanPass::new(false);
        let mut rec = Recorder::default();
        set.scan(&mut pass, &mut rec);
        assert!(rec.seen.is_empty());
    }

    #[test]
    fn test_no_scan_tag_blocks_keep_their_bits_opaque() {
        let mut set = ArenaSet::new();
        set.push(LocalArena::with_capacity(64));
        let arena = set.current_mut().expect("arena");
        let raw = arena.alloc(opal_core::NO_SCAN_TAG, 2).expect("block");
        // Opaque payload that must never be chased as a pointer.
        write_field(raw, 0, Value::from_raw(0xDEAD_BEE0));

        let mut pass = ScanPass::new(false);
        set.mark_root(&mut pass, raw);

        let mut rec = Recorder::default();
        set.scan(&mut pass, &mut rec);
        assert!(rec.seen.is_empty());
    }

    #[test]
    fn test_interior_pointer_marks_enclosing_block() {
        let mut set = ArenaSet::new();
        set.push(LocalArena::with_capacity(64));
        let arena = set.current_mut().expect("arena");
        let block = arena.alloc(0, 4).expect("block");

        // Embed an interior header at field 1 so field 2 is a valid
        // interior target, two words past the block payload.
        write_field(
            block,
            1,
            Value::from_raw(Header::new(TAG_INTERIOR, Color::Unmarked, 2).raw()),
        );
        let interior = Value::from_raw(block.raw() + 2 * WORD);

        let mut pass = ScanPass::new(false);
        assert!(set.mark_root(&mut pass, interior));
        assert!(pass.is_marked(block.raw()));
    }

    #[test]
    fn test_cross_arena_forward_reference() {
        let (_b, heap_root) = heap_block();

        let mut set = ArenaSet::new();
        set.push(LocalArena::with_capacity(32));
        let old_block = set.current_mut().expect("arena").alloc(0, 1).expect("old");
        write_field(old_block, 0, heap_root);

        set.push(LocalArena::with_capacity(32));
        let new_block = set.current_mut().expect("arena").alloc(0, 1).expect("new");
        write_field(new_block, 0, old_block);

        let mut pass = ScanPass::new(false);
        set.mark_root(&mut pass, new_block);

        let mut rec = Recorder::default();
        set.scan(&mut pass, &mut rec);
        assert!(pass.is_marked(old_block.raw()));
        assert_eq!(rec.values(), vec![heap_root]);
    }

    #[test]
    fn test_pass_with_arenas_diverts_stack_roots_from_the_visitor() {
        let (_b, heap_root) = heap_block();

        let mut set = ArenaSet::new();
        set.push(LocalArena::with_capacity(64));
        let local = set.current_mut().expect("arena").alloc(0, 1).expect("local");
        write_field(local, 0, heap_root);

        let mut pass = ScanPass::with_arenas(false, &set);
        let mut rec = Recorder::default();

        // A stack slot holding the local: the offer policy routes it
        // into the mark set instead of the visitor.
        let mut slot = local;
        pass.offer(&mut rec, &mut slot);
        assert!(rec.seen.is_empty());
        assert_eq!(pass.roots_offered(), 0);

        // The arena walk then surfaces the local's heap field.
        set.scan(&mut pass, &mut rec);
        assert_eq!(rec.values(), vec![heap_root]);
    }

    #[test]
    #[should_panic(expected = "backward local pointer")]
    fn test_backward_reference_is_fatal() {
        let mut set = ArenaSet::new();
        set.push(LocalArena::with_capacity(64));
        let arena = set.current_mut().expect("arena");
        let older = arena.alloc(0, 1).expect("older");
        let newer = arena.alloc(0, 1).expect("newer");
        write_field(older, 0, newer); // older block referencing newer

        let mut pass = ScanPass::new(false);
        set.mark_root(&mut pass, older);

        let mut rec = Recorder::default();
        set.scan(&mut pass, &mut rec);
    }
}
