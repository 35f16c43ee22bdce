//! GC root enumeration over stacks and local arenas.
//!
//! One scanning contract, two strategies. The compiled strategy
//! ([`compiled::CompiledScanner`]) walks physical frames through a
//! frame-descriptor table and visits exactly the live slots. The
//! interpreted strategy ([`interpreted::InterpretedScanner`]) scans
//! every slot and filters out code addresses. Both report discovered
//! root slots to one [`RootVisitor`] under one per-root policy
//! ([`ScanPass::offer`]), which also drives the local-arena walk
//! ([`arena::ArenaSet::scan`]).
//!
//! A [`ScanPass`] is created per collection pass and carries the
//! pass-scoped bookkeeping; nothing in the scanned data is mutated to
//! track progress, so a pass can be abandoned or repeated freely.

pub mod arena;
pub mod compiled;
pub mod interpreted;

pub use arena::{ArenaSet, LocalArena};
pub use compiled::{CompiledScanner, FrameDescriptor, FrameTable, LiveSlot};
pub use interpreted::{CodeMap, InterpretedScanner};

use rustc_hash::FxHashSet;

use crate::stack::StackSegment;
use opal_core::{Color, Header, NO_SCAN_TAG, TAG_INTERIOR, Value, WORD};

// =============================================================================
// Visitor contract
// =============================================================================

/// Collector-side callback invoked once per discovered root slot.
///
/// The visitor may update the slot in place (forwarding); it must not
/// assume slots are visited at most once per block, only at most once
/// per slot.
pub trait RootVisitor {
    /// Visit the root stored at `slot`.
    fn visit_root(&mut self, slot: *mut Value);
}

/// Adapter presenting a closure as a [`RootVisitor`].
///
/// The usual bridge between the collector's mark/forward routine and
/// the scanners.
pub struct CollectorBridge<F: FnMut(Value, *mut Value)> {
    f: F,
}

impl<F: FnMut(Value, *mut Value)> CollectorBridge<F> {
    /// Wrap `f`, which receives the root value and its slot address.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F: FnMut(Value, *mut Value)> RootVisitor for CollectorBridge<F> {
    fn visit_root(&mut self, slot: *mut Value) {
        let v = unsafe { *slot };
        (self.f)(v, slot);
    }
}

// =============================================================================
// Pass state
// =============================================================================

/// Per-collection-pass scanning state.
pub struct ScanPass<'a> {
    /// Whether this pass only cares about young-generation values.
    /// The interpreted scanner forwards slots unfiltered in this mode;
    /// the collector's action does its own filtering.
    pub young_only: bool,
    /// Arenas whose blocks are diverted from the visitor into the mark
    /// set, for the arena walk that follows the stack scan.
    arenas: Option<&'a ArenaSet>,
    /// Arena block payload addresses marked reachable this pass.
    marked: FxHashSet<usize>,
    roots_offered: u64,
}

impl<'a> ScanPass<'a> {
    /// Fresh state for one pass with no local arenas.
    pub fn new(young_only: bool) -> Self {
        Self {
            young_only,
            arenas: None,
            marked: FxHashSet::default(),
            roots_offered: 0,
        }
    }

    /// Fresh state for one pass over a unit that holds local arenas.
    pub fn with_arenas(young_only: bool, arenas: &'a ArenaSet) -> Self {
        Self {
            young_only,
            arenas: Some(arenas),
            marked: FxHashSet::default(),
            roots_offered: 0,
        }
    }

    /// Number of roots handed to the visitor so far.
    #[inline]
    pub fn roots_offered(&self) -> u64 {
        self.roots_offered
    }

    /// Mark an arena block reachable. Returns `true` on first mark.
    #[inline]
    pub(crate) fn mark(&mut self, payload_addr: usize) -> bool {
        self.marked.insert(payload_addr)
    }

    /// Whether an arena block was marked this pass.
    #[inline]
    pub(crate) fn is_marked(&self, payload_addr: usize) -> bool {
        self.marked.contains(&payload_addr)
    }

    /// The per-root policy, shared by every scanner.
    ///
    /// Immediates are never roots. A pointer into one of the pass's
    /// arenas marks its block for the arena walk instead of reaching
    /// the visitor. An interior pointer is judged by its enclosing
    /// block's header, not the interior one. Remaining not-markable
    /// blocks live outside collector jurisdiction (leaked condition
    /// carriers, foreign data) and are skipped. Everything else goes to
    /// the visitor, once per slot.
    pub fn offer(&mut self, visitor: &mut dyn RootVisitor, slot: *mut Value) {
        let v = unsafe { *slot };
        if !v.is_block() {
            return;
        }
        if let Some(arenas) = self.arenas {
            if arenas.mark_root(self, v) {
                return;
            }
        }
        let mut header = unsafe { Header::of_value(v) };
        if header.tag() == TAG_INTERIOR {
            let base = v.raw() - header.interior_offset_words() * WORD;
            header = unsafe { Header::of_value(Value::from_raw(base)) };
        }
        if header.color() == Color::NotMarkable {
            return;
        }
        self.roots_offered += 1;
        visitor.visit_root(slot);
    }

    /// Offer a slot without inspecting it; the visitor filters.
    pub(crate) fn offer_unfiltered(&mut self, visitor: &mut dyn RootVisitor, slot: *mut Value) {
        self.roots_offered += 1;
        visitor.visit_root(slot);
    }
}

/// Whether a block with this tag carries scannable value fields.
#[inline]
pub(crate) fn tag_is_scannable(tag: u8) -> bool {
    tag < NO_SCAN_TAG
}

// =============================================================================
// Strategy and chain walk
// =============================================================================

/// One backend's way of enumerating live roots in a single segment.
pub trait StackScanner {
    /// Report every live root slot of `seg` to `visitor`.
    fn scan_segment(&self, pass: &mut ScanPass<'_>, visitor: &mut dyn RootVisitor, seg: &StackSegment);
}

/// Scan a whole suspended chain: each segment's live slots plus the
/// three handler values linking it to its parent.
pub fn scan_chain(
    scanner: &dyn StackScanner,
    pass: &mut ScanPass<'_>,
    visitor: &mut dyn RootVisitor,
    head: &StackSegment,
) {
    let mut seg: Option<&StackSegment> = Some(head);
    while let Some(s) = seg {
        scan_segment_with_handler(scanner, pass, visitor, s);
        seg = s.parent();
    }
}

/// Scan one segment and its handler triple, ignoring the parent link.
pub fn scan_segment_with_handler(
    scanner: &dyn StackScanner,
    pass: &mut ScanPass<'_>,
    visitor: &mut dyn RootVisitor,
    seg: &StackSegment,
) {
    seg.check_magic();
    scanner.scan_segment(pass, visitor, seg);

    // The handler values are roots too; the record is off-stack so the
    // body scan never reaches them. Young-only passes forward them
    // unfiltered, same as the body slots.
    let h = seg.handler_ptr();
    unsafe {
        if pass.young_only {
            pass.offer_unfiltered(visitor, &mut (*h).handle_return);
            pass.offer_unfiltered(visitor, &mut (*h).handle_exception);
            pass.offer_unfiltered(visitor, &mut (*h).handle_effect);
        } else {
            pass.offer(visitor, &mut (*h).handle_return);
            pass.offer(visitor, &mut (*h).handle_exception);
            pass.offer(visitor, &mut (*h).handle_effect);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Visitor recording every offered slot and value.
    #[derive(Default)]
    pub struct Recorder {
        pub seen: Vec<(Value, usize)>,
    }

    impl RootVisitor for Recorder {
        fn visit_root(&mut self, slot: *mut Value) {
            let v = unsafe { *slot };
            self.seen.push((v, slot as usize));
        }
    }

    impl Recorder {
        pub fn values(&self) -> Vec<Value> {
            self.seen.iter().map(|(v, _)| *v).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::Recorder;
    use super::*;
    use crate::effects::alloc_carrier;

    #[test]
    fn test_offer_skips_immediates() {
        let mut pass = ScanPass::new(false);
        let mut rec = Recorder::default();
        let mut slot = Value::int(5);
        pass.offer(&mut rec, &mut slot);
        assert!(rec.seen.is_empty());
        assert_eq!(pass.roots_offered(), 0);
    }

    #[test]
    fn test_offer_skips_not_markable_blocks() {
        let carrier = alloc_carrier(&[Value::int(1)]);
        let mut pass = ScanPass::new(false);
        let mut rec = Recorder::default();
        let mut slot = carrier;
        pass.offer(&mut rec, &mut slot);
        assert!(rec.seen.is_empty());
    }

    #[test]
    fn test_offer_forwards_markable_blocks() {
        // A fake heap block: header word followed by one field.
        let block = [opal_core::Header::new(0, Color::Unmarked, 1).raw(), 0usize];
        let payload = &block[1] as *const usize as *const ();

        let mut pass = ScanPass::new(false);
        let mut rec = Recorder::default();
        let mut slot = Value::from_ptr(payload);
        pass.offer(&mut rec, &mut slot);

        assert_eq!(rec.seen.len(), 1);
        assert_eq!(rec.seen[0].0, Value::from_ptr(payload));
        assert_eq!(pass.roots_offered(), 1);
    }

    #[test]
    fn test_offer_resolves_interior_pointers_to_the_enclosing_header() {
        // A live 3-field block with an interior header embedded at
        // field 1, so field 2's address is a valid interior target.
        let block = [
            opal_core::Header::new(0, Color::Unmarked, 3).raw(),
            0usize,
            opal_core::Header::new(TAG_INTERIOR, Color::Unmarked, 2).raw(),
            0usize,
        ];
        let payload = &block[1] as *const usize as usize;
        let interior = Value::from_raw(payload + 2 * WORD);

        let mut pass = ScanPass::new(false);
        let mut rec = Recorder::default();
        let mut slot = interior;
        pass.offer(&mut rec, &mut slot);

        assert_eq!(rec.seen.len(), 1, "interior root into a live block dropped");
        assert_eq!(rec.seen[0].0, interior, "slot forwarded as-is");

        // The same shape inside a not-markable block still skips.
        let carrier = [
            opal_core::Header::new(0, Color::NotMarkable, 3).raw(),
            0usize,
            opal_core::Header::new(TAG_INTERIOR, Color::Unmarked, 2).raw(),
            0usize,
        ];
        let carrier_payload = &carrier[1] as *const usize as usize;
        let mut slot = Value::from_raw(carrier_payload + 2 * WORD);
        pass.offer(&mut rec, &mut slot);
        assert_eq!(rec.seen.len(), 1);
    }

    #[test]
    fn test_collector_bridge_passes_value_and_slot() {
        let mut seen = Vec::new();
        {
            let mut bridge = CollectorBridge::new(|v: Value, slot: *mut Value| {
                seen.push((v, slot as usize));
                // Forwarding: rewrite the slot.
                unsafe { *slot = Value::int(99) };
            });
            let mut slot = Value::int(1);
            bridge.visit_root(&mut slot);
            assert_eq!(slot, Value::int(99));
        }
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, Value::int(1));
    }
}
