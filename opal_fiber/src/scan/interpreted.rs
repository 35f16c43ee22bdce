//! Conservative-order slot scanning for interpreted code.
//!
//! Interpreted frames have a uniform layout: every slot in `[sp, high)`
//! is a value, except return addresses, which point into loaded code
//! areas. The scanner visits each slot and drops the ones holding code
//! addresses. A young-values-only pass skips the filter entirely and
//! forwards every slot raw: the collector's action rejects non-young
//! words itself, and skipping the range check is cheaper than running
//! it per slot.

use crate::scan::{RootVisitor, ScanPass, StackScanner};
use crate::stack::StackSegment;

/// Address ranges occupied by loaded interpreter code.
///
/// Ranges are registered as code is loaded and never removed; lookups
/// binary-search the sorted list.
#[derive(Default)]
pub struct CodeMap {
    /// Sorted, disjoint `(start, end)` half-open ranges.
    ranges: Vec<(usize, usize)>,
}

impl CodeMap {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a loaded code area.
    pub fn add(&mut self, start: usize, len: usize) {
        let end = start + len;
        let ix = self.ranges.partition_point(|&(s, _)| s < start);
        debug_assert!(
            ix == 0 || self.ranges[ix - 1].1 <= start,
            "overlapping code areas"
        );
        self.ranges.insert(ix, (start, end));
    }

    /// Whether `addr` falls inside a loaded code area.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let ix = self.ranges.partition_point(|&(s, _)| s <= addr);
        ix > 0 && addr < self.ranges[ix - 1].1
    }
}

/// The interpreted-backend scanning strategy.
pub struct InterpretedScanner<'c> {
    code: &'c CodeMap,
}

impl<'c> InterpretedScanner<'c> {
    /// A scanner filtering against `code`.
    pub fn new(code: &'c CodeMap) -> Self {
        Self { code }
    }
}

impl StackScanner for InterpretedScanner<'_> {
    fn scan_segment(&self, pass: &mut ScanPass<'_>, visitor: &mut dyn RootVisitor, seg: &StackSegment) {
        let high = seg.high();
        let mut sp = seg.sp();

        if pass.young_only {
            while sp < high {
                pass.offer_unfiltered(visitor, sp);
                sp = unsafe { sp.add(1) };
            }
            return;
        }

        while sp < high {
            let v = unsafe { *sp };
            if v.is_block() && !self.code.contains(v.raw()) {
                pass.offer(visitor, sp);
            }
            sp = unsafe { sp.add(1) };
        }
    }
}
