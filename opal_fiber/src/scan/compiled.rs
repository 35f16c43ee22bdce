//! Precise frame walking for compiled code.
//!
//! Compiled frames carry no runtime type information; instead the code
//! generator emits a descriptor per call site keyed by return address.
//! The walk starts at `sp`, reads the return address on top of each
//! frame, looks up its descriptor, visits exactly the slots the
//! descriptor names live, and steps to the next frame by the recorded
//! frame size. A missing descriptor means the stack and the descriptor
//! table disagree about the code that is running, which is unrecoverable.
//!
//! Every compiled chunk is bounded by a foreign-call boundary frame:
//! its record holds a pointer to the register save area (whose slots
//! are roots) and the stack top of the enclosing chunk. The outermost
//! boundary saves `high` as the enclosing top, which terminates the walk.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::scan::{RootVisitor, ScanPass, StackScanner};
use crate::stack::StackSegment;
use opal_core::Value;

/// One live root location within a compiled frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveSlot {
    /// Word offset from the slot above the return address.
    Stack(u16),
    /// Index into the current chunk's register save bucket.
    Reg(u8),
}

/// Layout of one compiled frame, keyed by its return address.
#[derive(Debug, Clone)]
pub enum FrameDescriptor {
    /// An ordinary managed frame.
    Live {
        /// Frame size in words, excluding the return-address word.
        frame_words: u32,
        /// The frame's live root locations.
        live_slots: SmallVec<[LiveSlot; 8]>,
    },
    /// A foreign-call boundary. The two words above the return address
    /// are the register save area pointer and the enclosing chunk's sp;
    /// the save area becomes the register bucket for the frames above.
    Boundary {
        /// Number of root slots in the register save area.
        reg_roots: u8,
    },
}

/// Return-address-keyed descriptor table for all compiled code.
#[derive(Default)]
pub struct FrameTable {
    by_return_addr: FxHashMap<usize, FrameDescriptor>,
}

impl FrameTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the descriptor for a call site.
    pub fn register(&mut self, return_addr: usize, desc: FrameDescriptor) {
        self.by_return_addr.insert(return_addr, desc);
    }

    /// Look up a call site.
    #[inline]
    pub fn lookup(&self, return_addr: usize) -> Option<&FrameDescriptor> {
        self.by_return_addr.get(&return_addr)
    }

    /// Number of registered call sites.
    pub fn len(&self) -> usize {
        self.by_return_addr.len()
    }

    /// Whether no call sites are registered.
    pub fn is_empty(&self) -> bool {
        self.by_return_addr.is_empty()
    }
}

/// The compiled-backend scanning strategy.
pub struct CompiledScanner<'t> {
    table: &'t FrameTable,
    /// Register bucket of the innermost chunk, for stacks whose live
    /// registers were not spilled before suspension. Null for fully
    /// suspended stacks.
    regs: *mut Value,
}

impl<'t> CompiledScanner<'t> {
    /// A scanner over `table` for fully suspended stacks.
    pub fn new(table: &'t FrameTable) -> Self {
        Self {
            table,
            regs: std::ptr::null_mut(),
        }
    }

    /// A scanner over `table` with the innermost chunk's register
    /// bucket at `regs`.
    pub fn with_regs(table: &'t FrameTable, regs: *mut Value) -> Self {
        Self { table, regs }
    }
}

impl StackScanner for CompiledScanner<'_> {
    fn scan_segment(&self, pass: &mut ScanPass<'_>, visitor: &mut dyn RootVisitor, seg: &StackSegment) {
        let high = seg.high();
        let mut sp = seg.sp();
        let mut regs = self.regs;

        // An empty segment has no frames at all.
        if sp == high {
            return;
        }

        while sp < high {
            let return_addr = unsafe { (*sp).raw() };
            let desc = match self.table.lookup(return_addr) {
                Some(d) => d,
                None => crate::fatal("no frame descriptor for return address"),
            };

            match desc {
                FrameDescriptor::Live {
                    frame_words,
                    live_slots,
                } => {
                    let frame_base = unsafe { sp.add(1) };
                    for &slot in live_slots {
                        match slot {
                            LiveSlot::Stack(off) => {
                                pass.offer(visitor, unsafe { frame_base.add(off as usize) });
                            }
                            LiveSlot::Reg(ix) => {
                                if regs.is_null() {
                                    crate::fatal("register root without a register bucket");
                                }
                                pass.offer(visitor, unsafe { regs.add(ix as usize) });
                            }
                        }
                    }
                    sp = unsafe { frame_base.add(*frame_words as usize) };
                }
                FrameDescriptor::Boundary { reg_roots } => {
                    unsafe {
                        let saved = (*sp.add(1)).raw() as *mut Value;
                        for i in 0..*reg_roots as usize {
                            pass.offer(visitor, saved.add(i));
                        }
                        // The frames above this record ran on the saved
                        // bucket.
                        regs = saved;
                        sp = (*sp.add(2)).raw() as *mut Value;
                    }
                }
            }
        }
        debug_assert_eq!(sp, high, "frame walk overran the segment");
    }
}
