//! Opal Fiber & Stack Subsystem
//!
//! Execution stacks for resumable fibers: allocation and pooling, growth
//! of a live stack with pointer fixup, atomic single-owner continuation
//! capture/resume, and precise GC root enumeration across stack chains
//! and region-scoped local arenas.
//!
//! # Architecture
//!
//! - **Allocator & cache** ([`stack`]): size-classed stack regions with a
//!   private per-execution-unit free list per class, optionally backed by
//!   guard-page mappings for overflow detection in compiled code.
//!
//! - **Growth** ([`stack::grow`]): reallocates a live stack to a larger
//!   size class, copies the live suffix, and offers a [`stack::Relocation`]
//!   to every registered patch site so absolute pointers into the old
//!   region are rewritten before it is released.
//!
//! - **Continuations** ([`continuation`]): one atomic cell per captured
//!   chain; exactly one concurrent taker wins, the rest observe empty.
//!
//! - **Root scanning** ([`scan`]): one scanning contract, two strategies.
//!   The compiled strategy walks physical frames through a frame-descriptor
//!   table; the interpreted strategy scans every slot behind a
//!   code-address filter. Both feed one uniform per-root visit policy that
//!   also drives the local-arena walk.
//!
//! # Concurrency
//!
//! Allocation, growth, and scanning act on exclusively-owned state within
//! one execution unit. Only continuation take/replace and the cached
//! named conditions are cross-unit concurrent, and both are lock-free.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod continuation;
pub mod effects;
pub mod memory;
pub mod scan;
pub mod stack;

mod stats;

pub use config::FiberConfig;
pub use continuation::Continuation;
pub use effects::{ConditionRegistry, EffectConditions, FiberError};
pub use scan::{CollectorBridge, RootVisitor, ScanPass, StackScanner};
pub use stack::{HandlerTriple, StackAllocator, StackBox, StackIdSource, StackSegment};
pub use stats::FiberStats;

/// Terminate the process on an internal consistency violation.
///
/// Used for defects in the runtime itself (backward arena pointers,
/// missing frame descriptors), never for recoverable conditions.
#[cold]
pub(crate) fn fatal(msg: &str) -> ! {
    panic!("opal_fiber: fatal: {msg}");
}
