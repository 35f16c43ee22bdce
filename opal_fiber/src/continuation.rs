//! First-class continuations over captured stack chains.
//!
//! A continuation is one atomic cell holding the head of a captured
//! segment chain. Resuming takes the chain out of the cell; the cell
//! is the single point of synchronization, so any number of units may
//! race to resume and exactly one wins. The losers observe an empty
//! cell and report the continuation as already resumed; they never see
//! a partial chain.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::effects::FiberError;
use crate::stack::{HandlerTriple, StackBox, StackSegment};
use crate::stats::FiberStats;

/// A captured, at-most-once-resumable stack chain.
pub struct Continuation {
    chain: AtomicPtr<StackSegment>,
}

// Safety: the chain is transferred whole through the atomic cell; the
// winner of take has exclusive ownership.
unsafe impl Send for Continuation {}
unsafe impl Sync for Continuation {}

impl Continuation {
    /// Capture a chain into a fresh continuation.
    pub fn capture(chain: StackBox) -> Self {
        Self {
            chain: AtomicPtr::new(Box::into_raw(chain)),
        }
    }

    /// A continuation that was already resumed.
    pub fn empty() -> Self {
        Self {
            chain: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Whether the chain has already been taken.
    ///
    /// Advisory only: a `false` answer may be stale by the time the
    /// caller acts on it.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chain.load(Ordering::Acquire).is_null()
    }

    /// Take the chain, winning against concurrent takers.
    ///
    /// Returns `None` if the continuation was already resumed, either
    /// before this call or by a concurrent taker that won the exchange.
    pub fn take(&self) -> Option<StackBox> {
        let ptr = self.chain.load(Ordering::Acquire);
        if ptr.is_null() {
            return None;
        }
        match self.chain.compare_exchange(
            ptr,
            ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(won) => Some(unsafe { Box::from_raw(won) }),
            Err(_) => None,
        }
    }

    /// [`take`](Self::take), with a losing attempt surfaced as the
    /// error the raise path reports.
    pub fn take_strict(&self) -> Result<StackBox, FiberError> {
        self.take().ok_or(FiberError::AlreadyResumed)
    }

    /// [`take`](Self::take), recording the outcome in `stats`.
    pub fn take_counted(&self, stats: &FiberStats) -> Option<StackBox> {
        match self.take() {
            Some(chain) => {
                FiberStats::bump(&stats.takes);
                Some(chain)
            }
            None => {
                FiberStats::bump(&stats.take_conflicts);
                None
            }
        }
    }

    /// Take the chain and retarget its outermost segment's handlers.
    ///
    /// Used when a handler resumes a continuation under its own scope:
    /// control leaving the captured chain must now transfer to the
    /// resuming scope's handlers, which live at the chain's outer end.
    pub fn take_and_update_handler(&self, triple: HandlerTriple) -> Option<StackBox> {
        let mut chain = self.take()?;
        let mut seg: *mut StackSegment = &mut *chain;
        unsafe {
            while !(*seg).parent_ptr().is_null() {
                seg = (*seg).parent_ptr();
            }
            (*seg).set_triple(triple);
        }
        Some(chain)
    }

    /// Put a chain back into an empty continuation.
    ///
    /// Used when a resume attempt is abandoned after taking the chain
    /// (a cleanup path). The cell must still be empty; the owner of the
    /// taken chain is the only unit entitled to put one back.
    pub fn replace(&self, chain: StackBox) {
        let fresh = Box::into_raw(chain);
        let swapped =
            self.chain
                .compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire);
        debug_assert!(swapped.is_ok(), "replace on a non-empty continuation");
        if swapped.is_err() {
            // Do not leak the chain even if the invariant was violated.
            drop(unsafe { Box::from_raw(fresh) });
        }
    }
}

impl Drop for Continuation {
    fn drop(&mut self) {
        let ptr = *self.chain.get_mut();
        if !ptr.is_null() {
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Continuation")
            .field("taken", &self.is_empty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FiberConfig;
    use crate::stack::{StackAllocator, StackIdSource};
    use opal_core::Value;

    fn allocator() -> StackAllocator {
        let config = FiberConfig {
            fiber_words: 64,
            guard_pages: false,
            ..Default::default()
        };
        StackAllocator::new(config, StackIdSource::new())
    }

    #[test]
    fn test_take_is_at_most_once() {
        let mut alloc = allocator();
        let stack = alloc.alloc(64, HandlerTriple::UNIT).expect("stack");
        let id = stack.id();

        let k = Continuation::capture(stack);
        assert!(!k.is_empty());

        let taken = k.take().expect("first take");
        assert_eq!(taken.id(), id);
        assert!(k.is_empty());
        assert!(k.take().is_none(), "second take observes empty");
        assert_eq!(k.take_strict().unwrap_err(), FiberError::AlreadyResumed);

        alloc.free(taken);
    }

    #[test]
    fn test_take_counted_records_both_outcomes() {
        let mut alloc = allocator();
        let k = Continuation::capture(alloc.alloc(64, HandlerTriple::UNIT).expect("stack"));
        let stats = FiberStats::new();

        let taken = k.take_counted(&stats).expect("take");
        assert!(k.take_counted(&stats).is_none());
        assert_eq!(FiberStats::get(&stats.takes), 1);
        assert_eq!(FiberStats::get(&stats.take_conflicts), 1);

        alloc.free(taken);
    }

    #[test]
    fn test_take_and_update_handler_hits_outermost_only() {
        let mut alloc = allocator();
        let mut inner = alloc.alloc(64, HandlerTriple::UNIT).expect("stack");
        let outer = alloc.alloc(64, HandlerTriple::UNIT).expect("stack");
        inner.set_parent(Some(outer));

        let triple = HandlerTriple {
            on_return: Value::int(1),
            on_exception: Value::int(2),
            on_effect: Value::int(3),
        };
        let k = Continuation::capture(inner);
        let taken = k.take_and_update_handler(triple).expect("take");

        assert_eq!(taken.triple(), HandlerTriple::UNIT, "inner untouched");
        assert_eq!(taken.parent().expect("parent").triple(), triple);

        alloc.free_chain(taken);
    }

    #[test]
    fn test_replace_restores_the_chain() {
        let mut alloc = allocator();
        let stack = alloc.alloc(64, HandlerTriple::UNIT).expect("stack");
        let id = stack.id();

        let k = Continuation::capture(stack);
        let taken = k.take().expect("take");
        k.replace(taken);

        assert!(!k.is_empty());
        let again = k.take().expect("take after replace");
        assert_eq!(again.id(), id);
        alloc.free(again);
    }

    #[test]
    fn test_drop_releases_an_untaken_chain() {
        let mut alloc = allocator();
        let stack = alloc.alloc(64, HandlerTriple::UNIT).expect("stack");
        let k = Continuation::capture(stack);
        drop(k); // chain is owned by the cell and freed with it
    }
}
