//! Effect and exception glue.
//!
//! The engine signals fiber misuse through named conditions registered
//! by the standard library at startup (an unhandled effect, a
//! continuation resumed twice). This module keeps the registry, caches
//! the hot lookups behind atomics, and builds the carrier blocks those
//! conditions are raised with. A carrier is allocated outside the
//! managed heap and marked not-markable, so scanners skip it and it
//! stays valid for the raise regardless of collector activity.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use opal_core::{Color, Header, Value};

/// Errors surfaced by stack and continuation operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberError {
    /// The system refused to provide stack memory.
    OutOfMemory,
    /// Growth hit the configured maximum stack size.
    StackOverflow,
    /// The continuation was already resumed.
    AlreadyResumed,
    /// An effect reached the outermost handler without being handled.
    /// Carries the performed effect value.
    UnhandledEffect(Value),
}

impl std::fmt::Display for FiberError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FiberError::OutOfMemory => write!(f, "out of stack memory"),
            FiberError::StackOverflow => write!(f, "stack overflow"),
            FiberError::AlreadyResumed => write!(f, "continuation already resumed"),
            FiberError::UnhandledEffect(v) => write!(f, "unhandled effect {v:?}"),
        }
    }
}

impl std::error::Error for FiberError {}

// =============================================================================
// Named condition registry
// =============================================================================

/// Runtime registry of named condition constructors.
///
/// The standard library registers each condition value under a stable
/// name during startup; the engine looks them up by name when raising.
/// Registration is rare and lookup is cached, so a single lock suffices.
#[derive(Default)]
pub struct ConditionRegistry {
    by_name: RwLock<FxHashMap<String, Value>>,
}

impl ConditionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `value` as the condition named `name`, replacing any
    /// previous registration.
    pub fn register(&self, name: &str, value: Value) {
        self.by_name.write().insert(name.to_owned(), value);
    }

    /// Look up a condition by name.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.by_name.read().get(name).copied()
    }
}

/// One lazily cached registry lookup.
///
/// The raise paths that use these run on every unhandled effect, so
/// the name lookup is done once and the result published through an
/// atomic for every later raise.
pub struct CachedCondition {
    name: &'static str,
    /// Raw condition value; 0 means not yet resolved.
    cached: AtomicUsize,
}

impl CachedCondition {
    /// A cache for the condition named `name`.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            cached: AtomicUsize::new(0),
        }
    }

    /// The condition's registered name.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Resolve the condition, consulting the registry on first use.
    pub fn get(&self, registry: &ConditionRegistry) -> Option<Value> {
        let raw = self.cached.load(Ordering::Acquire);
        if raw != 0 {
            return Some(Value::from_raw(raw));
        }
        let value = registry.lookup(self.name)?;
        self.cached.store(value.raw(), Ordering::Release);
        Some(value)
    }

    /// Resolve the condition; a missing registration is a startup
    /// defect and fatal.
    pub fn require(&self, registry: &ConditionRegistry) -> Value {
        match self.get(registry) {
            Some(v) => v,
            None => crate::fatal(self.name),
        }
    }
}

// =============================================================================
// Standard effect conditions
// =============================================================================

/// The two conditions the fiber subsystem raises.
pub struct EffectConditions {
    unhandled: CachedCondition,
    already_resumed: CachedCondition,
}

/// Name the standard library registers the unhandled-effect condition under.
pub const UNHANDLED_EFFECT: &str = "Effect.Unhandled";
/// Name the standard library registers the double-resume condition under.
pub const CONTINUATION_ALREADY_RESUMED: &str = "Effect.Continuation_already_resumed";

impl EffectConditions {
    /// Fresh caches for the standard conditions.
    pub const fn new() -> Self {
        Self {
            unhandled: CachedCondition::new(UNHANDLED_EFFECT),
            already_resumed: CachedCondition::new(CONTINUATION_ALREADY_RESUMED),
        }
    }

    /// Carrier for raising an unhandled effect, wrapping the performed
    /// effect value.
    pub fn unhandled_carrier(&self, registry: &ConditionRegistry, effect: Value) -> Value {
        let cond = self.unhandled.require(registry);
        alloc_carrier(&[cond, effect])
    }

    /// Carrier for raising a double resume.
    pub fn already_resumed_carrier(&self, registry: &ConditionRegistry) -> Value {
        let cond = self.already_resumed.require(registry);
        alloc_carrier(&[cond])
    }
}

impl Default for EffectConditions {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocate a condition carrier block off the managed heap.
///
/// The block is leaked: raise paths must work even when the collector
/// cannot run, and a handful of leaked carriers per process is the
/// accepted cost. Scanners skip it via the not-markable color.
pub fn alloc_carrier(fields: &[Value]) -> Value {
    let mut words: Vec<usize> = Vec::with_capacity(fields.len() + 1);
    words.push(Header::new(0, Color::NotMarkable, fields.len()).raw());
    words.extend(fields.iter().map(|v| v.raw()));
    let leaked: &'static mut [usize] = Vec::leak(words);
    Value::from_ptr(&leaked[1] as *const usize as *const ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_register_and_lookup() {
        let registry = ConditionRegistry::new();
        assert!(registry.lookup("Effect.Unhandled").is_none());

        registry.register("Effect.Unhandled", Value::int(11));
        assert_eq!(registry.lookup("Effect.Unhandled"), Some(Value::int(11)));

        registry.register("Effect.Unhandled", Value::int(12));
        assert_eq!(registry.lookup("Effect.Unhandled"), Some(Value::int(12)));
    }

    #[test]
    fn test_cached_condition_resolves_once() {
        let registry = ConditionRegistry::new();
        registry.register("Effect.Unhandled", Value::int(11));

        let cached = CachedCondition::new(UNHANDLED_EFFECT);
        assert_eq!(cached.get(&registry), Some(Value::int(11)));

        // Later registrations do not disturb the cached binding.
        registry.register("Effect.Unhandled", Value::int(99));
        assert_eq!(cached.get(&registry), Some(Value::int(11)));
    }

    #[test]
    #[should_panic(expected = "Effect.Unhandled")]
    fn test_missing_condition_is_fatal() {
        let registry = ConditionRegistry::new();
        CachedCondition::new(UNHANDLED_EFFECT).require(&registry);
    }

    #[test]
    fn test_carrier_layout() {
        let carrier = alloc_carrier(&[Value::int(1), Value::int(2)]);
        assert!(carrier.is_block());

        let header = unsafe { Header::of_value(carrier) };
        assert_eq!(header.wosize(), 2);
        assert_eq!(header.color(), Color::NotMarkable);

        unsafe {
            let fields = carrier.as_ptr() as *const Value;
            assert_eq!(*fields, Value::int(1));
            assert_eq!(*fields.add(1), Value::int(2));
        }
    }

    #[test]
    fn test_unhandled_carrier_wraps_effect() {
        let registry = ConditionRegistry::new();
        registry.register(UNHANDLED_EFFECT, Value::int(7));

        let conditions = EffectConditions::new();
        let carrier = conditions.unhandled_carrier(&registry, Value::int(42));
        unsafe {
            let fields = carrier.as_ptr() as *const Value;
            assert_eq!(*fields, Value::int(7));
            assert_eq!(*fields.add(1), Value::int(42));
        }
    }

    #[test]
    fn test_error_display() {
        assert_eq!(FiberError::StackOverflow.to_string(), "stack overflow");
        assert_eq!(
            FiberError::AlreadyResumed.to_string(),
            "continuation already resumed"
        );
    }
}
