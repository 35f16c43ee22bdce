//! Fiber subsystem configuration.
//!
//! All sizes are in words. Set once at engine startup and shared by
//! every execution unit.

/// Configuration for stack allocation, pooling, and scanning.
///
/// # Example
///
/// ```ignore
/// use opal_fiber::FiberConfig;
///
/// // Compiled backend with guard-page overflow detection
/// let config = FiberConfig {
///     guard_pages: true,
///     frame_pointers: true,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct FiberConfig {
    /// Initial size of the main fiber's stack, in words.
    ///
    /// Clamped to `max_stack_words` at allocation time.
    ///
    /// Default: 4096 words
    pub initial_stack_words: usize,

    /// Maximum size any stack may grow to, in words.
    ///
    /// Growth past this limit fails with a stack-overflow condition.
    ///
    /// Default: 1M words (8MB on 64-bit)
    pub max_stack_words: usize,

    /// Size-class granularity: class `k` holds stacks of
    /// `fiber_words << k` words. Fresh fibers are allocated at class 0.
    ///
    /// Default: 512 words
    pub fiber_words: usize,

    /// Number of pooled size classes. Requests that match no class
    /// exactly are allocated individually and never pooled.
    ///
    /// Default: 5
    pub size_class_count: usize,

    /// Reserve an inaccessible guard page below each stack so overflow
    /// faults instead of silently corrupting adjacent memory. Used by
    /// the compiled backend; fault translation is external.
    ///
    /// Default: false
    pub guard_pages: bool,

    /// Whether compiled frames carry a saved frame pointer below the
    /// return address, and growth must rewrite the frame-pointer chain.
    ///
    /// Default: false
    pub frame_pointers: bool,

    /// Overwrite freed stack memory with a poison pattern before
    /// pooling, to catch use-after-free in the engine.
    ///
    /// Default: true in debug builds
    pub poison_freed: bool,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self {
            initial_stack_words: 4096,
            max_stack_words: 1024 * 1024,
            fiber_words: 512,
            size_class_count: 5,
            guard_pages: false,
            frame_pointers: false,
            poison_freed: cfg!(debug_assertions),
        }
    }
}

impl FiberConfig {
    /// Configuration for the interpreted backend: no guard pages, no
    /// frame-pointer chain.
    pub fn interpreted() -> Self {
        Self::default()
    }

    /// Configuration for the compiled backend: guard-page overflow
    /// detection and frame-pointer fixup on growth.
    pub fn compiled() -> Self {
        Self {
            guard_pages: true,
            frame_pointers: true,
            ..Default::default()
        }
    }

    /// Configuration for memory-constrained embeddings.
    pub fn low_memory() -> Self {
        Self {
            initial_stack_words: 1024,
            max_stack_words: 64 * 1024,
            fiber_words: 128,
            ..Default::default()
        }
    }

    /// The initial stack size, clamped to the configured maximum.
    #[inline]
    pub fn clamped_initial_words(&self) -> usize {
        self.initial_stack_words.min(self.max_stack_words)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fiber_words < 16 {
            return Err(ConfigError::FiberSizeTooSmall);
        }
        if self.size_class_count == 0 || self.size_class_count > 16 {
            return Err(ConfigError::InvalidClassCount);
        }
        if self.initial_stack_words < 16 {
            return Err(ConfigError::InitialStackTooSmall);
        }
        if self.max_stack_words < self.fiber_words {
            return Err(ConfigError::MaxBelowFiberSize);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Size-class granularity is too small (minimum 16 words).
    FiberSizeTooSmall,
    /// Size-class count must be between 1 and 16.
    InvalidClassCount,
    /// Initial stack size is too small (minimum 16 words).
    InitialStackTooSmall,
    /// Maximum stack size is below the class-0 size.
    MaxBelowFiberSize,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FiberSizeTooSmall => {
                write!(f, "fiber size-class granularity must be at least 16 words")
            }
            ConfigError::InvalidClassCount => {
                write!(f, "size-class count must be between 1 and 16")
            }
            ConfigError::InitialStackTooSmall => {
                write!(f, "initial stack size must be at least 16 words")
            }
            ConfigError::MaxBelowFiberSize => {
                write!(f, "maximum stack size must cover at least one class-0 stack")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(FiberConfig::default().validate().is_ok());
    }

    #[test]
    fn test_preset_configs_are_valid() {
        assert!(FiberConfig::interpreted().validate().is_ok());
        assert!(FiberConfig::compiled().validate().is_ok());
        assert!(FiberConfig::low_memory().validate().is_ok());
    }

    #[test]
    fn test_invalid_fiber_size() {
        let config = FiberConfig {
            fiber_words: 8,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::FiberSizeTooSmall));
    }

    #[test]
    fn test_invalid_class_count() {
        let config = FiberConfig {
            size_class_count: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidClassCount));
    }

    #[test]
    fn test_initial_clamped_to_max() {
        let config = FiberConfig {
            initial_stack_words: 1 << 30,
            ..Default::default()
        };
        assert_eq!(config.clamped_initial_words(), config.max_stack_words);
    }
}
