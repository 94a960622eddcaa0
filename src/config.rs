//! Thread sizing configuration
//!
//! Sizes come from built-in defaults, optionally overridden by
//! `TYPTHON_THREAD_STACK_SIZE` / `TYPTHON_THREAD_STORAGE_SIZE`
//! (decimal bytes with an optional `k`/`m` suffix).

use crate::allocator::os;
use once_cell::sync::Lazy;

/// Default usable stack per thread
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Default storage (arena) per thread
pub const DEFAULT_STORAGE_SIZE: usize = 64 * 1024;

/// Smallest stack that still holds the control block and a usable frame
pub const MIN_STACK_SIZE: usize = 16 * 1024;

static GLOBAL: Lazy<ThreadConfig> = Lazy::new(ThreadConfig::from_env);

/// Stack and storage sizes for new threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadConfig {
    pub stack_size: usize,
    pub storage_size: usize,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            storage_size: DEFAULT_STORAGE_SIZE,
        }
    }
}

impl ThreadConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(size) = env_size("TYPTHON_THREAD_STACK_SIZE") {
            config.stack_size = size;
        }
        if let Some(size) = env_size("TYPTHON_THREAD_STORAGE_SIZE") {
            config.storage_size = size;
        }

        config
    }

    /// Process-wide configuration, read from the environment once
    pub fn global() -> &'static ThreadConfig {
        &GLOBAL
    }

    /// Sizes clamped to their minimums and rounded up to whole pages
    pub fn rounded(&self) -> (usize, usize) {
        let stack = os::round_to_pages(self.stack_size.max(MIN_STACK_SIZE));
        let storage = os::round_to_pages(self.storage_size.max(1));
        (stack, storage)
    }
}

fn env_size(var: &str) -> Option<usize> {
    let raw = std::env::var(var).ok()?;
    match parse_size(&raw) {
        Some(size) => Some(size),
        None => {
            tracing::warn!(target: "thread", variable = var, value = %raw, "Ignoring malformed size");
            None
        }
    }
}

/// Parse `"4096"`, `"64k"`, `"2M"` into bytes
pub fn parse_size(s: &str) -> Option<usize> {
    let s = s.trim();
    let (digits, multiplier) = match s.as_bytes().last()? {
        b'k' | b'K' => (&s[..s.len() - 1], 1024),
        b'm' | b'M' => (&s[..s.len() - 1], 1024 * 1024),
        _ => (s, 1),
    };

    let value: usize = digits.trim().parse().ok()?;
    match value.checked_mul(multiplier)? {
        0 => None,
        bytes => Some(bytes),
    }
}
