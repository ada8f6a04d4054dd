//! Positional placeholder tokens (`$1`, `$2`, ...).
//!
//! Tokens for small positions are formatted once and shared for the life
//! of the process. Positions past the cached range are formatted on demand
//! and render identically.

use std::sync::{Arc, LazyLock};

/// Number of positions served from the shared table.
pub const CACHED_PLACEHOLDERS: usize = 4096;

static CACHE: LazyLock<Vec<Arc<str>>> = LazyLock::new(|| {
    (0..CACHED_PLACEHOLDERS)
        .map(|pos| Arc::from(format_placeholder(pos)))
        .collect()
});

/// The token for the 1-based argument position `pos`.
pub fn placeholder(pos: usize) -> Arc<str> {
    match CACHE.get(pos) {
        Some(token) => Arc::clone(token),
        None => Arc::from(format_placeholder(pos)),
    }
}

/// Format a token without consulting the cache.
pub fn format_placeholder(pos: usize) -> String {
    format!("${pos}")
}
