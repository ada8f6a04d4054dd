//! Recycling pool for [`Query`] accumulators.
//!
//! Building statements in a hot loop allocates a text buffer and an argument
//! vector per statement. The pool keeps a bounded free list of reset
//! accumulators so their storage can be reused. [`PooledQuery`] is an RAII
//! guard that hands its accumulator back when dropped.

use std::ops::{Deref, DerefMut};
use std::sync::LazyLock;

use parking_lot::Mutex;
use tracing::trace;

use crate::query::Query;

/// Text capacity of a freshly allocated pooled accumulator, in bytes.
pub const DEFAULT_TEXT_CAPACITY: usize = 1024;
/// Argument capacity of a freshly allocated pooled accumulator.
pub const DEFAULT_ARGS_CAPACITY: usize = 16;
/// Idle accumulators kept by [`QueryPool::new`].
pub const MAX_POOLED: usize = 64;

static GLOBAL: LazyLock<QueryPool> = LazyLock::new(QueryPool::new);

/// A mutex-guarded free list of reset accumulators.
///
/// ```rust
/// use pgtmpl::QueryPool;
///
/// let pool = QueryPool::new();
/// {
///     let mut q = pool.acquire();
///     q.push_str("SELECT 1");
/// }
/// assert_eq!(pool.idle(), 1);
/// assert!(pool.acquire().is_empty());
/// ```
pub struct QueryPool {
    free: Mutex<Vec<Query>>,
    max_idle: usize,
}

impl QueryPool {
    pub fn new() -> Self {
        Self::with_max_idle(MAX_POOLED)
    }

    /// A pool that keeps at most `max_idle` released accumulators.
    pub fn with_max_idle(max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// The process-wide pool.
    pub fn global() -> &'static QueryPool {
        &GLOBAL
    }

    /// Take a reset accumulator out of the pool, allocating one when the
    /// free list is empty.
    pub fn take(&self) -> Query {
        self.free.lock().pop().unwrap_or_else(|| {
            trace!("query pool empty, allocating");
            Query::with_capacity(DEFAULT_TEXT_CAPACITY, DEFAULT_ARGS_CAPACITY)
        })
    }

    /// Take an accumulator that returns to the pool when the guard drops.
    pub fn acquire(&self) -> PooledQuery<'_> {
        PooledQuery {
            pool: self,
            query: self.take(),
        }
    }

    /// Reset `query` and keep it for reuse. Accumulators without storage and
    /// those beyond the idle limit are dropped.
    pub fn release(&self, mut query: Query) {
        if query.capacity() == 0 {
            return;
        }
        query.reset();
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(query);
        }
    }

    /// Number of accumulators waiting in the free list.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

impl Default for QueryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QueryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryPool")
            .field("idle", &self.idle())
            .field("max_idle", &self.max_idle)
            .finish()
    }
}

/// RAII guard for an accumulator borrowed from a [`QueryPool`].
pub struct PooledQuery<'p> {
    pool: &'p QueryPool,
    query: Query,
}

impl PooledQuery<'_> {
    /// Keep the accumulator instead of returning it to the pool.
    pub fn into_inner(mut self) -> Query {
        std::mem::take(&mut self.query)
    }
}

impl Deref for PooledQuery<'_> {
    type Target = Query;

    fn deref(&self) -> &Query {
        &self.query
    }
}

impl DerefMut for PooledQuery<'_> {
    fn deref_mut(&mut self) -> &mut Query {
        &mut self.query
    }
}

impl Drop for PooledQuery<'_> {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.query));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::value::Value;

    #[test]
    fn test_release_resets_and_reuses_storage() {
        let pool = QueryPool::new();
        let mut q = pool.take();
        q.push_str("SELECT $1");
        q.bind_arg(Value::Int(1));
        pool.release(q);

        let q = pool.take();
        assert!(q.is_empty());
        assert!(q.args().is_empty());
        assert!(q.capacity() >= DEFAULT_TEXT_CAPACITY);
    }

    #[test]
    fn test_guard_returns_on_drop() {
        let pool = QueryPool::new();
        {
            let mut q = pool.acquire();
            q.push_str("x");
            assert_eq!(pool.idle(), 0);
        }
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_into_inner_keeps_the_query() {
        let pool = QueryPool::new();
        let mut guard = pool.acquire();
        guard.push_str("kept");
        let q = guard.into_inner();
        assert_eq!(q.as_str(), "kept");
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_idle_limit() {
        let pool = QueryPool::with_max_idle(2);
        let taken: Vec<_> = (0..3).map(|_| pool.take()).collect();
        for q in taken {
            pool.release(q);
        }
        assert_eq!(pool.idle(), 2);

        pool.release(Query::new());
        assert_eq!(pool.idle(), 2);
    }
}
