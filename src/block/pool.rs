//! `SimplePool<T>` / `TaggedPool<K, T>`: mutex-guarded LIFO free-lists.
//!
//! Grounded in `original_source/.../baselib/core/Pool.h` (`SimplePool`,
//! `TaggedPool`, the `SimplePoolCheckerNaiveImpl` / `...IntrusiveImplPtr`
//! checker policies) and in the teacher's `broker::ring_buffer` pattern of a
//! mutex-guarded fixed-size structure shared across tasks. The pool is a
//! performance optimization, not a correctness boundary: `try_get()`
//! returning `None` simply means the caller allocates a fresh instance.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Mutex;

/// A type that can report/flag itself as freed, for the intrusive checker
/// policy (mirrors `SimplePoolCheckerIntrusiveImplPtr` reading a `freed()`
/// flag directly on the pooled value).
pub trait Freeable {
    fn freed(&self) -> bool;
    fn set_freed(&mut self, freed: bool);
}

/// Double-free detection policy. Mirrors the two checker implementations in
/// `Pool.h`.
pub trait PoolChecker<T> {
    /// Called when an item is returned to the pool. Panics (matching
    /// `BL_RT_ASSERT`) if the item was already marked free.
    fn on_put(&mut self, item: &mut T, cookie: u64);
    /// Called when an item is handed out. Clears the freed marker.
    fn on_get(&mut self, item: &mut T, cookie: u64);
}

/// Tracks freed cookies in a side table; works for any `T`, at the cost of a
/// `HashSet` lookup per put/get. Mirrors `SimplePoolCheckerNaiveImpl`.
#[derive(Debug, Default)]
pub struct NaiveChecker {
    freed: HashSet<u64>,
}

impl<T> PoolChecker<T> for NaiveChecker {
    fn on_put(&mut self, _item: &mut T, cookie: u64) {
        assert!(
            self.freed.insert(cookie),
            "double free detected in pool (cookie {cookie})"
        );
    }

    fn on_get(&mut self, _item: &mut T, cookie: u64) {
        self.freed.remove(&cookie);
    }
}

/// Reads/writes a `freed` flag directly on the pooled value; no side table.
/// Mirrors `SimplePoolCheckerIntrusiveImplPtr`.
#[derive(Debug, Default)]
pub struct IntrusiveChecker;

impl<T: Freeable> PoolChecker<T> for IntrusiveChecker {
    fn on_put(&mut self, item: &mut T, _cookie: u64) {
        assert!(!item.freed(), "double free detected in pool (intrusive)");
        item.set_freed(true);
    }

    fn on_get(&mut self, item: &mut T, _cookie: u64) {
        item.set_freed(false);
    }
}

struct PoolInner<T, C> {
    items: Vec<T>,
    next_cookie: u64,
    checker: C,
}

/// A multi-producer, multi-consumer LIFO of `T` guarded by a mutex.
pub struct SimplePool<T, C = NaiveChecker> {
    inner: Mutex<PoolInner<T, C>>,
}

impl<T> SimplePool<T, NaiveChecker> {
    pub fn new() -> Self {
        Self::with_checker(NaiveChecker::default())
    }
}

impl<T> Default for SimplePool<T, NaiveChecker> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, C: PoolChecker<T>> SimplePool<T, C> {
    pub fn with_checker(checker: C) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                items: Vec::new(),
                next_cookie: 0,
                checker,
            }),
        }
    }

    /// Returns `None` if the pool is empty; the caller must allocate fresh.
    pub fn try_get(&self) -> Option<T> {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        let mut item = inner.items.pop()?;
        let cookie = inner.next_cookie;
        inner.checker.on_get(&mut item, cookie);
        Some(item)
    }

    pub fn put(&self, mut item: T) {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        inner.next_cookie += 1;
        let cookie = inner.next_cookie;
        inner.checker.on_put(&mut item, cookie);
        inner.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pool mutex poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A keyed variant: one `SimplePool` per key, behind a single mutex-guarded
/// map. Mirrors `TaggedPool<K, T>` in `Pool.h`.
pub struct TaggedPool<K, T, C = NaiveChecker> {
    pools: Mutex<HashMap<K, Vec<T>>>,
    _checker: std::marker::PhantomData<C>,
}

impl<K: Eq + Hash, T> TaggedPool<K, T, NaiveChecker> {
    pub fn new() -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            _checker: std::marker::PhantomData,
        }
    }
}

impl<K: Eq + Hash, T> Default for TaggedPool<K, T, NaiveChecker> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash, T, C> TaggedPool<K, T, C> {
    pub fn try_get(&self, tag: &K) -> Option<T> {
        let mut pools = self.pools.lock().expect("pool mutex poisoned");
        pools.get_mut(tag).and_then(|v| v.pop())
    }

    pub fn put(&self, tag: K, item: T) {
        let mut pools = self.pools.lock().expect("pool mutex poisoned");
        pools.entry(tag).or_default().push(item);
    }

    pub fn len_for(&self, tag: &K) -> usize {
        self.pools
            .lock()
            .expect("pool mutex poisoned")
            .get(tag)
            .map_or(0, Vec::len)
    }
}
