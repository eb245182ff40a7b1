use core::ptr::NonNull;
use std::collections::VecDeque;

use parking_lot::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::{
  arena::{Arena, ArenaConfig, ArenaStats, RawAlloc},
  error::{AllocFailure, Error},
  utils::align_up,
};

/// Arenas bound to one NUMA node. Grows by one arena whenever none of the
/// existing ones can serve a request; never shrinks.
pub struct ArenaPool {
  // newest first
  arenas: VecDeque<Arena>,
  node: usize,
  config: ArenaConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
  pub arenas: usize,
  pub totals: ArenaStats,
}

impl ArenaPool {
  /// The home arena has to be reserved up front.
  pub fn new(node: usize, config: ArenaConfig) -> Result<Self, Error> {
    let home = Arena::new(node, &config)?;
    let mut arenas = VecDeque::new();
    arenas.push_back(home);
    return Ok(Self { arenas, node, config });
  }
  pub fn node(&self) -> usize {
    self.node
  }
  pub fn arena_count(&self) -> usize {
    self.arenas.len()
  }
  pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, AllocFailure> {
    for arena in self.arenas.iter_mut() {
      if let Ok(ptr) = arena.alloc(size) { return Ok(ptr) }
    }
    let capacity = self.config.capacity();
    // a fresh arena hands out at most its capacity, after rounding
    if size > capacity || align_up(size.max(1), self.config.alignment) > capacity {
      return Err(AllocFailure::WontFit { requested: size, capacity });
    }
    let fresh = match Arena::new(self.node, &self.config) {
      Ok(arena) => arena,
      Err(Error::Alloc(failure)) => {
        warn!(node = self.node, error = %failure, "could not grow arena pool");
        return Err(failure);
      },
      Err(other) => unreachable!("config was validated with the home arena: {other}"),
    };
    info!(node = self.node, arenas = self.arenas.len() + 1, ?size, "arena pool grew");
    self.arenas.push_front(fresh);
    return self.arenas[0].alloc(size);
  }
  pub fn free(&mut self, ptr: *mut u8) {
    if let Some(arena) = self.arenas.iter_mut().find(|arena| arena.is_in_pool(ptr)) {
      arena.free(ptr)
    }
  }
  pub fn is_in_pool(&self, ptr: *const u8) -> bool {
    self.arenas.iter().any(|arena| arena.is_in_pool(ptr))
  }
  pub fn stats(&self) -> PoolStats {
    let mut stats = PoolStats { arenas: self.arenas.len(), ..PoolStats::default() };
    for arena in &self.arenas {
      let one = arena.stats();
      let totals = &mut stats.totals;
      totals.capacity += one.capacity;
      totals.allocated += one.allocated;
      totals.free += one.free;
      totals.largest_free = totals.largest_free.max(one.largest_free);
      totals.fragments += one.fragments;
    }
    return stats;
  }
}

impl RawAlloc for ArenaPool {
  fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, AllocFailure> {
    ArenaPool::alloc(self, size)
  }
  fn free(&mut self, ptr: *mut u8) {
    ArenaPool::free(self, ptr)
  }
  fn is_in_pool(&self, ptr: *const u8) -> bool {
    ArenaPool::is_in_pool(self, ptr)
  }
}

/// Serializes any allocator behind one lock so every worker of a NUMA node
/// can share it.
pub struct SyncPool<P = ArenaPool> {
  inner: Mutex<P>,
}

impl SyncPool<ArenaPool> {
  pub fn new(node: usize, config: ArenaConfig) -> Result<Self, Error> {
    Ok(Self::wrap(ArenaPool::new(node, config)?))
  }
  pub fn stats(&self) -> PoolStats {
    self.inner.lock().stats()
  }
}

impl<P: RawAlloc> SyncPool<P> {
  pub fn wrap(pool: P) -> Self {
    Self { inner: Mutex::new(pool) }
  }
  pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, AllocFailure> {
    self.inner.lock().alloc(size)
  }
  pub fn free(&self, ptr: *mut u8) {
    self.inner.lock().free(ptr)
  }
  pub fn is_in_pool(&self, ptr: *const u8) -> bool {
    self.inner.lock().is_in_pool(ptr)
  }
  /// Holds the lock for a batch of operations.
  pub fn lock(&self) -> MutexGuard<'_, P> {
    self.inner.lock()
  }
  pub fn into_inner(self) -> P {
    self.inner.into_inner()
  }
}

impl<P: RawAlloc> RawAlloc for SyncPool<P> {
  fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, AllocFailure> {
    self.inner.get_mut().alloc(size)
  }
  fn free(&mut self, ptr: *mut u8) {
    self.inner.get_mut().free(ptr)
  }
  fn is_in_pool(&self, ptr: *const u8) -> bool {
    SyncPool::is_in_pool(self, ptr)
  }
}

#[cfg(test)]
fn tiny() -> ArenaConfig {
  ArenaConfig::default().size(64 * 1024)
}

#[test]
fn grows_when_full() {
  let mut pool = ArenaPool::new(0, tiny()).unwrap();
  let first = pool.alloc(60 * 1024).unwrap();
  assert!(pool.arena_count() == 1);
  let second = pool.alloc(60 * 1024).unwrap();
  assert!(pool.arena_count() == 2);
  assert!(pool.is_in_pool(first.as_ptr()) && pool.is_in_pool(second.as_ptr()));
  // newest arena is consulted first
  let third = pool.alloc(1024).unwrap();
  assert!(pool.arenas[0].is_in_pool(third.as_ptr()));
  pool.free(first.as_ptr());
  pool.free(second.as_ptr());
  pool.free(third.as_ptr());
  let stats = pool.stats();
  assert!(stats.arenas == 2, "arenas are never released");
  assert!(stats.totals.allocated == 0 && stats.totals.free == stats.totals.capacity);
}

#[test]
fn oversized_request_does_not_grow() {
  let mut pool = ArenaPool::new(0, tiny()).unwrap();
  match pool.alloc(128 * 1024) {
    Err(AllocFailure::WontFit { requested, capacity }) => {
      assert!(requested == 128 * 1024);
      assert!(capacity == tiny().capacity());
    },
    other => panic!("expected WontFit, got {other:?}"),
  }
  assert!(pool.arena_count() == 1);
}

#[test]
fn huge_requests_do_not_grow() {
  let mut pool = ArenaPool::new(0, tiny()).unwrap();
  for size in [usize::MAX, usize::MAX - 8] {
    assert!(matches!(pool.alloc(size), Err(AllocFailure::WontFit { requested, .. }) if requested == size));
  }
  assert!(pool.arena_count() == 1);
}

#[test]
fn unaligned_arena_size_does_not_grow_forever() {
  // capacity is 65501, which no aligned block size matches exactly
  let config = ArenaConfig::default().size(64 * 1024 - 3);
  let mut pool = ArenaPool::new(0, config.clone()).unwrap();
  let size = config.capacity();
  assert!(size % config.alignment != 0);
  for _ in 0 .. 3 {
    assert!(matches!(pool.alloc(size), Err(AllocFailure::WontFit { .. })));
  }
  assert!(pool.arena_count() == 1);
  let fits = align_up(size, config.alignment) - config.alignment;
  assert!(pool.alloc(fits).is_ok());
}

#[test]
fn foreign_pointer_is_not_in_pool() {
  let mut pool = ArenaPool::new(0, tiny()).unwrap();
  let mut local = 7u32;
  let ptr = &mut local as *mut u32 as *mut u8;
  assert!(!pool.is_in_pool(ptr));
  let before = pool.stats();
  pool.free(ptr);
  assert!(pool.stats() == before);
  assert!(local == 7);
}

#[test]
fn shared_between_threads() {
  let pool = SyncPool::new(0, ArenaConfig::default().size(1 << 20)).unwrap();
  std::thread::scope(|scope| {
    for t in 0 .. 8u8 {
      let pool = &pool;
      scope.spawn(move || {
        for _ in 0 .. 200 {
          let ptr = pool.alloc(64).unwrap();
          unsafe { ptr.as_ptr().write_bytes(t, 64) };
          assert!(pool.is_in_pool(ptr.as_ptr()));
          assert!(unsafe { ptr.as_ptr().add(63).read() } == t);
          pool.free(ptr.as_ptr());
        }
      });
    }
  });
  let stats = pool.stats();
  assert!(stats.totals.allocated == 0);
  assert!(stats.totals.fragments == stats.arenas);
}

#[test]
fn wrapper_has_the_same_shape() {
  fn churn(alloc: &mut impl RawAlloc) {
    let ptr = alloc.alloc(100).unwrap();
    assert!(alloc.is_in_pool(ptr.as_ptr()));
    alloc.free(ptr.as_ptr());
  }
  let mut arena = Arena::new(0, &tiny()).unwrap();
  churn(&mut arena);
  let mut pool = SyncPool::wrap(ArenaPool::new(0, tiny()).unwrap());
  churn(&mut pool);
  assert!(pool.lock().stats().totals.allocated == 0);
  assert!(pool.into_inner().arena_count() == 1);
}
