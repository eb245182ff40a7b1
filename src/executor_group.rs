use std::{
  sync::Arc,
  thread::{self, JoinHandle},
};

use tracing::{debug, error, info, warn};

use crate::{
  arena::ArenaConfig,
  arena_pool::SyncPool,
  coroutine::DEFAULT_STACK_SIZE,
  error::Error,
  sys::pin_current_to_mask,
  task_pool::{PoolHandle, TaskPool, TaskPoolConfig, DEFAULT_MAX_IDLE},
  utils::mask_population,
};

#[derive(Debug, Clone)]
pub struct GroupConfig {
  pub numa_node: usize,
  /// One worker per set bit.
  pub affinity: u64,
  pub arena: ArenaConfig,
  pub stack_size: usize,
  pub max_idle_coroutines: usize,
  pub pin_threads: bool,
}

impl GroupConfig {
  pub fn new(numa_node: usize, affinity: u64) -> Self {
    Self {
      numa_node,
      affinity,
      arena: ArenaConfig::default(),
      stack_size: DEFAULT_STACK_SIZE,
      max_idle_coroutines: DEFAULT_MAX_IDLE,
      pin_threads: true,
    }
  }
  pub fn arena(mut self, arena: ArenaConfig) -> Self {
    self.arena = arena;
    self
  }
  pub fn stack_size(mut self, bytes: usize) -> Self {
    self.stack_size = bytes;
    self
  }
  pub fn max_idle_coroutines(mut self, count: usize) -> Self {
    self.max_idle_coroutines = count;
    self
  }
  pub fn pin_threads(mut self, pin: bool) -> Self {
    self.pin_threads = pin;
    self
  }
}

/// What the launcher's entry point gets to work with.
#[derive(Clone)]
pub struct GroupHandle {
  pool: PoolHandle,
  allocator: Arc<SyncPool>,
  numa_node: usize,
}

impl GroupHandle {
  pub fn pool(&self) -> &PoolHandle {
    &self.pool
  }
  pub fn allocator(&self) -> &Arc<SyncPool> {
    &self.allocator
  }
  pub fn numa_node(&self) -> usize {
    self.numa_node
  }
}

/// Everything one NUMA node needs: a pinned task pool, an allocator that
/// reserves node-local memory and a launcher thread to start the work from.
pub struct ExecutorGroup {
  numa_node: usize,
  affinity: u64,
  pin_threads: bool,
  launcher: Option<JoinHandle<()>>,
  // workers stop before the memory they may still touch goes away
  pool: TaskPool,
  allocator: Arc<SyncPool>,
}

impl ExecutorGroup {
  pub fn new(numa_node: usize, affinity: u64) -> Result<Self, Error> {
    Self::with_config(GroupConfig::new(numa_node, affinity))
  }
  pub fn with_config(config: GroupConfig) -> Result<Self, Error> {
    let threads = mask_population(config.affinity);
    if threads == 0 {
      return Err(Error::Config("affinity mask selects no cpu".to_string()));
    }
    let node = config.numa_node;
    let allocator = Arc::new(SyncPool::new(node, config.arena.clone())?);
    let pool = TaskPool::new(
      TaskPoolConfig::default()
        .threads(threads)
        .affinity(config.affinity)
        .stack_size(config.stack_size)
        .max_idle_coroutines(config.max_idle_coroutines)
        .pin_threads(config.pin_threads)
        .name(format!("numa{node}"))
        .allocator(allocator.clone())
        .init(move |worker| debug!(node, worker, "worker joined executor group"))
    )?;
    info!(node, threads, affinity = config.affinity, "executor group ready");
    return Ok(Self {
      numa_node: node,
      affinity: config.affinity,
      pin_threads: config.pin_threads,
      launcher: None,
      pool,
      allocator,
    });
  }
  /// Starts `entry` on a fresh launcher thread bound to the group's cpus.
  /// A launcher from an earlier `run` is waited for first.
  pub fn run<F>(&mut self, entry: F) -> Result<(), Error>
  where F: FnOnce(GroupHandle) + Send + 'static {
    self.stop();
    let handle = self.handle();
    let (mask, pin, node) = (self.affinity, self.pin_threads, self.numa_node);
    let name = format!("numa{node}-launcher");
    let launcher = thread::Builder::new().name(name.clone()).spawn(move || {
      if pin {
        if let Err(err) = pin_current_to_mask(mask) {
          warn!(node, mask, error = %err, "could not pin launcher thread");
        }
      }
      entry(handle)
    });
    match launcher {
      Ok(launcher) => self.launcher = Some(launcher),
      Err(source) => return Err(Error::Thread { name, source }),
    }
    return Ok(());
  }
  /// Waits for the launcher. The workers keep going until the group drops.
  pub fn stop(&mut self) {
    let Some(launcher) = self.launcher.take() else { return };
    if launcher.join().is_err() {
      error!(node = self.numa_node, "launcher thread panicked");
    }
  }
  pub fn handle(&self) -> GroupHandle {
    GroupHandle {
      pool: self.pool.handle(),
      allocator: self.allocator.clone(),
      numa_node: self.numa_node,
    }
  }
  pub fn task_pool(&self) -> &TaskPool {
    &self.pool
  }
  pub fn allocator(&self) -> &Arc<SyncPool> {
    &self.allocator
  }
  pub fn numa_node(&self) -> usize {
    self.numa_node
  }
  pub fn thread_count(&self) -> usize {
    self.pool.threads()
  }
}

impl Drop for ExecutorGroup {
  fn drop(&mut self) {
    self.stop();
  }
}

#[cfg(test)]
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering::SeqCst};
#[cfg(test)]
use crate::{sync::Semaphore, sys};

#[cfg(test)]
fn test_group(affinity: u64) -> ExecutorGroup {
  let config = GroupConfig::new(0, affinity)
    .arena(ArenaConfig::default().size(4 << 20))
    .stack_size(64 * 1024)
    .pin_threads(false);
  ExecutorGroup::with_config(config).unwrap()
}

#[test]
fn hundred_tasks_behind_one_lock() {
  let mut group = test_group(0xf);
  assert!(group.thread_count() == 4);
  let result = Arc::new(AtomicU64::new(0));
  let out = result.clone();
  group.run(move |group| {
    let lock = Arc::new(Semaphore::new(1));
    let finished = Arc::new(sys::Semaphore::new(0));
    // the shared counter lives in node-local memory
    let cell = group.allocator().alloc(8).unwrap().as_ptr() as usize;
    unsafe { (cell as *mut u64).write(0) };
    for _ in 0 .. 100 {
      let (lock, finished) = (lock.clone(), finished.clone());
      group.pool().add_task(move |cx| {
        lock.down(cx, 1);
        let seen = unsafe { (cell as *const u64).read_volatile() };
        cx.yield_now();
        unsafe { (cell as *mut u64).write_volatile(seen + 1) };
        lock.up();
        finished.up(1);
      }, None).unwrap();
    }
    for _ in 0 .. 100 {
      finished.down();
    }
    out.store(unsafe { (cell as *const u64).read_volatile() }, SeqCst);
    group.allocator().free(cell as *mut u8);
  }).unwrap();
  group.stop();
  assert!(result.load(SeqCst) == 100);
  assert!(group.allocator().stats().totals.allocated == 0);
}

#[test]
fn parent_waits_for_its_children() {
  let mut group = test_group(0b11);
  let seen = Arc::new(AtomicUsize::new(0));
  let out = seen.clone();
  group.run(move |group| {
    let done = Arc::new(sys::Semaphore::new(0));
    let parent_done = done.clone();
    group.pool().add_task(move |cx| {
      let children = Arc::new(Semaphore::new(0));
      let finished = Arc::new(AtomicUsize::new(0));
      for _ in 0 .. 100 {
        let (children, finished) = (children.clone(), finished.clone());
        cx.spawn(move |_| {
          finished.fetch_add(1, SeqCst);
          children.up();
        }).unwrap();
      }
      children.down(cx, 100);
      out.store(finished.load(SeqCst), SeqCst);
      parent_done.up(1);
    }, None).unwrap();
    done.down();
  }).unwrap();
  group.stop();
  assert!(seen.load(SeqCst) == 100);
}

#[test]
fn tasks_see_the_group_allocator() {
  let mut group = test_group(0b1);
  let expected = Arc::as_ptr(group.allocator()) as usize;
  let matched = Arc::new(AtomicUsize::new(0));
  let out = matched.clone();
  group.run(move |group| {
    let done = Arc::new(sys::Semaphore::new(0));
    let finished = done.clone();
    group.pool().add_task(move |cx| {
      if let Some(alloc) = cx.allocator() {
        let ptr = alloc.alloc(256).unwrap();
        if Arc::as_ptr(&alloc) as usize == expected && alloc.is_in_pool(ptr.as_ptr()) {
          out.store(1, SeqCst);
        }
        alloc.free(ptr.as_ptr());
      }
      finished.up(1);
    }, None).unwrap();
    done.down();
  }).unwrap();
  group.stop();
  assert!(matched.load(SeqCst) == 1);
}

#[test]
fn run_can_be_repeated() {
  let mut group = test_group(0b11);
  let runs = Arc::new(AtomicUsize::new(0));
  for _ in 0 .. 3 {
    let runs = runs.clone();
    group.run(move |group| {
      assert!(group.numa_node() == 0);
      runs.fetch_add(1, SeqCst);
    }).unwrap();
  }
  group.stop();
  group.stop();
  assert!(runs.load(SeqCst) == 3);
}

#[test]
fn pinned_group_starts() {
  let config = GroupConfig::new(0, 0b1)
    .arena(ArenaConfig::default().size(1 << 20))
    .stack_size(64 * 1024);
  let mut group = ExecutorGroup::with_config(config).unwrap();
  let ran = Arc::new(AtomicUsize::new(0));
  let out = ran.clone();
  group.run(move |_| { out.store(1, SeqCst); }).unwrap();
  group.stop();
  assert!(ran.load(SeqCst) == 1);
}

#[test]
fn empty_mask_is_rejected() {
  assert!(matches!(ExecutorGroup::new(0, 0), Err(Error::Config(_))));
  let bad_arena = GroupConfig::new(0, 1).arena(ArenaConfig::default().alignment(24));
  assert!(matches!(ExecutorGroup::with_config(bad_arena), Err(Error::Config(_))));
}
