use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::{
  collections::VecDeque,
  ops::Deref,
  sync::Arc,
  thread::{self, JoinHandle},
};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::{
  arena_pool::SyncPool,
  coroutine::{Coroutine, Job, Scheduler, Status, TaskContext, DEFAULT_STACK_SIZE, MIN_STACK_SIZE},
  error::{Error, SpawnError},
  sys::{self, pin_current_to_cpu},
  utils::cpu_assignments,
};

pub type ThreadInit = Arc<dyn Fn(usize) + Send + Sync>;

pub const DEFAULT_MAX_IDLE: usize = 1024;

#[derive(Clone)]
pub struct TaskPoolConfig {
  pub threads: usize,
  pub affinity: u64,
  pub stack_size: usize,
  /// Idle coroutines kept for reuse, the surplus is retired.
  pub max_idle_coroutines: usize,
  pub pin_threads: bool,
  pub name: String,
  /// Called on every worker once it is pinned, before it takes any task.
  pub init: Option<ThreadInit>,
  /// Handed to tasks through `TaskContext::allocator`.
  pub allocator: Option<Arc<SyncPool>>,
}

impl Default for TaskPoolConfig {
  fn default() -> Self {
    Self {
      threads: 4,
      affinity: 0xf,
      stack_size: DEFAULT_STACK_SIZE,
      max_idle_coroutines: DEFAULT_MAX_IDLE,
      pin_threads: true,
      name: "numa-exec".to_string(),
      init: None,
      allocator: None,
    }
  }
}

impl TaskPoolConfig {
  pub fn threads(mut self, threads: usize) -> Self {
    self.threads = threads;
    self
  }
  pub fn affinity(mut self, mask: u64) -> Self {
    self.affinity = mask;
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
  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }
  pub fn init(mut self, init: impl Fn(usize) + Send + Sync + 'static) -> Self {
    self.init = Some(Arc::new(init));
    self
  }
  pub fn allocator(mut self, allocator: Arc<SyncPool>) -> Self {
    self.allocator = Some(allocator);
    self
  }
  pub fn validate(&self) -> Result<(), Error> {
    if self.threads == 0 {
      return Err(Error::Config("a task pool needs at least one thread".to_string()));
    }
    if self.affinity == 0 {
      return Err(Error::Config("affinity mask selects no cpu".to_string()));
    }
    if self.stack_size < MIN_STACK_SIZE {
      return Err(Error::Config(format!(
        "coroutine stacks must be at least {MIN_STACK_SIZE} bytes, got {}", self.stack_size)));
    }
    return Ok(());
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
  /// Fresh stacks built.
  pub created: u64,
  /// Jobs that ran on a recycled stack.
  pub reused: u64,
  /// Stacks released, either dead or surplus.
  pub retired: u64,
  pub idle: usize,
}

struct WorkerQueue {
  tasks: Mutex<VecDeque<Box<Coroutine>>>,
  wake: sys::Semaphore,
}

pub(crate) struct PoolShared {
  queues: Box<[WorkerQueue]>,
  idle: Mutex<VecDeque<Box<Coroutine>>>,
  next_queue: AtomicUsize,
  exit: AtomicBool,
  stack_size: usize,
  max_idle: usize,
  allocator: Option<Arc<SyncPool>>,
  created: AtomicU64,
  reused: AtomicU64,
  retired: AtomicU64,
}

impl PoolShared {
  fn new(config: &TaskPoolConfig) -> Arc<Self> {
    let queues = (0 .. config.threads)
      .map(|_| WorkerQueue { tasks: Mutex::new(VecDeque::new()), wake: sys::Semaphore::new(0) })
      .collect();
    Arc::new(Self {
      queues,
      idle: Mutex::new(VecDeque::new()),
      next_queue: AtomicUsize::new(0),
      exit: AtomicBool::new(false),
      stack_size: config.stack_size,
      max_idle: config.max_idle_coroutines,
      allocator: config.allocator.clone(),
      created: AtomicU64::new(0),
      reused: AtomicU64::new(0),
      retired: AtomicU64::new(0),
    })
  }
  pub(crate) fn allocator(&self) -> Option<&Arc<SyncPool>> {
    self.allocator.as_ref()
  }
  fn coroutine_for(self: &Arc<Self>, job: Job) -> Result<Box<Coroutine>, SpawnError> {
    let recycled = self.idle.lock().pop_front();
    if let Some(mut co) = recycled {
      co.reset_boxed(job);
      self.reused.fetch_add(1, Ordering::Relaxed);
      return Ok(co);
    }
    let co = Coroutine::attached(job, Arc::downgrade(self), self.stack_size)?;
    self.created.fetch_add(1, Ordering::Relaxed);
    return Ok(co);
  }
  fn submit(self: &Arc<Self>, job: Job, target: Option<usize>, front: bool) -> Result<(), SpawnError> {
    if self.exit.load(Ordering::Acquire) { return Err(SpawnError::ShutDown) }
    let co = self.coroutine_for(job)?;
    self.enqueue(co, target, front);
    return Ok(());
  }
  fn enqueue(&self, co: Box<Coroutine>, target: Option<usize>, front: bool) {
    let index = match target {
      Some(index) => index % self.queues.len(),
      None => self.next_queue.fetch_add(1, Ordering::Relaxed) % self.queues.len(),
    };
    let queue = &self.queues[index];
    let was_empty = {
      let mut tasks = queue.tasks.lock();
      let was_empty = tasks.is_empty();
      if front { tasks.push_front(co) } else { tasks.push_back(co) }
      was_empty
    };
    // a worker only sleeps on an empty queue
    if was_empty { queue.wake.up(1) }
  }
  /// Puts a woken coroutine back to work ahead of fresh tasks.
  pub(crate) fn readmit(&self, co: Box<Coroutine>) {
    self.enqueue(co, None, true)
  }
  fn next_task(&self, index: usize) -> Option<Box<Coroutine>> {
    if let Some(co) = self.queues[index].tasks.lock().pop_front() { return Some(co) }
    for (other, queue) in self.queues.iter().enumerate() {
      if other == index { continue }
      if let Some(co) = queue.tasks.lock().pop_front() {
        trace!(worker = index, from = other, "stole a task");
        return Some(co);
      }
    }
    return None;
  }
  fn recycle(&self, co: Box<Coroutine>) {
    let mut idle = self.idle.lock();
    if idle.len() < self.max_idle {
      idle.push_back(co);
      return;
    }
    drop(idle);
    self.retired.fetch_add(1, Ordering::Relaxed);
    co.retire();
  }
  fn hand_to_parker(&self, co: Box<Coroutine>) {
    match co.take_parker() {
      Some(parker) => {
        // the wake may already have happened
        if let Some(co) = parker.deposit(co) { self.readmit(co) }
      },
      None => {
        warn!(coroutine = co.id(), "coroutine is waiting on nothing, requeueing it");
        self.enqueue(co, None, false);
      },
    }
  }
  fn stats(&self) -> TaskStats {
    TaskStats {
      created: self.created.load(Ordering::Relaxed),
      reused: self.reused.load(Ordering::Relaxed),
      retired: self.retired.load(Ordering::Relaxed),
      idle: self.idle.lock().len(),
    }
  }
  fn shut_down(&self) {
    self.exit.store(true, Ordering::Release);
    let threads = self.queues.len() as u32;
    for queue in self.queues.iter() {
      queue.wake.up(threads);
    }
  }
  fn release_coroutines(&self) {
    let idle: Vec<_> = self.idle.lock().drain(..).collect();
    for co in idle {
      co.retire();
    }
    let mut abandoned = 0;
    for queue in self.queues.iter() {
      let tasks: Vec<_> = queue.tasks.lock().drain(..).collect();
      abandoned += tasks.len();
      drop(tasks);
    }
    if abandoned != 0 {
      debug!(abandoned, "dropped queued tasks at shutdown");
    }
  }
}

fn work(shared: Arc<PoolShared>, index: usize) {
  let mut scheduler = Scheduler::new(index);
  debug!(worker = index, "worker started");
  while !shared.exit.load(Ordering::Acquire) {
    let Some(mut task) = shared.next_task(index) else {
      shared.queues[index].wake.down();
      continue;
    };
    match scheduler.resume(&mut task) {
      Status::Dead => {
        shared.retired.fetch_add(1, Ordering::Relaxed);
        drop(task);
      },
      Status::Waiting => shared.hand_to_parker(task),
      Status::Ready => shared.recycle(task),
      Status::Running | Status::Suspend => shared.queues[index].tasks.lock().push_back(task),
    }
  }
  debug!(worker = index, switches = scheduler.switches(), "worker stopped");
}

/// Cheap handle for submitting work from anywhere, tasks included.
#[derive(Clone)]
pub struct PoolHandle {
  shared: Arc<PoolShared>,
}

impl PoolHandle {
  pub(crate) fn from_shared(shared: Arc<PoolShared>) -> Self {
    Self { shared }
  }
  /// Queues `f` at the back of the `target` worker's queue, round robin when
  /// no target is given. Targets wrap around the thread count.
  pub fn add_task<F>(&self, f: F, target: Option<usize>) -> Result<(), SpawnError>
  where F: FnOnce(&TaskContext<'_>) + Send + 'static {
    self.shared.submit(Box::new(f), target, false)
  }
  /// Like `add_task` but jumps the queue.
  pub fn add_immediately_task<F>(&self, f: F, target: Option<usize>) -> Result<(), SpawnError>
  where F: FnOnce(&TaskContext<'_>) + Send + 'static {
    self.shared.submit(Box::new(f), target, true)
  }
  pub fn threads(&self) -> usize {
    self.shared.queues.len()
  }
  pub fn stats(&self) -> TaskStats {
    self.shared.stats()
  }
  pub fn allocator(&self) -> Option<&Arc<SyncPool>> {
    self.shared.allocator()
  }
  pub fn is_shut_down(&self) -> bool {
    self.shared.exit.load(Ordering::Acquire)
  }
}

/// A fixed set of worker threads, each with its own queue of coroutines,
/// stealing from each other when their own queue runs dry.
pub struct TaskPool {
  handle: PoolHandle,
  threads: Vec<JoinHandle<()>>,
}

impl TaskPool {
  pub fn new(config: TaskPoolConfig) -> Result<Self, Error> {
    config.validate()?;
    let Some(cpus) = cpu_assignments(config.affinity, config.threads) else {
      return Err(Error::Config("affinity mask selects no cpu".to_string()));
    };
    let shared = PoolShared::new(&config);
    let mut pool = TaskPool {
      handle: PoolHandle::from_shared(shared.clone()),
      threads: Vec::with_capacity(config.threads),
    };
    for (index, cpu) in cpus.into_iter().enumerate() {
      let shared = shared.clone();
      let init = config.init.clone();
      let pin = config.pin_threads;
      let name = format!("{}-{}", config.name, index);
      let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
        if pin && !pin_current_to_cpu(cpu) {
          warn!(worker = index, cpu, "could not pin worker thread");
        }
        if let Some(init) = init { init(index) }
        work(shared, index)
      });
      match spawned {
        Ok(thread) => pool.threads.push(thread),
        // dropping the pool stops what was started
        Err(source) => return Err(Error::Thread { name, source }),
      }
    }
    debug!(name = %config.name, threads = config.threads, affinity = config.affinity, "task pool started");
    return Ok(pool);
  }
  pub fn handle(&self) -> PoolHandle {
    self.handle.clone()
  }
  /// Stops the workers and waits for them. Tasks still queued are dropped,
  /// a task that is mid-slice finishes that slice first.
  pub fn join(&mut self) {
    if self.threads.is_empty() { return }
    self.handle.shared.shut_down();
    for thread in self.threads.drain(..) {
      if thread.join().is_err() {
        error!("worker thread panicked");
      }
    }
    self.handle.shared.release_coroutines();
  }
}

impl Deref for TaskPool {
  type Target = PoolHandle;
  fn deref(&self) -> &PoolHandle {
    &self.handle
  }
}

impl Drop for TaskPool {
  fn drop(&mut self) {
    self.join()
  }
}

#[cfg(test)]
fn test_config(threads: usize) -> TaskPoolConfig {
  TaskPoolConfig::default()
    .threads(threads)
    .affinity(1)
    .stack_size(64 * 1024)
    .pin_threads(false)
    .name("test-pool")
}

#[test]
fn runs_every_task() {
  let pool = TaskPool::new(test_config(4)).unwrap();
  let done = Arc::new(sys::Semaphore::new(0));
  let counter = Arc::new(AtomicUsize::new(0));
  for _ in 0 .. 100 {
    let done = done.clone();
    let counter = counter.clone();
    pool.add_task(move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
      done.up(1);
    }, None).unwrap();
  }
  for _ in 0 .. 100 {
    done.down();
  }
  assert!(counter.load(Ordering::SeqCst) == 100);
  let stats = pool.stats();
  assert!(stats.created + stats.reused == 100);
}

#[test]
fn placement_and_queue_order() {
  let shared = PoolShared::new(&test_config(2));
  shared.submit(Box::new(|_| ()), None, false).unwrap();
  shared.submit(Box::new(|_| ()), None, false).unwrap();
  shared.submit(Box::new(|_| ()), None, false).unwrap();
  assert!(shared.queues[0].tasks.lock().len() == 2);
  assert!(shared.queues[1].tasks.lock().len() == 1);
  // only the push into an empty queue posts a wakeup
  assert!(shared.queues[0].wake.available() == 1);
  // targets wrap around the thread count
  shared.submit(Box::new(|_| ()), Some(4), true).unwrap();
  let queue = shared.queues[0].tasks.lock();
  assert!(queue.len() == 3);
  assert!(queue.iter().map(|co| co.id()).max() == Some(queue[0].id()));
}

#[test]
fn finished_coroutines_are_reused() {
  let shared = PoolShared::new(&test_config(1));
  let mut scheduler = Scheduler::new(0);
  shared.submit(Box::new(|_| ()), None, false).unwrap();
  let mut co = shared.next_task(0).unwrap();
  let id = co.id();
  assert!(scheduler.resume(&mut co) == Status::Ready);
  shared.recycle(co);
  shared.submit(Box::new(|_| ()), None, false).unwrap();
  let co = shared.next_task(0).unwrap();
  assert!(co.id() == id && co.reuse_count() == 1);
  let stats = shared.stats();
  assert!(stats.created == 1 && stats.reused == 1 && stats.idle == 0);
}

#[test]
fn idle_surplus_is_retired() {
  let shared = PoolShared::new(&test_config(1).max_idle_coroutines(1));
  let mut scheduler = Scheduler::new(0);
  let mut finished = Vec::new();
  for _ in 0 .. 3 {
    shared.submit(Box::new(|_| ()), None, false).unwrap();
  }
  while let Some(mut co) = shared.next_task(0) {
    assert!(scheduler.resume(&mut co) == Status::Ready);
    finished.push(co);
  }
  for co in finished {
    shared.recycle(co);
  }
  let stats = shared.stats();
  assert!(stats.idle == 1 && stats.retired == 2);
  shared.release_coroutines();
}

#[test]
fn yield_goes_behind_queued_work() {
  let pool = TaskPool::new(test_config(1)).unwrap();
  let gate = Arc::new(sys::Semaphore::new(0));
  let done = Arc::new(sys::Semaphore::new(0));
  let log = Arc::new(Mutex::new(Vec::new()));
  // holds the only worker until both tasks are queued
  let held = gate.clone();
  pool.add_task(move |_| held.down(), None).unwrap();
  let (first, finished) = (log.clone(), done.clone());
  pool.add_task(move |cx| {
    first.lock().push("a1");
    cx.yield_now();
    first.lock().push("a2");
    finished.up(1);
  }, None).unwrap();
  let (second, finished) = (log.clone(), done.clone());
  pool.add_task(move |_| {
    second.lock().push("b1");
    finished.up(1);
  }, None).unwrap();
  gate.up(1);
  done.down();
  done.down();
  assert!(*log.lock() == vec!["a1", "b1", "a2"]);
}

#[test]
fn panicking_task_leaves_worker_alive() {
  let pool = TaskPool::new(test_config(1)).unwrap();
  let done = Arc::new(sys::Semaphore::new(0));
  pool.add_task(|_| panic!("task failure"), None).unwrap();
  let finished = done.clone();
  pool.add_task(move |_| finished.up(1), None).unwrap();
  done.down();
  assert!(pool.stats().retired >= 1);
}

#[test]
fn init_runs_on_every_worker() {
  let seen = Arc::new(Mutex::new(Vec::new()));
  let record = seen.clone();
  let mut pool = TaskPool::new(test_config(3).init(move |worker| record.lock().push(worker))).unwrap();
  pool.join();
  let mut seen = seen.lock().clone();
  seen.sort();
  assert!(seen == vec![0, 1, 2]);
}

#[test]
fn no_tasks_after_join() {
  let mut pool = TaskPool::new(test_config(2)).unwrap();
  let handle = pool.handle();
  pool.join();
  pool.join();
  assert!(handle.is_shut_down());
  assert!(matches!(handle.add_task(|_| (), None), Err(SpawnError::ShutDown)));
}

#[test]
fn bad_configs_are_rejected() {
  assert!(matches!(TaskPool::new(test_config(0)), Err(Error::Config(_))));
  assert!(matches!(TaskPool::new(test_config(1).affinity(0)), Err(Error::Config(_))));
  assert!(matches!(TaskPool::new(test_config(1).stack_size(1024)), Err(Error::Config(_))));
}
