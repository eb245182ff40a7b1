use core::mem::size_of;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::{
  any::Any,
  cell::RefCell,
  panic::{self, AssertUnwindSafe},
  sync::{Arc, Weak},
};

use generator::{Generator, Gn};
use parking_lot::Mutex;
use tracing::{error, trace};

use crate::{
  arena_pool::SyncPool,
  error::SpawnError,
  sync::Parker,
  task_pool::{PoolHandle, PoolShared},
};

pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;
pub const MIN_STACK_SIZE: usize = 16 * 1024;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
  /// The driving loop has exited, the stack can go.
  Dead = 0,
  /// Between jobs, ready for `reset`.
  Ready = 1,
  Running = 2,
  /// Parked on a sync primitive.
  Waiting = 3,
  /// Gave up its slice but still has work.
  Suspend = 4,
}

impl Status {
  fn from_raw(raw: u8) -> Self {
    match raw {
      0 => Status::Dead,
      1 => Status::Ready,
      2 => Status::Running,
      3 => Status::Waiting,
      _ => Status::Suspend,
    }
  }
}

pub type Job = Box<dyn FnOnce(&TaskContext<'_>) + Send + 'static>;

static NEXT_COROUTINE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct CoroutineCore {
  id: u64,
  status: AtomicU8,
  exit: AtomicBool,
  reuse_count: AtomicU32,
  worker: AtomicUsize,
  job: Mutex<Option<Job>>,
  parker: Mutex<Option<Arc<Parker>>>,
  pool: Weak<PoolShared>,
}

impl CoroutineCore {
  #[inline(always)]
  fn status(&self) -> Status {
    Status::from_raw(self.status.load(Ordering::Acquire))
  }
  #[inline(always)]
  fn set_status(&self, status: Status) {
    self.status.store(status as u8, Ordering::Release)
  }
  // a status picked by the coroutine itself survives the switch
  fn settle_for_yield(&self) {
    match self.status() {
      Status::Dead | Status::Waiting | Status::Ready => (),
      _ => self.set_status(Status::Suspend),
    }
  }
}

/// A stackful execution context that runs one job at a time.
///
/// The stack belongs to a `generator` and survives across jobs: once a job
/// returns the coroutine reports [`Status::Ready`] and can be handed a new
/// job with `reset` instead of building a fresh stack.
pub struct Coroutine {
  core: Arc<CoroutineCore>,
  context: Generator<'static, (), ()>,
}

impl Coroutine {
  /// A coroutine that is not attached to any task pool.
  pub fn new<F>(job: F, stack_size: usize) -> Result<Box<Self>, SpawnError>
  where F: FnOnce(&TaskContext<'_>) + Send + 'static {
    Self::attached(Box::new(job), Weak::new(), stack_size)
  }
  pub(crate) fn attached(
    job: Job,
    pool: Weak<PoolShared>,
    stack_size: usize
  ) -> Result<Box<Self>, SpawnError> {
    let core = Arc::new(CoroutineCore {
      id: NEXT_COROUTINE_ID.fetch_add(1, Ordering::Relaxed),
      status: AtomicU8::new(Status::Ready as u8),
      exit: AtomicBool::new(false),
      reuse_count: AtomicU32::new(0),
      worker: AtomicUsize::new(usize::MAX),
      job: Mutex::new(Some(job)),
      parker: Mutex::new(None),
      pool,
    });
    let body_core = core.clone();
    // generator stacks are sized in words
    let words = stack_size.max(MIN_STACK_SIZE) / size_of::<usize>();
    let built = panic::catch_unwind(AssertUnwindSafe(move || {
      let context: Generator<'static, (), ()> = Gn::<()>::new_scoped_opt(words, move |mut s| {
        let core = body_core;
        loop {
          if core.exit.load(Ordering::Acquire) { break }
          let Some(job) = core.job.lock().take() else { break };
          {
            let mut suspend = || {
              core.settle_for_yield();
              let _ = s.yield_(());
            };
            run_job(&core, job, &mut suspend);
          }
          if core.exit.load(Ordering::Acquire) { break }
          core.set_status(Status::Ready);
          let _ = s.yield_(());
        }
        core.set_status(Status::Dead);
      });
      context
    }));
    match built {
      Ok(context) => return Ok(Box::new(Coroutine { core, context })),
      Err(_) => return Err(SpawnError::Stack { stack_size }),
    }
  }
  pub fn id(&self) -> u64 {
    self.core.id
  }
  pub fn status(&self) -> Status {
    self.core.status()
  }
  /// How many times the stack was handed a new job.
  pub fn reuse_count(&self) -> u32 {
    self.core.reuse_count.load(Ordering::Relaxed)
  }
  pub fn is_done(&self) -> bool {
    self.context.is_done()
  }
  /// Installs the next job on an idle coroutine. The stack is kept.
  pub fn reset<F>(&mut self, job: F)
  where F: FnOnce(&TaskContext<'_>) + Send + 'static {
    self.reset_boxed(Box::new(job))
  }
  pub(crate) fn reset_boxed(&mut self, job: Job) {
    debug_assert!(self.status() == Status::Ready, "reset of a busy coroutine");
    *self.core.job.lock() = Some(job);
    self.core.set_status(Status::Ready);
    self.core.reuse_count.fetch_add(1, Ordering::Relaxed);
  }
  pub(crate) fn take_parker(&self) -> Option<Arc<Parker>> {
    self.core.parker.lock().take()
  }
  /// Lets the driving loop of an idle coroutine run out so the stack can be
  /// released.
  pub fn retire(mut self: Box<Self>) {
    self.core.exit.store(true, Ordering::Release);
    if !self.context.is_done() {
      debug_assert!(self.status() == Status::Ready, "retiring a coroutine in the middle of a job");
      let _ = self.context.resume();
    }
    trace!(coroutine = self.core.id, reused = self.reuse_count(), "coroutine retired");
  }
}

fn run_job(core: &Arc<CoroutineCore>, job: Job, suspend: &mut dyn FnMut()) {
  let cx = TaskContext { core, suspend: RefCell::new(suspend) };
  let outcome = panic::catch_unwind(AssertUnwindSafe(|| job(&cx)));
  if let Err(payload) = outcome {
    // cancellation of a dropped generator has to keep unwinding
    if payload.is::<generator::Error>() {
      panic::resume_unwind(payload);
    }
    error!(coroutine = core.id, panic = panic_message(&payload), "task panicked, retiring its coroutine");
    core.exit.store(true, Ordering::Release);
  }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> &str {
  if let Some(msg) = payload.downcast_ref::<&'static str>() { return *msg }
  if let Some(msg) = payload.downcast_ref::<String>() { return msg.as_str() }
  return "<non-string panic>";
}

/// Per-thread switcher between the worker's own stack and one coroutine.
pub struct Scheduler {
  worker: usize,
  running: Option<u64>,
  switches: u64,
}

impl Scheduler {
  pub fn new(worker: usize) -> Self {
    Self { worker, running: None, switches: 0 }
  }
  pub fn worker(&self) -> usize {
    self.worker
  }
  /// Id of the coroutine currently switched into, if any.
  pub fn running(&self) -> Option<u64> {
    self.running
  }
  pub fn switches(&self) -> u64 {
    self.switches
  }
  /// Switches into `co` until it yields or finishes and reports what it
  /// left behind.
  pub fn resume(&mut self, co: &mut Coroutine) -> Status {
    if co.context.is_done() {
      co.core.set_status(Status::Dead);
      return Status::Dead;
    }
    co.core.set_status(Status::Running);
    co.core.worker.store(self.worker, Ordering::Relaxed);
    self.running = Some(co.core.id);
    let _ = co.context.resume();
    self.running = None;
    self.switches += 1;
    if co.context.is_done() {
      co.core.set_status(Status::Dead);
    }
    return co.status();
  }
}

/// Handed to every job. Everything a task may ask of its surroundings goes
/// through here: which worker runs it, the pool it belongs to, the NUMA-local
/// allocator and the ability to give up the cpu.
pub struct TaskContext<'a> {
  core: &'a Arc<CoroutineCore>,
  suspend: RefCell<&'a mut dyn FnMut()>,
}

impl<'a> TaskContext<'a> {
  pub fn coroutine_id(&self) -> u64 {
    self.core.id
  }
  /// Worker thread the task is currently running on. Can change after any
  /// suspension point.
  pub fn worker_index(&self) -> usize {
    self.core.worker.load(Ordering::Relaxed)
  }
  /// Cooperatively gives up the worker, the task is queued again behind
  /// whatever is already waiting there.
  pub fn yield_now(&self) {
    let mut suspend = self.suspend.borrow_mut();
    (&mut **suspend)();
  }
  pub fn pool(&self) -> Option<PoolHandle> {
    self.core.pool.upgrade().map(PoolHandle::from_shared)
  }
  pub fn spawn<F>(&self, job: F) -> Result<(), SpawnError>
  where F: FnOnce(&TaskContext<'_>) + Send + 'static {
    self.pool().ok_or(SpawnError::Detached)?.add_task(job, None)
  }
  /// Allocator of the executor group that owns the pool, if any.
  pub fn allocator(&self) -> Option<Arc<SyncPool>> {
    self.core.pool.upgrade().and_then(|pool| pool.allocator().cloned())
  }
  pub(crate) fn new_parker(&self) -> Arc<Parker> {
    Parker::new(self.core.pool.clone())
  }
  // the parker owns the coroutine from the moment the worker sees Waiting
  pub(crate) fn park(&self, parker: Arc<Parker>) {
    *self.core.parker.lock() = Some(parker);
    self.core.set_status(Status::Waiting);
    self.yield_now();
  }
}

#[cfg(test)]
const TEST_STACK: usize = 64 * 1024;

#[test]
fn job_runs_to_ready_and_is_reused() {
  let log = Arc::new(Mutex::new(Vec::new()));
  let first = log.clone();
  let mut co = Coroutine::new(move |_| first.lock().push("first"), TEST_STACK).unwrap();
  let mut scheduler = Scheduler::new(0);
  assert!(co.status() == Status::Ready);
  assert!(scheduler.resume(&mut co) == Status::Ready);
  assert!(scheduler.running().is_none());
  let second = log.clone();
  co.reset(move |cx| second.lock().push(if cx.worker_index() == 0 { "second" } else { "wrong" }));
  assert!(scheduler.resume(&mut co) == Status::Ready);
  assert!(*log.lock() == vec!["first", "second"]);
  assert!(co.reuse_count() == 1);
  assert!(scheduler.switches() == 2);
  co.retire();
}

#[test]
fn yield_suspends_and_resumes_in_place() {
  let log = Arc::new(Mutex::new(Vec::new()));
  let inner = log.clone();
  let mut co = Coroutine::new(move |cx| {
    for step in 0 .. 3 {
      inner.lock().push(step);
      cx.yield_now();
    }
  }, TEST_STACK).unwrap();
  let mut scheduler = Scheduler::new(3);
  for step in 0 .. 3 {
    assert!(scheduler.resume(&mut co) == Status::Suspend);
    assert!(log.lock().len() == step + 1);
  }
  assert!(scheduler.resume(&mut co) == Status::Ready);
  assert!(*log.lock() == vec![0, 1, 2]);
}

#[test]
fn retired_coroutine_is_dead() {
  let mut co = Coroutine::new(|_| (), TEST_STACK).unwrap();
  let mut scheduler = Scheduler::new(0);
  assert!(scheduler.resume(&mut co) == Status::Ready);
  co.core.exit.store(true, Ordering::Release);
  assert!(scheduler.resume(&mut co) == Status::Dead);
  assert!(co.is_done());
  // resuming a finished context is a no-op
  assert!(scheduler.resume(&mut co) == Status::Dead);
}

#[test]
fn panicking_job_kills_only_its_coroutine() {
  let mut co = Coroutine::new(|_| panic!("boom"), TEST_STACK).unwrap();
  let mut scheduler = Scheduler::new(0);
  assert!(scheduler.resume(&mut co) == Status::Dead);
  let mut other = Coroutine::new(|_| (), TEST_STACK).unwrap();
  assert!(scheduler.resume(&mut other) == Status::Ready);
}

#[test]
fn waiting_status_survives_the_switch() {
  let mut co = Coroutine::new(|cx| {
    let parker = cx.new_parker();
    cx.park(parker);
  }, TEST_STACK).unwrap();
  let mut scheduler = Scheduler::new(0);
  assert!(scheduler.resume(&mut co) == Status::Waiting);
  assert!(co.take_parker().is_some());
  assert!(co.take_parker().is_none());
  assert!(scheduler.resume(&mut co) == Status::Ready);
}

#[test]
fn resumes_on_another_thread() {
  let mut co = Coroutine::new(|cx| {
    let before = cx.worker_index();
    cx.yield_now();
    assert!(before == 1 && cx.worker_index() == 2);
  }, TEST_STACK).unwrap();
  let mut scheduler = Scheduler::new(1);
  assert!(scheduler.resume(&mut co) == Status::Suspend);
  let status = std::thread::spawn(move || {
    let mut scheduler = Scheduler::new(2);
    let status = scheduler.resume(&mut co);
    co.retire();
    status
  }).join().unwrap();
  assert!(status == Status::Ready);
}

#[test]
fn detached_context_cannot_spawn() {
  let outcome = Arc::new(Mutex::new(None));
  let slot = outcome.clone();
  let mut co = Coroutine::new(move |cx| {
    *slot.lock() = Some((cx.spawn(|_| ()).is_err(), cx.pool().is_none(), cx.allocator().is_none()));
  }, TEST_STACK).unwrap();
  Scheduler::new(0).resume(&mut co);
  assert!(*outcome.lock() == Some((true, true, true)));
}
