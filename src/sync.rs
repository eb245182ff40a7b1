//! Blocking primitives for code running inside a task pool.
//!
//! Waiting never blocks the worker thread: the calling coroutine is parked on
//! the primitive and the worker moves on. Waking it puts it back at the head
//! of one of the pool's queues. The wake side is plain code and can be called
//! from tasks and ordinary threads alike.

use core::mem;
use std::{collections::VecDeque, sync::{Arc, Weak}};

use parking_lot::Mutex;
use tracing::trace;

use crate::{coroutine::{Coroutine, TaskContext}, task_pool::PoolShared};

enum ParkState {
  Pending,
  Parked(Box<Coroutine>),
  Woken,
}

/// One wait. Whichever of the parking worker and the waker comes second puts
/// the coroutine back in a queue, so a wake that lands before the coroutine
/// has switched out is never lost.
pub(crate) struct Parker {
  state: Mutex<ParkState>,
  pool: Weak<PoolShared>,
}

impl Parker {
  pub(crate) fn new(pool: Weak<PoolShared>) -> Arc<Self> {
    Arc::new(Self { state: Mutex::new(ParkState::Pending), pool })
  }
  /// Called by the worker once the coroutine is off its stack. Gives the
  /// coroutine back when it was woken in the meantime.
  pub(crate) fn deposit(&self, co: Box<Coroutine>) -> Option<Box<Coroutine>> {
    let mut state = self.state.lock();
    match *state {
      ParkState::Pending => {
        *state = ParkState::Parked(co);
        return None;
      },
      _ => return Some(co),
    }
  }
  pub(crate) fn unpark(&self) {
    let parked = match mem::replace(&mut *self.state.lock(), ParkState::Woken) {
      ParkState::Parked(co) => co,
      _ => return,
    };
    match self.pool.upgrade() {
      Some(pool) => pool.readmit(parked),
      None => trace!(coroutine = parked.id(), "pool is gone, dropping woken coroutine"),
    }
  }
}

struct SemState {
  count: usize,
  waiters: VecDeque<(usize, Arc<Parker>)>,
}

/// Counting semaphore for tasks.
///
/// A caller whose request the count covers passes straight through. Parked
/// waiters are served strictly in arrival order: a large request at the head
/// holds back smaller ones queued behind it.
pub struct Semaphore {
  state: Mutex<SemState>,
}

impl Semaphore {
  pub fn new(initial: usize) -> Self {
    Self { state: Mutex::new(SemState { count: initial, waiters: VecDeque::new() }) }
  }
  /// Takes `count` units, parking the task until they are available.
  pub fn down(&self, cx: &TaskContext<'_>, count: usize) {
    let parker = {
      let mut state = self.state.lock();
      if state.count >= count {
        state.count -= count;
        return;
      }
      let parker = cx.new_parker();
      state.waiters.push_back((count, parker.clone()));
      parker
    };
    cx.park(parker);
  }
  pub fn try_down(&self, count: usize) -> bool {
    let mut state = self.state.lock();
    if state.count >= count {
      state.count -= count;
      return true;
    }
    return false;
  }
  /// Returns one unit and wakes the head waiter if its request is now
  /// covered.
  pub fn up(&self) {
    let woken = {
      let mut state = self.state.lock();
      state.count += 1;
      let head_fits = matches!(state.waiters.front(), Some((need, _)) if *need <= state.count);
      match head_fits.then(|| state.waiters.pop_front()).flatten() {
        Some((need, parker)) => {
          state.count -= need;
          Some(parker)
        },
        None => None,
      }
    };
    if let Some(parker) = woken { parker.unpark() }
  }
  pub fn available(&self) -> usize {
    self.state.lock().count
  }
  pub fn waiters(&self) -> usize {
    self.state.lock().waiters.len()
  }
}

struct EventState {
  armed: bool,
  waiters: VecDeque<Arc<Parker>>,
}

/// Auto-reset event. A signal with nobody waiting is remembered once.
pub struct Event {
  state: Mutex<EventState>,
}

impl Event {
  pub fn new(armed: bool) -> Self {
    Self { state: Mutex::new(EventState { armed, waiters: VecDeque::new() }) }
  }
  pub fn wait(&self, cx: &TaskContext<'_>) {
    let parker = {
      let mut state = self.state.lock();
      if state.armed {
        state.armed = false;
        return;
      }
      let parker = cx.new_parker();
      state.waiters.push_back(parker.clone());
      parker
    };
    cx.park(parker);
  }
  /// Releases the oldest waiter, or arms the event if there is none.
  pub fn signal(&self) {
    let woken = {
      let mut state = self.state.lock();
      let woken = state.waiters.pop_front();
      if woken.is_none() { state.armed = true }
      woken
    };
    if let Some(parker) = woken { parker.unpark() }
  }
  pub fn is_armed(&self) -> bool {
    self.state.lock().armed
  }
  pub fn waiters(&self) -> usize {
    self.state.lock().waiters.len()
  }
}

struct BarrierState {
  arrived: usize,
  waiters: VecDeque<Arc<Parker>>,
}

/// Reusable barrier. Every `trigger` arrivals release one generation.
pub struct Barrier {
  trigger: usize,
  state: Mutex<BarrierState>,
}

impl Barrier {
  pub fn new(trigger: usize) -> Self {
    Self {
      trigger: trigger.max(1),
      state: Mutex::new(BarrierState { arrived: 0, waiters: VecDeque::new() }),
    }
  }
  /// Returns true for the arrival that completed the generation.
  pub fn sync(&self, cx: &TaskContext<'_>) -> bool {
    let parker = {
      let mut state = self.state.lock();
      state.arrived += 1;
      if state.arrived >= self.trigger {
        state.arrived -= self.trigger;
        let released: Vec<_> = (1 .. self.trigger).map_while(|_| state.waiters.pop_front()).collect();
        drop(state);
        for parker in released {
          parker.unpark();
        }
        return true;
      }
      let parker = cx.new_parker();
      state.waiters.push_back(parker.clone());
      parker
    };
    cx.park(parker);
    return false;
  }
  pub fn trigger(&self) -> usize {
    self.trigger
  }
  /// Arrivals in the current generation.
  pub fn arrived(&self) -> usize {
    self.state.lock().arrived
  }
}

#[cfg(test)]
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
#[cfg(test)]
use crate::{sys, task_pool::{TaskPool, TaskPoolConfig}};

#[cfg(test)]
fn test_pool(threads: usize) -> TaskPool {
  let config = TaskPoolConfig::default()
    .threads(threads)
    .affinity(1)
    .stack_size(64 * 1024)
    .pin_threads(false)
    .name("sync-test");
  TaskPool::new(config).unwrap()
}

#[cfg(test)]
fn wait_until(what: &str, cond: impl Fn() -> bool) {
  let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
  while !cond() {
    assert!(std::time::Instant::now() < deadline, "timed out waiting for {what}");
    std::thread::sleep(std::time::Duration::from_millis(1));
  }
}

#[test]
fn down_waits_for_enough_ups() {
  let pool = test_pool(2);
  let sem = Arc::new(Semaphore::new(0));
  let done = Arc::new(sys::Semaphore::new(0));
  let passed = Arc::new(AtomicBool::new(false));
  let (task_sem, task_done, task_passed) = (sem.clone(), done.clone(), passed.clone());
  pool.add_task(move |cx| {
    task_sem.down(cx, 3);
    task_passed.store(true, SeqCst);
    task_done.up(1);
  }, None).unwrap();
  wait_until("the task to park", || sem.waiters() == 1);
  sem.up();
  sem.up();
  std::thread::sleep(std::time::Duration::from_millis(20));
  assert!(!passed.load(SeqCst), "released with only two of three units");
  sem.up();
  done.down();
  assert!(passed.load(SeqCst));
  assert!(sem.available() == 0 && sem.waiters() == 0);
}

#[test]
fn covered_request_passes_a_parked_head() {
  let pool = test_pool(2);
  let sem = Arc::new(Semaphore::new(1));
  let done = Arc::new(sys::Semaphore::new(0));
  let order = Arc::new(Mutex::new(Vec::new()));
  let spawn_down = |name: &'static str, need: usize| {
    let (task_sem, done, order) = (sem.clone(), done.clone(), order.clone());
    pool.add_task(move |cx| {
      task_sem.down(cx, need);
      order.lock().push(name);
      done.up(1);
    }, None).unwrap();
  };
  spawn_down("big", 5);
  wait_until("the big request to park", || sem.waiters() == 1);
  // the free unit covers a small request even with the big one parked
  spawn_down("small", 1);
  done.down();
  assert!(*order.lock() == vec!["small"]);
  assert!(sem.available() == 0 && sem.waiters() == 1);
  assert!(!sem.try_down(1));
  spawn_down("late", 1);
  wait_until("the late request to park", || sem.waiters() == 2);
  // only the head is looked at, the late request waits behind it
  for _ in 0 .. 4 {
    sem.up();
  }
  assert!(sem.waiters() == 2 && sem.available() == 4);
  assert!(sem.try_down(1));
  sem.up();
  sem.up();
  done.down();
  assert!(*order.lock() == vec!["small", "big"]);
  assert!(sem.waiters() == 1 && sem.available() == 0);
  sem.up();
  done.down();
  assert!(*order.lock() == vec!["small", "big", "late"]);
}

#[test]
fn semaphore_as_a_lock_across_yields() {
  let pool = test_pool(4);
  let lock = Arc::new(Semaphore::new(1));
  let value = Arc::new(AtomicUsize::new(0));
  let done = Arc::new(sys::Semaphore::new(0));
  for _ in 0 .. 200 {
    let (lock, value, done) = (lock.clone(), value.clone(), done.clone());
    pool.add_task(move |cx| {
      lock.down(cx, 1);
      let seen = value.load(SeqCst);
      cx.yield_now();
      value.store(seen + 1, SeqCst);
      lock.up();
      done.up(1);
    }, None).unwrap();
  }
  for _ in 0 .. 200 {
    done.down();
  }
  assert!(value.load(SeqCst) == 200);
  assert!(lock.available() == 1);
}

#[test]
fn event_remembers_one_signal() {
  let pool = test_pool(2);
  let event = Arc::new(Event::new(false));
  event.signal();
  event.signal();
  assert!(event.is_armed());
  let done = Arc::new(sys::Semaphore::new(0));
  let woke = Arc::new(AtomicUsize::new(0));
  for _ in 0 .. 2 {
    let (event, done, woke) = (event.clone(), done.clone(), woke.clone());
    pool.add_task(move |cx| {
      event.wait(cx);
      woke.fetch_add(1, SeqCst);
      done.up(1);
    }, None).unwrap();
  }
  // the stored signal lets exactly one waiter through
  done.down();
  wait_until("the second waiter to park", || !event.is_armed() && woke.load(SeqCst) == 1);
  wait_until("the second waiter to park", || event.waiters() == 1);
  event.signal();
  done.down();
  assert!(woke.load(SeqCst) == 2);
  assert!(!event.is_armed());
}

#[test]
fn event_wakes_oldest_waiter_only() {
  let pool = test_pool(1);
  let event = Arc::new(Event::new(false));
  let done = Arc::new(sys::Semaphore::new(0));
  let log = Arc::new(Mutex::new(Vec::new()));
  for (parked, name) in [(0, "first"), (1, "second")] {
    let (waiter, log, finished) = (event.clone(), log.clone(), done.clone());
    pool.add_task(move |cx| {
      waiter.wait(cx);
      log.lock().push(name);
      finished.up(1);
    }, None).unwrap();
    wait_until("the waiter to park", || event.waiters() == parked + 1);
  }
  event.signal();
  done.down();
  assert!(*log.lock() == vec!["first"]);
  std::thread::sleep(std::time::Duration::from_millis(20));
  assert!(log.lock().len() == 1, "one signal released two waiters");
  assert!(event.waiters() == 1 && !event.is_armed());
  event.signal();
  done.down();
  assert!(*log.lock() == vec!["first", "second"]);
}

#[test]
fn woken_task_runs_ahead_of_queued_ones() {
  let pool = test_pool(1);
  let event = Arc::new(Event::new(false));
  let gate = Arc::new(sys::Semaphore::new(0));
  let done = Arc::new(sys::Semaphore::new(0));
  let log = Arc::new(Mutex::new(Vec::new()));
  let (waiter, first, finished) = (event.clone(), log.clone(), done.clone());
  pool.add_task(move |cx| {
    waiter.wait(cx);
    first.lock().push("woken");
    finished.up(1);
  }, None).unwrap();
  wait_until("the waiter to park", || event.waiters() == 1);
  // keeps the only worker busy while the queue fills up
  let held = gate.clone();
  pool.add_task(move |_| held.down(), None).unwrap();
  for name in ["queued-1", "queued-2"] {
    let (log, finished) = (log.clone(), done.clone());
    pool.add_task(move |_| {
      log.lock().push(name);
      finished.up(1);
    }, None).unwrap();
  }
  event.signal();
  gate.up(1);
  for _ in 0 .. 3 {
    done.down();
  }
  assert!(*log.lock() == vec!["woken", "queued-1", "queued-2"]);
}

#[test]
fn barrier_releases_in_generations() {
  let pool = test_pool(3);
  let barrier = Arc::new(Barrier::new(3));
  let leaders = Arc::new(AtomicUsize::new(0));
  let passed = Arc::new(AtomicUsize::new(0));
  let done = Arc::new(sys::Semaphore::new(0));
  for _ in 0 .. 6 {
    let (barrier, leaders, passed, done) = (barrier.clone(), leaders.clone(), passed.clone(), done.clone());
    pool.add_task(move |cx| {
      if barrier.sync(cx) { leaders.fetch_add(1, SeqCst); }
      passed.fetch_add(1, SeqCst);
      done.up(1);
    }, None).unwrap();
  }
  for _ in 0 .. 6 {
    done.down();
  }
  assert!(leaders.load(SeqCst) == 2);
  assert!(passed.load(SeqCst) == 6);
  assert!(barrier.arrived() == 0);
}

#[test]
fn barrier_holds_until_trigger() {
  let pool = test_pool(2);
  let barrier = Arc::new(Barrier::new(2));
  let passed = Arc::new(AtomicUsize::new(0));
  let (first, count) = (barrier.clone(), passed.clone());
  pool.add_task(move |cx| {
    first.sync(cx);
    count.fetch_add(1, SeqCst);
  }, None).unwrap();
  wait_until("the first arrival", || barrier.arrived() == 1);
  assert!(passed.load(SeqCst) == 0);
  let (second, count) = (barrier.clone(), passed.clone());
  pool.add_task(move |cx| {
    assert!(second.sync(cx));
    count.fetch_add(1, SeqCst);
  }, None).unwrap();
  wait_until("both arrivals to pass", || passed.load(SeqCst) == 2);
  assert!(Barrier::new(0).trigger() == 1);
}
