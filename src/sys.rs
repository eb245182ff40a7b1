//! Thread-level plumbing: a futex backed counting semaphore for OS threads
//! and cpu pinning.

use core::mem::{size_of, zeroed};
use core::sync::atomic::{AtomicU32, Ordering::{Acquire, Relaxed, SeqCst}};
use std::io;

use libc;

use crate::futex::{futex_wait, futex_wake};

/// Counting semaphore that blocks the calling OS thread.
///
/// Workers sleep on one of these while their queue is empty. It is also the
/// tool for plain threads (a group's launcher, say) that have to wait for
/// tasks running inside a pool.
pub struct Semaphore {
  count: AtomicU32,
  sleepers: AtomicU32,
}

impl Semaphore {
  pub const fn new(initial: u32) -> Self {
    Self { count: AtomicU32::new(initial), sleepers: AtomicU32::new(0) }
  }
  pub fn try_down(&self) -> bool {
    let mut current = self.count.load(Relaxed);
    while current > 0 {
      match self.count.compare_exchange_weak(current, current - 1, Acquire, Relaxed) {
        Ok(_) => return true,
        Err(actual) => current = actual,
      }
    }
    return false;
  }
  pub fn down(&self) {
    loop {
      if self.try_down() { return }
      self.sleepers.fetch_add(1, SeqCst);
      futex_wait(&self.count, 0);
      self.sleepers.fetch_sub(1, SeqCst);
    }
  }
  pub fn up(&self, count: u32) {
    if count == 0 { return }
    // saturates, surplus wakeups only cost a spurious loop turn
    let mut current = self.count.load(Relaxed);
    loop {
      match self.count.compare_exchange_weak(current, current.saturating_add(count), SeqCst, Relaxed) {
        Ok(_) => break,
        Err(actual) => current = actual,
      }
    }
    if self.sleepers.load(SeqCst) != 0 {
      futex_wake(&self.count, count);
    }
  }
  pub fn available(&self) -> u32 {
    self.count.load(Relaxed)
  }
}

impl Default for Semaphore {
  fn default() -> Self {
    Self::new(0)
  }
}

/// Pins the calling thread to one cpu.
pub fn pin_current_to_cpu(cpu: usize) -> bool {
  core_affinity::set_for_current(core_affinity::CoreId { id: cpu })
}

/// Restricts the calling thread to the cpus set in `mask`.
pub fn pin_current_to_mask(mask: u64) -> io::Result<()> { unsafe {
  let mut set: libc::cpu_set_t = zeroed();
  libc::CPU_ZERO(&mut set);
  for cpu in 0 .. u64::BITS as usize {
    if mask & (1u64 << cpu) != 0 { libc::CPU_SET(cpu, &mut set) }
  }
  let ret = libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &set);
  if ret != 0 { return Err(io::Error::last_os_error()) }
  return Ok(());
} }

#[test]
fn counts_are_kept() {
  let sem = Semaphore::new(2);
  assert!(sem.try_down() && sem.try_down());
  assert!(!sem.try_down());
  sem.up(3);
  assert!(sem.available() == 3);
  sem.down();
  assert!(sem.available() == 2);
}

#[test]
fn count_saturates() {
  let sem = Semaphore::new(u32::MAX - 1);
  sem.up(5);
  assert!(sem.available() == u32::MAX);
  sem.up(1);
  assert!(sem.available() == u32::MAX);
  assert!(sem.try_down());
  assert!(sem.available() == u32::MAX - 1);
}

#[test]
fn up_releases_blocked_threads() {
  let sem = Semaphore::new(0);
  let done = AtomicU32::new(0);
  std::thread::scope(|scope| {
    for _ in 0 .. 4 {
      scope.spawn(|| {
        sem.down();
        done.fetch_add(1, SeqCst);
      });
    }
    std::thread::sleep(std::time::Duration::from_millis(20));
    assert!(done.load(SeqCst) == 0);
    sem.up(4);
  });
  assert!(done.load(SeqCst) == 4);
  assert!(sem.available() == 0);
}

#[test]
fn pinning_to_first_cpu() {
  let first = core_affinity::get_core_ids()
    .and_then(|ids| ids.first().map(|id| id.id))
    .unwrap_or(0);
  std::thread::spawn(move || {
    assert!(pin_current_to_mask(1u64 << first).is_ok());
    assert!(pin_current_to_cpu(first));
  }).join().unwrap();
  assert!(pin_current_to_mask(0).is_err());
}
