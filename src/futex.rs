use core::ptr::null;
use core::sync::atomic::{AtomicU32, Ordering::Relaxed};

use libc;

/// Wait for a futex_wake operation to wake us.
///
/// Returns directly if the futex doesn't hold the expected value.
/// Spurious wakeups are possible, callers re-check their condition.
pub fn futex_wait(futex: &AtomicU32, expected: u32) {
  loop {
    // No need to wait if the value already changed.
    if futex.load(Relaxed) != expected {
      return;
    }
    let r = unsafe {
      libc::syscall(
        libc::SYS_futex,
        futex as *const AtomicU32,
        libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
        expected,
        null::<libc::timespec>(),
      )
    };
    match (r < 0).then(errno) {
      Some(libc::EINTR) => continue,
      _ => return,
    }
  }
}

/// Wake up to `count` threads blocked on futex_wait on this futex.
///
/// Returns how many threads were actually woken.
pub fn futex_wake(futex: &AtomicU32, count: u32) -> usize {
  let count = count.min(i32::MAX as u32) as libc::c_int;
  let op = libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG;
  let r = unsafe { libc::syscall(libc::SYS_futex, futex as *const AtomicU32, op, count) };
  return r.max(0) as usize;
}

pub fn errno() -> i32 {
  unsafe { *libc::__errno_location() }
}

#[test]
fn wait_returns_on_changed_value() {
  let futex = AtomicU32::new(1);
  futex_wait(&futex, 0);
  assert!(futex_wake(&futex, 1) == 0);
}

#[test]
fn wake_reaches_sleeper() {
  use std::sync::atomic::Ordering::SeqCst;
  let futex = AtomicU32::new(0);
  std::thread::scope(|scope| {
    scope.spawn(|| {
      while futex.load(SeqCst) == 0 {
        futex_wait(&futex, 0);
      }
    });
    std::thread::sleep(std::time::Duration::from_millis(20));
    futex.store(1, SeqCst);
    futex_wake(&futex, 1);
  });
  assert!(futex.load(SeqCst) == 1);
}
