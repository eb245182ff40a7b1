use core::ptr::{null_mut, NonNull};
use std::io;

use libc;
use tracing::{debug, warn};

use crate::error::AllocFailure;

// from linux/mempolicy.h, libc does not export them
const MPOL_BIND: libc::c_ulong = 2;
const MPOL_INTERLEAVE: libc::c_ulong = 3;
// width of the node mask we hand to mbind
const MASK_BITS: usize = libc::c_ulong::BITS as usize;

/// Where the kernel was asked to place the pages of a [`Region`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
  /// Bound to the requested node.
  Local,
  /// Binding failed, pages are interleaved across all nodes.
  Interleaved,
  /// No policy could be applied, the kernel default is in effect.
  Default,
}

/// One anonymous mapping reserved for a single arena.
///
/// Pages are reserved lazily (`MAP_NORESERVE`) and carry a NUMA policy hint.
/// The mapping is released when the region is dropped.
pub struct Region {
  base: NonNull<u8>,
  len: usize,
  node: usize,
  placement: Placement,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
  pub fn reserve(len: usize, node: usize) -> Result<Self, AllocFailure> { unsafe {
    let ret_val = libc::mmap(
      null_mut(),
      len,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0
    );
    if ret_val == libc::MAP_FAILED {
      let source = io::Error::last_os_error();
      return Err(AllocFailure::Reserve { size: len, node, source });
    }
    let base = NonNull::new_unchecked(ret_val.cast::<u8>());
    let placement = apply_numa_hint(base, len, node);
    debug!(len, node, ?placement, "reserved arena region");
    return Ok(Region { base, len, node, placement });
  } }
  #[inline(always)]
  pub fn base(&self) -> NonNull<u8> {
    self.base
  }
  #[inline(always)]
  pub fn len(&self) -> usize {
    self.len
  }
  pub fn node(&self) -> usize {
    self.node
  }
  pub fn placement(&self) -> Placement {
    self.placement
  }
  #[inline(always)]
  pub fn contains(&self, ptr: *const u8) -> bool {
    let addr = ptr as usize;
    let start = self.base.as_ptr() as usize;
    return addr >= start && addr < start + self.len;
  }
}

impl Drop for Region {
  fn drop(&mut self) {
    let ret = unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) };
    debug_assert!(ret == 0, "munmap failed: {}", io::Error::last_os_error());
  }
}

fn mbind(base: NonNull<u8>, len: usize, mode: libc::c_ulong, mask: libc::c_ulong) -> io::Result<()> {
  let nodemask = [mask];
  // the kernel reads maxnode - 1 bits
  let ret = unsafe {
    libc::syscall(
      libc::SYS_mbind,
      base.as_ptr() as *mut libc::c_void,
      len as libc::c_ulong,
      mode,
      nodemask.as_ptr(),
      (MASK_BITS + 1) as libc::c_ulong,
      0 as libc::c_uint,
    )
  };
  if ret != 0 { return Err(io::Error::last_os_error()) }
  return Ok(());
}

fn apply_numa_hint(base: NonNull<u8>, len: usize, node: usize) -> Placement {
  if node < MASK_BITS {
    match mbind(base, len, MPOL_BIND, 1 << node) {
      Ok(()) => return Placement::Local,
      Err(err) => debug!(node, error = %err, "binding to node failed, trying interleave"),
    }
  } else {
    debug!(node, "node is outside of the supported mask, trying interleave");
  }
  match mbind(base, len, MPOL_INTERLEAVE, libc::c_ulong::MAX) {
    Ok(()) => return Placement::Interleaved,
    Err(err) => {
      warn!(node, error = %err, "no NUMA policy applied to arena region");
      return Placement::Default;
    }
  }
}

#[test]
fn region_is_writable() {
  const LEN: usize = 1 << 20;
  let region = Region::reserve(LEN, 0).unwrap();
  let ptr = region.base().as_ptr();
  for i in (0 .. LEN).step_by(4096) {
    unsafe { ptr.add(i).write(u8::MAX) }
  }
  assert!(unsafe { ptr.add(4096).read() } == u8::MAX);
  assert!(region.contains(ptr));
  assert!(region.contains(unsafe { ptr.add(LEN - 1) }));
  assert!(!region.contains(unsafe { ptr.add(LEN) }));
  assert!(region.len() == LEN);
}

#[test]
fn far_node_still_reserves() {
  let region = Region::reserve(1 << 16, 4096).unwrap();
  assert!(region.placement() != Placement::Local);
  assert!(region.node() == 4096);
}

#[test]
fn empty_reservation_is_rejected() {
  match Region::reserve(0, 0) {
    Err(AllocFailure::Reserve { size: 0, node: 0, .. }) => (),
    Err(other) => panic!("unexpected failure {other}"),
    Ok(_) => panic!("zero sized mapping should fail"),
  }
}
