use core::ptr::NonNull;
use std::collections::HashMap;

use tracing::trace;

use crate::{
  error::{AllocFailure, Error},
  utils::{align_up, static_assert},
  virt_mem::{Placement, Region},
};

/// Space reserved in front of every block. Split and coalesce arithmetic
/// accounts for it exactly like an inline header would.
pub const HEADER_SIZE: usize = 32;
pub const DEFAULT_ARENA_SIZE: usize = 128 * 1024 * 1024;
pub const DEFAULT_MIN_BLOB: usize = 16;
pub const DEFAULT_ALIGNMENT: usize = 16;
const MAX_ALIGNMENT: usize = 4096;

static_assert!(HEADER_SIZE % DEFAULT_ALIGNMENT == 0);

/// The allocator shape shared by arenas, arena pools and their locked wrapper.
pub trait RawAlloc {
  /// At least `size` bytes, aligned to the allocator's boundary.
  fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, AllocFailure>;
  /// Pointers this allocator did not hand out are ignored.
  fn free(&mut self, ptr: *mut u8);
  fn is_in_pool(&self, ptr: *const u8) -> bool;
}

#[derive(Debug, Clone)]
pub struct ArenaConfig {
  pub size: usize,
  pub min_blob: usize,
  pub alignment: usize,
}

impl Default for ArenaConfig {
  fn default() -> Self {
    Self { size: DEFAULT_ARENA_SIZE, min_blob: DEFAULT_MIN_BLOB, alignment: DEFAULT_ALIGNMENT }
  }
}

impl ArenaConfig {
  pub fn size(mut self, size: usize) -> Self {
    self.size = size;
    self
  }
  pub fn min_blob(mut self, min_blob: usize) -> Self {
    self.min_blob = min_blob;
    self
  }
  pub fn alignment(mut self, alignment: usize) -> Self {
    self.alignment = alignment;
    self
  }
  /// Gap kept in front of each block, rounded so blocks stay aligned.
  pub fn header_size(&self) -> usize {
    align_up(HEADER_SIZE, self.alignment)
  }
  /// Bytes a fresh arena can hand out at most.
  pub fn capacity(&self) -> usize {
    self.size.saturating_sub(self.header_size())
  }
  pub fn validate(&self) -> Result<(), Error> {
    if !self.alignment.is_power_of_two() || self.alignment > MAX_ALIGNMENT {
      return Err(Error::Config(format!(
        "arena alignment must be a power of two no larger than {MAX_ALIGNMENT}, got {}",
        self.alignment)));
    }
    if self.size < self.header_size() + self.alignment {
      return Err(Error::Config(format!(
        "arena of {} bytes cannot hold a single block", self.size)));
    }
    return Ok(());
  }
}

type NodeId = usize;

#[derive(Debug, Clone, Copy)]
struct MemNode {
  prev: Option<NodeId>,
  next: Option<NodeId>,
  start: usize,
  end: usize,
}
impl MemNode {
  #[inline(always)]
  fn size(&self) -> usize {
    self.end - self.start
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
  pub capacity: usize,
  pub allocated: usize,
  pub free: usize,
  pub largest_free: usize,
  pub fragments: usize,
}

/// Fixed-size, first-fit allocator over one NUMA-local region.
///
/// Free space is tracked by an address-ordered, doubly linked list of
/// [`MemNode`]s. Offsets stand in for addresses, so the bookkeeping never
/// points into the managed memory itself. A node stays in the slab while its
/// block is in use and is found again through `used` on `free`.
pub struct Arena {
  region: Region,
  nodes: Vec<MemNode>,
  spare_nodes: Vec<NodeId>,
  free_head: Option<NodeId>,
  used: HashMap<usize, NodeId>,
  header: usize,
  min_blob: usize,
  alignment: usize,
  allocated: usize,
}

impl Arena {
  pub fn new(node: usize, config: &ArenaConfig) -> Result<Self, Error> {
    config.validate()?;
    let region = Region::reserve(config.size, node)?;
    let header = config.header_size();
    let mut arena = Arena {
      region,
      nodes: Vec::new(),
      spare_nodes: Vec::new(),
      free_head: None,
      used: HashMap::new(),
      header,
      min_blob: config.min_blob,
      alignment: config.alignment,
      allocated: 0,
    };
    let first = arena.new_node(MemNode { prev: None, next: None, start: header, end: config.size });
    arena.free_head = Some(first);
    return Ok(arena);
  }
  pub fn node(&self) -> usize {
    self.region.node()
  }
  pub fn placement(&self) -> Placement {
    self.region.placement()
  }
  pub fn capacity(&self) -> usize {
    self.region.len() - self.header
  }
  fn new_node(&mut self, node: MemNode) -> NodeId {
    if let Some(id) = self.spare_nodes.pop() {
      self.nodes[id] = node;
      return id;
    }
    self.nodes.push(node);
    return self.nodes.len() - 1;
  }
  fn release_node(&mut self, id: NodeId) {
    self.spare_nodes.push(id);
  }
  // takes the node out of the free list, neighbours get linked to each other
  fn unlink(&mut self, id: NodeId) {
    let MemNode { prev, next, .. } = self.nodes[id];
    if let Some(next) = next { self.nodes[next].prev = prev }
    match prev {
      Some(prev) => self.nodes[prev].next = next,
      None => self.free_head = next,
    }
  }
  // puts `with` in the list slot currently held by `id`
  fn replace_in_list(&mut self, id: NodeId, with: NodeId) {
    let MemNode { prev, next, .. } = self.nodes[id];
    self.nodes[with].prev = prev;
    self.nodes[with].next = next;
    if let Some(next) = next { self.nodes[next].prev = Some(with) }
    match prev {
      Some(prev) => self.nodes[prev].next = Some(with),
      None => self.free_head = Some(with),
    }
  }
  fn first_fit(&self, size: usize) -> Option<NodeId> {
    let mut cursor = self.free_head;
    while let Some(id) = cursor {
      let node = &self.nodes[id];
      if node.size() >= size { return Some(id) }
      cursor = node.next;
    }
    return None;
  }
  pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, AllocFailure> {
    // also keeps the rounding below from overflowing
    if size > self.capacity() {
      return Err(AllocFailure::NoMem { requested: size });
    }
    let rounded = align_up(size.max(1), self.alignment);
    let Some(id) = self.first_fit(rounded) else {
      return Err(AllocFailure::NoMem { requested: size });
    };
    let node = self.nodes[id];
    let leftover = node.size() - rounded;
    if leftover < self.min_blob + self.header {
      // slivers this small are never worth their own node
      self.unlink(id);
    } else {
      let tail = self.new_node(MemNode {
        prev: None,
        next: None,
        start: node.start + rounded + self.header,
        end: node.end,
      });
      self.replace_in_list(id, tail);
      self.nodes[id].end = node.start + rounded;
    }
    let node = &mut self.nodes[id];
    node.prev = None;
    node.next = None;
    let (start, granted) = (node.start, node.size());
    self.allocated += granted;
    self.used.insert(start, id);
    let ptr = unsafe { NonNull::new_unchecked(self.region.base().as_ptr().add(start)) };
    return Ok(ptr);
  }
  pub fn free(&mut self, ptr: *mut u8) {
    if !self.is_in_pool(ptr) { return }
    let offset = ptr as usize - self.region.base().as_ptr() as usize;
    let Some(id) = self.used.remove(&offset) else {
      trace!(offset, "ignoring free of a block this arena does not own");
      return;
    };
    self.allocated -= self.nodes[id].size();
    self.insert_free(id);
  }
  fn insert_free(&mut self, id: NodeId) {
    let Some(head) = self.free_head else {
      self.nodes[id].prev = None;
      self.nodes[id].next = None;
      self.free_head = Some(id);
      return;
    };
    let start = self.nodes[id].start;
    // last free node below the returned block
    let mut left = None;
    let mut cursor = Some(head);
    while let Some(cur) = cursor {
      if self.nodes[cur].start >= start { break }
      left = Some(cur);
      cursor = self.nodes[cur].next;
    }
    let right = match left {
      Some(left) => self.nodes[left].next,
      None => Some(head),
    };
    let merged_left = match left {
      Some(left) if self.nodes[left].end + self.header == start => {
        self.nodes[left].end = self.nodes[id].end;
        self.release_node(id);
        Some(left)
      },
      _ => None,
    };
    let current = match merged_left {
      Some(left) => left,
      None => {
        self.nodes[id].prev = left;
        self.nodes[id].next = right;
        if let Some(right) = right { self.nodes[right].prev = Some(id) }
        match left {
          Some(left) => self.nodes[left].next = Some(id),
          None => self.free_head = Some(id),
        }
        id
      }
    };
    if let Some(next) = self.nodes[current].next {
      if self.nodes[current].end + self.header == self.nodes[next].start {
        let after = self.nodes[next].next;
        self.nodes[current].end = self.nodes[next].end;
        self.nodes[current].next = after;
        if let Some(after) = after { self.nodes[after].prev = Some(current) }
        self.release_node(next);
      }
    }
  }
  #[inline(always)]
  pub fn is_in_pool(&self, ptr: *const u8) -> bool {
    !ptr.is_null() && self.region.contains(ptr)
  }
  pub fn stats(&self) -> ArenaStats {
    let mut stats = ArenaStats {
      capacity: self.capacity(),
      allocated: self.allocated,
      ..ArenaStats::default()
    };
    let mut cursor = self.free_head;
    while let Some(id) = cursor {
      let size = self.nodes[id].size();
      stats.free += size;
      stats.largest_free = stats.largest_free.max(size);
      stats.fragments += 1;
      cursor = self.nodes[id].next;
    }
    return stats;
  }
  #[cfg(test)]
  fn check_free_list(&self) {
    let mut prev: Option<NodeId> = None;
    let mut cursor = self.free_head;
    while let Some(id) = cursor {
      let node = self.nodes[id];
      assert!(node.prev == prev, "broken back link at node {id}");
      assert!(node.start >= self.header && node.end <= self.region.len());
      assert!(node.start <= node.end);
      assert!(!self.used.contains_key(&node.start), "free node {id} is also in use");
      if let Some(prev) = prev {
        let prev = self.nodes[prev];
        assert!(prev.end < node.start, "free list out of order or overlapping");
        assert!(prev.end + self.header != node.start, "adjacent free nodes left unmerged");
      }
      prev = Some(id);
      cursor = node.next;
    }
  }
}

impl RawAlloc for Arena {
  fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, AllocFailure> {
    Arena::alloc(self, size)
  }
  fn free(&mut self, ptr: *mut u8) {
    Arena::free(self, ptr)
  }
  fn is_in_pool(&self, ptr: *const u8) -> bool {
    Arena::is_in_pool(self, ptr)
  }
}

#[cfg(test)]
fn small_config() -> ArenaConfig {
  ArenaConfig::default().size(1 << 20)
}

#[test]
fn first_block_follows_header() {
  let mut arena = Arena::new(0, &small_config()).unwrap();
  let base = arena.region.base().as_ptr() as usize;
  let a = arena.alloc(10).unwrap();
  assert!(a.as_ptr() as usize == base + HEADER_SIZE);
  let b = arena.alloc(16).unwrap();
  assert!(b.as_ptr() as usize == base + HEADER_SIZE + 16 + HEADER_SIZE);
  for ptr in [a, b] {
    assert!(ptr.as_ptr() as usize % DEFAULT_ALIGNMENT == 0);
    assert!(arena.is_in_pool(ptr.as_ptr()));
  }
  arena.check_free_list();
}

#[test]
fn alignment_is_honoured() {
  let config = small_config().alignment(64);
  let mut arena = Arena::new(0, &config).unwrap();
  for size in [1, 63, 65, 200, 4000] {
    let ptr = arena.alloc(size).unwrap();
    assert!(ptr.as_ptr() as usize % 64 == 0, "{size} bytes landed unaligned");
  }
  arena.check_free_list();
}

#[test]
fn small_leftover_is_handed_out_whole() {
  let config = small_config();
  let mut arena = Arena::new(0, &config).unwrap();
  let cap = arena.capacity();
  // leave less than min_blob + header behind
  let ptr = arena.alloc(cap - 32).unwrap();
  let stats = arena.stats();
  assert!(stats.allocated == cap, "whole node should be granted");
  assert!(stats.free == 0 && stats.fragments == 0);
  assert!(matches!(arena.alloc(1), Err(AllocFailure::NoMem { requested: 1 })));
  arena.free(ptr.as_ptr());
  assert!(arena.stats().free == cap);
  arena.check_free_list();
}

#[test]
fn frees_coalesce_both_ways() {
  let mut arena = Arena::new(0, &small_config()).unwrap();
  let cap = arena.capacity();
  let blocks = (0 .. 5).map(|_| arena.alloc(100).unwrap()).collect::<Vec<_>>();
  arena.free(blocks[1].as_ptr());
  arena.free(blocks[3].as_ptr());
  arena.check_free_list();
  assert!(arena.stats().fragments == 3);
  // bridges 1 and 3
  arena.free(blocks[2].as_ptr());
  arena.check_free_list();
  assert!(arena.stats().fragments == 2);
  arena.free(blocks[0].as_ptr());
  arena.free(blocks[4].as_ptr());
  arena.check_free_list();
  let stats = arena.stats();
  assert!(stats.fragments == 1 && stats.free == cap && stats.allocated == 0);
}

#[test]
fn freed_space_is_reused_first_fit() {
  let mut arena = Arena::new(0, &small_config()).unwrap();
  let a = arena.alloc(256).unwrap();
  let _b = arena.alloc(256).unwrap();
  arena.free(a.as_ptr());
  let c = arena.alloc(64).unwrap();
  assert!(c == a, "first fit should reuse the lowest hole");
  arena.check_free_list();
}

#[test]
fn foreign_and_double_frees_are_ignored() {
  let mut arena = Arena::new(0, &small_config()).unwrap();
  let ptr = arena.alloc(48).unwrap();
  let before = arena.stats();
  let mut outside = 0u64;
  arena.free(&mut outside as *mut u64 as *mut u8);
  arena.free(core::ptr::null_mut());
  arena.free(unsafe { ptr.as_ptr().add(16) });
  assert!(arena.stats() == before);
  arena.free(ptr.as_ptr());
  let after = arena.stats();
  arena.free(ptr.as_ptr());
  assert!(arena.stats() == after);
  arena.check_free_list();
}

#[test]
fn exhaustion_reports_no_mem() {
  let mut arena = Arena::new(0, &small_config()).unwrap();
  let mut held = Vec::new();
  loop {
    match arena.alloc(4096) {
      Ok(ptr) => held.push(ptr),
      Err(AllocFailure::NoMem { requested }) => { assert!(requested == 4096); break }
      Err(other) => panic!("unexpected failure {other}"),
    }
  }
  assert!(held.len() > 200);
  for ptr in held.drain(..).rev() { arena.free(ptr.as_ptr()) }
  assert!(arena.stats().free == arena.capacity());
}

#[test]
fn huge_requests_fail_cleanly() {
  let mut arena = Arena::new(0, &small_config()).unwrap();
  for size in [usize::MAX, usize::MAX - 8, arena.capacity() + 1] {
    match arena.alloc(size) {
      Err(AllocFailure::NoMem { requested }) => assert!(requested == size),
      other => panic!("alloc({size}) should fail, got {other:?}"),
    }
  }
  assert!(arena.stats().allocated == 0);
  // the whole capacity is still one block
  let all = arena.alloc(arena.capacity()).unwrap();
  arena.free(all.as_ptr());
}

#[test]
fn bad_configs_are_rejected() {
  assert!(matches!(Arena::new(0, &small_config().alignment(24)), Err(Error::Config(_))));
  assert!(matches!(Arena::new(0, &small_config().alignment(8192)), Err(Error::Config(_))));
  assert!(matches!(Arena::new(0, &ArenaConfig::default().size(40)), Err(Error::Config(_))));
}

#[cfg(test)]
mod props {
  use super::*;
  use proptest::{collection::vec, prelude::*};

  #[derive(Debug, Clone)]
  enum Op { Alloc(usize), Free(usize) }

  fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
      (1usize .. 8192).prop_map(Op::Alloc),
      any::<usize>().prop_map(Op::Free),
    ]
  }

  proptest! {
    #[test]
    fn free_list_stays_ordered_and_merged(ops in vec(op(), 1 .. 200)) {
      let mut arena = Arena::new(0, &small_config()).unwrap();
      let mut live: Vec<NonNull<u8>> = Vec::new();
      for op in ops {
        match op {
          Op::Alloc(size) => {
            let largest = arena.stats().largest_free;
            match arena.alloc(size) {
              Ok(ptr) => {
                prop_assert!(arena.is_in_pool(ptr.as_ptr()));
                live.push(ptr);
              },
              Err(_) => prop_assert!(align_up(size, DEFAULT_ALIGNMENT) > largest),
            }
          },
          Op::Free(pick) => {
            if !live.is_empty() {
              let ptr = live.swap_remove(pick % live.len());
              arena.free(ptr.as_ptr());
            }
          },
        }
        arena.check_free_list();
        for ptr in &live { prop_assert!(arena.is_in_pool(ptr.as_ptr())) }
      }
    }

    #[test]
    fn any_free_order_restores_capacity(
      sizes in vec(1usize .. 4096, 1 .. 100),
      order in any::<u64>(),
    ) {
      let mut arena = Arena::new(0, &small_config()).unwrap();
      let initial = arena.stats();
      let mut live = sizes.iter().map(|size| arena.alloc(*size).unwrap()).collect::<Vec<_>>();
      let mut seed = order;
      while !live.is_empty() {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let ptr = live.swap_remove((seed >> 33) as usize % live.len());
        arena.free(ptr.as_ptr());
        arena.check_free_list();
      }
      prop_assert_eq!(arena.stats(), initial);
    }
  }
}
