
macro_rules! static_assert {
    ($cond:expr) => {
      const _ : () = if !$cond { std::panic!("Comptime assert failed!") } ;
    };
    ($cond:expr, $msg:expr) => {
      const _ : () = if !$cond { panic!($msg) } ;
    };
}
pub(crate) use static_assert;

// alignment must be a power of two
#[inline(always)]
pub(crate) const fn align_up(value: usize, alignment: usize) -> usize {
  (value + (alignment - 1)) & !(alignment - 1)
}

static_assert!(align_up(0, 16) == 0);
static_assert!(align_up(1, 16) == 16);
static_assert!(align_up(32, 16) == 32);

/// Physical cpu index for each of `thread_count` workers.
///
/// Walks the set bits of `mask` from the lowest one up and hands them out in
/// order, wrapping around when there are more workers than set bits.
/// Returns `None` for an empty mask.
pub fn cpu_assignments(mask: u64, thread_count: usize) -> Option<Vec<usize>> {
  if mask == 0 { return None }
  let cpus = (0 .. u64::BITS as usize)
    .filter(|bit| mask & (1u64 << bit) != 0)
    .collect::<Vec<_>>();
  let assigned = (0 .. thread_count)
    .map(|ix| cpus[ix % cpus.len()])
    .collect();
  return Some(assigned)
}

#[inline(always)]
pub(crate) fn mask_population(mask: u64) -> usize {
  mask.count_ones() as usize
}

#[test]
fn aligning() {
  assert!(align_up(17, 16) == 32);
  assert!(align_up(4095, 4096) == 4096);
  assert!(align_up(64, 32) == 64);
}

#[test]
fn cpus_follow_mask_bits() {
  let cpus = cpu_assignments(0b1010_0101, 4).unwrap();
  assert!(cpus == vec![0, 2, 5, 7], "got {:?}", cpus);
}

#[test]
fn cpus_wrap_when_oversubscribed() {
  let cpus = cpu_assignments(0x55555 & 0xff, 6).unwrap();
  assert!(cpus == vec![0, 2, 4, 6, 0, 2], "got {:?}", cpus);
  assert!(mask_population(0x55555 & 0xff) == 4);
}

#[test]
fn empty_mask_has_no_cpus() {
  assert!(cpu_assignments(0, 3).is_none());
  assert!(cpu_assignments(1 << 63, 1).unwrap() == vec![63]);
}
