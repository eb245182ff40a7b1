//! NUMA-aware cooperative task runtime.
//!
//! An [`ExecutorGroup`] ties together a pinned [`TaskPool`] of workers that
//! multiplex stackful coroutines, a node-local arena allocator and a launcher
//! thread. Tasks block on the primitives in [`sync`] without blocking their
//! worker.

#[cfg(not(target_os = "linux"))]
compile_error!("numa-exec relies on mmap, mbind, futex and sched_setaffinity and only builds on Linux");

mod utils;
mod futex;
pub mod error;
pub mod sys;
pub mod virt_mem;
pub mod arena;
pub mod arena_pool;
pub mod coroutine;
pub mod task_pool;
pub mod sync;
pub mod executor_group;

pub use arena::{Arena, ArenaConfig, ArenaStats, RawAlloc};
pub use arena_pool::{ArenaPool, PoolStats, SyncPool};
pub use coroutine::{Coroutine, Scheduler, Status, TaskContext};
pub use error::{AllocFailure, Error, Result, SpawnError};
pub use executor_group::{ExecutorGroup, GroupConfig, GroupHandle};
pub use sync::{Barrier, Event, Semaphore};
pub use task_pool::{PoolHandle, TaskPool, TaskPoolConfig, TaskStats};
pub use utils::cpu_assignments;
pub use virt_mem::{Placement, Region};
