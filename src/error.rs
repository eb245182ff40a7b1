use std::io;

use thiserror::Error;

/// Why an allocator could not hand out memory.
#[derive(Debug, Error)]
pub enum AllocFailure {
  #[error("no free block can hold {requested} bytes")]
  NoMem { requested: usize },
  #[error("{requested} bytes will never fit into an arena of {capacity} usable bytes")]
  WontFit { requested: usize, capacity: usize },
  #[error("failed to reserve {size} bytes for NUMA node {node}")]
  Reserve {
    size: usize,
    node: usize,
    #[source]
    source: io::Error,
  },
}

/// Why a task could not be submitted.
#[derive(Debug, Error)]
pub enum SpawnError {
  #[error("task pool is shutting down")]
  ShutDown,
  #[error("failed to allocate a coroutine stack of {stack_size} bytes")]
  Stack { stack_size: usize },
  #[error("task is not running inside a task pool")]
  Detached,
}

/// Construction-time failures of pools and executor groups.
#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid configuration: {0}")]
  Config(String),
  #[error(transparent)]
  Alloc(#[from] AllocFailure),
  #[error(transparent)]
  Spawn(#[from] SpawnError),
  #[error("failed to start thread {name}")]
  Thread {
    name: String,
    #[source]
    source: io::Error,
  },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
