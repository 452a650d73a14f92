//! Fixed-capacity slab pool over a caller-supplied memory region.
//!
//! `shmslab` carves a pre-existing, size-bounded extent — typically a
//! shared-memory segment visible to several processes — into power-of-two
//! chunks, the way a heap allocator carves address space, but without ever
//! asking the OS for more. All allocator state (page descriptors, size-class
//! directory, statistics) lives inside the region itself, addressed by
//! offsets, so independent processes may attach the same region at
//! different base addresses.
//!
//! The pool performs no locking of its own: mutating methods on
//! [`SlabPool`] take `&mut self` and expect the caller's external lock;
//! [`SharedSlabPool`] supplies a process-local mutex for the common
//! single-process case.
//!
//! ```no_run
//! use shmslab::{MappedRegion, PoolConfig, SlabPool};
//!
//! let region = MappedRegion::new(1 << 20)?;
//! let mut pool =
//!     unsafe { SlabPool::init(region.base(), region.len(), &PoolConfig::default()) }?;
//!
//! let p = pool.alloc(100)?;
//! pool.free(p)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#[cfg(not(target_pointer_width = "64"))]
compile_error!("shmslab supports only 64-bit targets.");

pub mod slab;

// pool types
pub use slab::pool::{PoolConfig, SharedSlabPool, SlabPool};

// backing-region helper
pub use slab::region::{MappedRegion, RegionError, os_page_size};

// errors/diagnostics
pub use slab::diag::{DiagnosticSink, Severity, SlabError};

// observability
pub use slab::stats::{ClassStats, PoolUsage};
