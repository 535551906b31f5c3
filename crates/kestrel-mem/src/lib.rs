//! Guest physical memory for the Kestrel device-emulation stack.
//!
//! Device models never touch host memory directly; they go through the
//! [`GuestMemory`] trait, which maps already-validated guest physical
//! addresses onto host storage. [`DenseMemory`] is the contiguous backend
//! used by tests and small embedders.

mod phys;

pub use phys::{DenseMemory, GuestMemory, GuestMemoryError, GuestMemoryResult};
