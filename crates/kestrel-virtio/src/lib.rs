//! Virtio split-ring transport core.
//!
//! This crate is the data plane between guest drivers and Kestrel device
//! backends: it walks guest-supplied descriptor rings ([`queue`]), publishes
//! completions back with the memory ordering the lock-free guest consumer
//! relies on, decides when the guest actually needs an interrupt, and binds a
//! device handle to one of the supported register transports ([`transport`]).
//!
//! Ring memory is shared with an untrusted, concurrently running guest. All
//! indices and lengths read from it are validated before use, and every
//! multi-byte ring field goes through the per-queue byte-order adapter in
//! [`endian`].

pub mod endian;
pub mod mmio;
pub mod pci;
pub mod queue;
pub mod transport;
