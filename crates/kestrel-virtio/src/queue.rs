//! Split-virtqueue data plane: available-ring consumption, descriptor-chain
//! traversal, used-ring publication, and notification suppression.
//!
//! The rings live in guest memory and are shared with a concurrently running,
//! untrusted guest driver. The guest is the sole producer of the available
//! ring and sole consumer of the used ring; the host is the inverse. There
//! are no locks on this path — correctness rests on the fence placement in
//! [`VirtQueue::push_used`] and on single-writer-per-field discipline. The
//! publisher is not synchronized against itself: a queue must only ever be
//! processed by one host thread at a time.

use std::num::Wrapping;
use std::sync::atomic::{fence, Ordering};

use kestrel_mem::GuestMemory;
use log::error;
use thiserror::Error;

use crate::endian::RingByteOrder;

pub const VIRTQ_DESC_F_NEXT: u16 = 0x1;
pub const VIRTQ_DESC_F_WRITE: u16 = 0x2;
pub const VIRTQ_DESC_F_INDIRECT: u16 = 0x4;

/// Bit 0 of `avail.flags`: the driver does not want completion interrupts.
/// Only consulted when `VIRTIO_F_RING_EVENT_IDX` was not negotiated.
pub const VRING_AVAIL_F_NO_INTERRUPT: u16 = 0x1;

/// Hard ceiling on fragments collected from a single chain, direct or
/// indirect. A well-formed chain never revisits a descriptor, so any walk
/// longer than the table it runs in is a cycle; the ceiling also bounds the
/// work a huge indirect table can demand from one head.
pub const MAX_CHAIN_LEN: usize = 1024;

const DESC_SIZE: u64 = 16;
const AVAIL_RING_HDR: u64 = 4; // flags + idx
const AVAIL_ELEM_SIZE: u64 = 2;
const USED_RING_HDR: u64 = 4; // flags + idx
const USED_ELEM_SIZE: u64 = 8; // id + len

#[derive(Debug, Error)]
pub enum VirtQueueError {
    #[error("queue size {0} is not a non-zero power of two")]
    BadSize(u16),
    #[error("available ring index ran {pending} entries ahead of a queue of {size}")]
    BadAvailIndex { pending: u16, size: u16 },
    #[error("descriptor index {index} out of range (table holds {max})")]
    BadDescriptorIndex { index: u16, max: u32 },
    #[error("descriptor chain exceeds {max} fragments")]
    ChainTooLong { max: usize },
    #[error("invalid indirect descriptor table: {0}")]
    BadIndirect(&'static str),
    #[error("descriptor buffer out of bounds: addr=0x{addr:x} len={len}")]
    DescriptorOutOfBounds { addr: u64, len: u32 },
    #[error("guest address arithmetic overflowed")]
    AddressOverflow,
    #[error(transparent)]
    Memory(#[from] kestrel_mem::GuestMemoryError),
}

/// One entry of the wire descriptor table: 16 bytes, untrusted guest input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl Descriptor {
    /// The device may write to this buffer; the guest will read it back.
    #[inline]
    pub fn is_write_only(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }

    #[inline]
    pub fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }

    #[inline]
    pub fn is_indirect(&self) -> bool {
        self.flags & VIRTQ_DESC_F_INDIRECT != 0
    }
}

/// A fully walked descriptor chain: the head index the guest posted plus the
/// buffer fragments in chain-traversal order. Backends depend on that order
/// matching the guest's intended buffer order, so it is never resorted; the
/// [`readable`](DescChain::readable) / [`writable`](DescChain::writable)
/// views filter without reordering.
#[derive(Debug, Clone)]
pub struct DescChain {
    head_index: u16,
    descs: Vec<Descriptor>,
}

impl DescChain {
    pub fn head_index(&self) -> u16 {
        self.head_index
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descs
    }

    /// Fragments the device reads from (guest-filled).
    pub fn readable(&self) -> impl Iterator<Item = &Descriptor> {
        self.descs.iter().filter(|d| !d.is_write_only())
    }

    /// Fragments the device writes into (guest-readable afterwards).
    pub fn writable(&self) -> impl Iterator<Item = &Descriptor> {
        self.descs.iter().filter(|d| d.is_write_only())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtQueueConfig {
    pub size: u16,
    pub desc_addr: u64,
    pub avail_addr: u64,
    pub used_addr: u64,
}

/// Host-side view of one guest/host ring pair.
#[derive(Debug)]
pub struct VirtQueue {
    size: u16,
    desc_addr: u64,
    avail_addr: u64,
    used_addr: u64,
    order: RingByteOrder,
    event_idx: bool,
    next_avail: Wrapping<u16>,
    /// Used index last reported to the guest via a delivered notification.
    /// Never regresses; only advanced when [`should_signal`](Self::should_signal)
    /// decides to interrupt.
    last_used_signalled: Wrapping<u16>,
}

fn offset(addr: u64, off: u64) -> Result<u64, VirtQueueError> {
    addr.checked_add(off).ok_or(VirtQueueError::AddressOverflow)
}

impl VirtQueue {
    pub fn new(
        config: VirtQueueConfig,
        order: RingByteOrder,
        event_idx: bool,
    ) -> Result<Self, VirtQueueError> {
        if config.size == 0 || !config.size.is_power_of_two() {
            return Err(VirtQueueError::BadSize(config.size));
        }
        Ok(Self {
            size: config.size,
            desc_addr: config.desc_addr,
            avail_addr: config.avail_addr,
            used_addr: config.used_addr,
            order,
            event_idx,
            next_avail: Wrapping(0),
            last_used_signalled: Wrapping(0),
        })
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn event_idx(&self) -> bool {
        self.event_idx
    }

    /// Toggled after feature negotiation settles.
    pub fn set_event_idx(&mut self, enabled: bool) {
        self.event_idx = enabled;
    }

    pub fn byte_order(&self) -> RingByteOrder {
        self.order
    }

    pub fn last_used_signalled(&self) -> u16 {
        self.last_used_signalled.0
    }

    /// Clears the host-private cursors (device reset path). Ring memory is
    /// guest-owned and left untouched.
    pub fn reset(&mut self) {
        self.next_avail = Wrapping(0);
        self.last_used_signalled = Wrapping(0);
    }

    /// Checks that all three rings fit inside guest memory. Called once after
    /// the driver programs the ring addresses; per-access bounds checks still
    /// apply afterwards.
    pub fn is_valid(&self, mem: &dyn GuestMemory) -> bool {
        let size = u64::from(self.size);
        let regions = [
            ("descriptor table", self.desc_addr, DESC_SIZE * size),
            (
                "available ring",
                self.avail_addr,
                AVAIL_RING_HDR + AVAIL_ELEM_SIZE * size + 2,
            ),
            (
                "used ring",
                self.used_addr,
                USED_RING_HDR + USED_ELEM_SIZE * size + 2,
            ),
        ];
        for (name, addr, len) in regions {
            let fits = addr
                .checked_add(len)
                .map(|end| end <= mem.size())
                .unwrap_or(false);
            if !fits {
                error!("virtqueue {name} out of bounds: addr=0x{addr:x} len={len}");
                return false;
            }
        }
        true
    }

    #[inline]
    fn mask(&self, index: u16) -> u64 {
        u64::from(index & (self.size - 1))
    }

    fn read_ring_u16(&self, mem: &dyn GuestMemory, addr: u64) -> Result<u16, VirtQueueError> {
        let mut buf = [0u8; 2];
        mem.read_into(addr, &mut buf)?;
        Ok(self.order.to_host_u16(u16::from_ne_bytes(buf)))
    }

    fn write_ring_u16(
        &self,
        mem: &mut dyn GuestMemory,
        addr: u64,
        value: u16,
    ) -> Result<(), VirtQueueError> {
        let raw = self.order.to_guest_u16(value).to_ne_bytes();
        mem.write_from(addr, &raw)?;
        Ok(())
    }

    fn read_ring_u32(&self, mem: &dyn GuestMemory, addr: u64) -> Result<u32, VirtQueueError> {
        let mut buf = [0u8; 4];
        mem.read_into(addr, &mut buf)?;
        Ok(self.order.to_host_u32(u32::from_ne_bytes(buf)))
    }

    fn write_ring_u32(
        &self,
        mem: &mut dyn GuestMemory,
        addr: u64,
        value: u32,
    ) -> Result<(), VirtQueueError> {
        let raw = self.order.to_guest_u32(value).to_ne_bytes();
        mem.write_from(addr, &raw)?;
        Ok(())
    }

    fn read_ring_u64(&self, mem: &dyn GuestMemory, addr: u64) -> Result<u64, VirtQueueError> {
        let mut buf = [0u8; 8];
        mem.read_into(addr, &mut buf)?;
        Ok(self.order.to_host_u64(u64::from_ne_bytes(buf)))
    }

    fn read_desc(
        &self,
        mem: &dyn GuestMemory,
        table: u64,
        index: u16,
    ) -> Result<Descriptor, VirtQueueError> {
        let base = offset(table, u64::from(index) * DESC_SIZE)?;
        Ok(Descriptor {
            addr: self.read_ring_u64(mem, base)?,
            len: self.read_ring_u32(mem, offset(base, 8)?)?,
            flags: self.read_ring_u16(mem, offset(base, 12)?)?,
            next: self.read_ring_u16(mem, offset(base, 14)?)?,
        })
    }

    fn avail_idx(&self, mem: &dyn GuestMemory) -> Result<Wrapping<u16>, VirtQueueError> {
        Ok(Wrapping(
            self.read_ring_u16(mem, offset(self.avail_addr, 2)?)?,
        ))
    }

    fn used_idx(&self, mem: &dyn GuestMemory) -> Result<Wrapping<u16>, VirtQueueError> {
        Ok(Wrapping(
            self.read_ring_u16(mem, offset(self.used_addr, 2)?)?,
        ))
    }

    /// Removes the next pending head index from the available ring, or
    /// returns `None` when the guest has posted nothing new.
    pub fn pop_head(&mut self, mem: &dyn GuestMemory) -> Result<Option<u16>, VirtQueueError> {
        let avail_idx = self.avail_idx(mem)?;
        let pending = (avail_idx - self.next_avail).0;
        if pending == 0 {
            return Ok(None);
        }
        if pending > self.size {
            error!(
                "available ring index 0x{:x} ran ahead of cursor 0x{:x} by more than the queue size",
                avail_idx.0, self.next_avail.0
            );
            return Err(VirtQueueError::BadAvailIndex {
                pending,
                size: self.size,
            });
        }

        // Pair with the guest's release store of `avail.idx`: the ring entry
        // it published must be visible before we read it.
        fence(Ordering::Acquire);

        let slot = offset(
            self.avail_addr,
            AVAIL_RING_HDR + AVAIL_ELEM_SIZE * self.mask(self.next_avail.0),
        )?;
        let head = self.read_ring_u16(mem, slot)?;
        self.next_avail += Wrapping(1);
        Ok(Some(head))
    }

    /// Steps the available-ring cursor back one entry so the last popped head
    /// is produced again. For callers that could not consume the chain.
    pub fn undo_pop(&mut self) {
        self.next_avail -= Wrapping(1);
    }

    /// Walks the chain starting at `head_index`, resolving at most one level
    /// of indirection, and returns the buffer fragments in traversal order.
    ///
    /// Everything read here is untrusted: `next` links are bounds-checked
    /// against the table they index, every buffer must lie inside guest
    /// memory, and the total fragment count is capped, so a hostile chain
    /// (cycle, out-of-range link, oversized indirect table) fails the one
    /// request and leaves the queue usable.
    pub fn walk(
        &self,
        mem: &dyn GuestMemory,
        head_index: u16,
    ) -> Result<DescChain, VirtQueueError> {
        let mut table = self.desc_addr;
        let mut max = u32::from(self.size);
        if u32::from(head_index) >= max {
            return Err(VirtQueueError::BadDescriptorIndex {
                index: head_index,
                max,
            });
        }

        let mut desc = self.read_desc(mem, table, head_index)?;
        if desc.is_indirect() {
            if desc.len == 0 || u64::from(desc.len) % DESC_SIZE != 0 {
                return Err(VirtQueueError::BadIndirect(
                    "table length is not a non-zero multiple of the descriptor size",
                ));
            }
            let end = offset(desc.addr, u64::from(desc.len))?;
            if end > mem.size() {
                return Err(VirtQueueError::BadIndirect("table outside guest memory"));
            }
            table = desc.addr;
            max = desc.len / DESC_SIZE as u32;
            desc = self.read_desc(mem, table, 0)?;
        }

        let cap = (max as usize).min(MAX_CHAIN_LEN);
        let mut descs = Vec::new();
        loop {
            if desc.is_indirect() {
                // Only one level of indirection is honored.
                return Err(VirtQueueError::BadIndirect("nested indirect descriptor"));
            }
            let end = offset(desc.addr, u64::from(desc.len))?;
            if end > mem.size() {
                return Err(VirtQueueError::DescriptorOutOfBounds {
                    addr: desc.addr,
                    len: desc.len,
                });
            }
            if descs.len() == cap {
                error!("descriptor chain at head {head_index} exceeds {cap} fragments; dropping");
                return Err(VirtQueueError::ChainTooLong { max: cap });
            }
            descs.push(desc);

            if !desc.has_next() {
                break;
            }
            let next = desc.next;
            if u32::from(next) >= max {
                return Err(VirtQueueError::BadDescriptorIndex { index: next, max });
            }
            desc = self.read_desc(mem, table, next)?;
        }

        Ok(DescChain {
            head_index,
            descs,
        })
    }

    /// [`pop_head`](Self::pop_head) plus [`walk`](Self::walk).
    pub fn pop_chain(
        &mut self,
        mem: &dyn GuestMemory,
    ) -> Result<Option<DescChain>, VirtQueueError> {
        match self.pop_head(mem)? {
            Some(head) => self.walk(mem, head).map(Some),
            None => Ok(None),
        }
    }

    /// Publishes one completion: writes `{id, len}` into the next used-ring
    /// slot and advances `used.idx`. Returns the ring slot written.
    ///
    /// The two fences are load-bearing. The guest's consumer loop is
    /// lock-free and polls `used.idx`; it must never observe the bumped index
    /// before the element it exposes, and the bumped index must be visible
    /// before any notification derived from it reaches the guest.
    pub fn push_used(
        &mut self,
        mem: &mut dyn GuestMemory,
        head_index: u16,
        len: u32,
    ) -> Result<u16, VirtQueueError> {
        if head_index >= self.size {
            error!("refusing to publish out-of-range descriptor head {head_index}");
            return Err(VirtQueueError::BadDescriptorIndex {
                index: head_index,
                max: u32::from(self.size),
            });
        }

        let idx = self.used_idx(mem)?;
        let slot = idx.0 & (self.size - 1);
        let elem = offset(
            self.used_addr,
            USED_RING_HDR + USED_ELEM_SIZE * u64::from(slot),
        )?;
        self.write_ring_u32(mem, elem, u32::from(head_index))?;
        self.write_ring_u32(mem, offset(elem, 4)?, len)?;

        // The element must be visible before the index that exposes it.
        fence(Ordering::Release);
        self.write_ring_u16(mem, offset(self.used_addr, 2)?, (idx + Wrapping(1)).0)?;
        // And the index before any subsequent notification decision.
        fence(Ordering::SeqCst);

        Ok(slot)
    }

    /// Decides whether the guest must be interrupted for completions
    /// published since the last delivered notification.
    ///
    /// With `EVENT_IDX` negotiated this is the standard wrapped-interval
    /// test on the guest's `used_event` threshold; a positive answer commits
    /// by advancing `last_used_signalled`, so the caller must actually
    /// deliver the interrupt it asked about.
    pub fn should_signal(&mut self, mem: &dyn GuestMemory) -> Result<bool, VirtQueueError> {
        let new = self.used_idx(mem)?;

        if !self.event_idx {
            let flags = self.read_ring_u16(mem, self.avail_addr)?;
            let signal = flags & VRING_AVAIL_F_NO_INTERRUPT == 0;
            if signal {
                self.last_used_signalled = new;
            }
            return Ok(signal);
        }

        let old = self.last_used_signalled;
        let event_addr = offset(
            self.avail_addr,
            AVAIL_RING_HDR + AVAIL_ELEM_SIZE * u64::from(self.size),
        )?;
        let event = Wrapping(self.read_ring_u16(mem, event_addr)?);

        // vring_need_event(): signal iff `event` lies in [old, new) modulo
        // 2^16, i.e. the guest's threshold was crossed by this batch. Linear
        // comparison here would storm or stall across index wrap.
        if new - event - Wrapping(1) < new - old {
            self.last_used_signalled = new;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Publishes the host's available-ring cursor into the used ring's
    /// trailing `avail_event` field, letting an `EVENT_IDX` guest skip
    /// doorbell writes for work the host will already see.
    pub fn update_avail_event(&self, mem: &mut dyn GuestMemory) -> Result<(), VirtQueueError> {
        if !self.event_idx {
            return Ok(());
        }
        let addr = offset(
            self.used_addr,
            USED_RING_HDR + USED_ELEM_SIZE * u64::from(self.size),
        )?;
        self.write_ring_u16(mem, addr, self.next_avail.0)?;
        // Ordered before the caller's final empty-check of the available
        // ring: either the guest sees the new event value, or we see the
        // head it posted meanwhile.
        fence(Ordering::SeqCst);
        Ok(())
    }
}
