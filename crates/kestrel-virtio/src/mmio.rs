//! MMIO transport variant: a single interrupt line gated by the
//! `InterruptStatus` / `InterruptACK` register pair.

use core::any::Any;

use crate::transport::{BindError, DeviceInfo, IrqSink, TransportKind, VirtioTransport};

/// `InterruptStatus` bit 0: a used-ring buffer was published.
pub const VIRTIO_MMIO_INT_VRING: u8 = 0x01;
/// `InterruptStatus` bit 1: the device configuration changed.
pub const VIRTIO_MMIO_INT_CONFIG: u8 = 0x02;

pub struct MmioTransport {
    sink: Box<dyn IrqSink>,
    queue_ready: Vec<bool>,
    interrupt_status: u8,
    irq_asserted: bool,
    device_type: u16,
}

impl MmioTransport {
    pub(crate) fn allocate(
        queue_count: usize,
        sink: Box<dyn IrqSink>,
    ) -> Result<Self, BindError> {
        let mut queue_ready = Vec::new();
        queue_ready
            .try_reserve_exact(queue_count)
            .map_err(|_| BindError::OutOfMemory(TransportKind::Mmio))?;
        queue_ready.resize(queue_count, false);
        Ok(Self {
            sink,
            queue_ready,
            interrupt_status: 0,
            irq_asserted: false,
            device_type: 0,
        })
    }

    pub fn device_type(&self) -> u16 {
        self.device_type
    }

    pub fn interrupt_status(&self) -> u8 {
        self.interrupt_status
    }

    /// `QueueReady` register state, tracked per queue by the register
    /// emulation that wraps this transport.
    pub fn set_queue_ready(&mut self, queue: u16, ready: bool) {
        if let Some(slot) = self.queue_ready.get_mut(queue as usize) {
            *slot = ready;
        }
    }

    pub fn queue_ready(&self, queue: u16) -> bool {
        self.queue_ready.get(queue as usize).copied().unwrap_or(false)
    }

    /// `InterruptACK` write: clears the acknowledged bits and drops the line
    /// once nothing is pending.
    pub fn ack(&mut self, mask: u8) {
        self.interrupt_status &= !mask;
        if self.interrupt_status == 0 && self.irq_asserted {
            self.sink.lower_irq();
            self.irq_asserted = false;
        }
    }

    fn assert_status(&mut self, bit: u8) {
        self.interrupt_status |= bit;
        if !self.irq_asserted {
            self.sink.raise_irq();
            self.irq_asserted = true;
        }
    }
}

impl VirtioTransport for MmioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Mmio
    }

    fn init(&mut self, info: &DeviceInfo) {
        self.device_type = info.device_type;
    }

    fn exit(&mut self) {
        self.interrupt_status = 0;
        self.queue_ready.fill(false);
        if self.irq_asserted {
            self.sink.lower_irq();
            self.irq_asserted = false;
        }
    }

    fn signal_vq(&mut self, _queue: u16) {
        // One line for all queues; the guest reads `InterruptStatus` to tell
        // ring traffic from config changes.
        self.assert_status(VIRTIO_MMIO_INT_VRING);
    }

    fn signal_config(&mut self) {
        self.assert_status(VIRTIO_MMIO_INT_CONFIG);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
