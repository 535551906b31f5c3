//! PCI transport variant: MSI-X/INTx completion signalling and ISR state.
//!
//! The surrounding machine emulates the configuration space and BARs; this
//! variant owns only what the generic core needs from a PCI-attached device:
//! the per-queue interrupt routing, the ISR status byte, and the PCI device
//! id derived from the virtio device type.

use core::any::Any;

use crate::transport::{BindError, DeviceInfo, IrqSink, TransportKind, VirtioTransport};

pub const VIRTIO_PCI_VENDOR_ID: u16 = 0x1af4;

/// Modern virtio-pci device IDs: `0x1040 + <virtio device type>`.
pub const VIRTIO_PCI_DEVICE_ID_BASE: u16 = 0x1040;

pub const VIRTIO_PCI_ISR_QUEUE: u8 = 0x01;
pub const VIRTIO_PCI_ISR_CONFIG: u8 = 0x02;

/// "No MSI-X vector assigned"; completions fall back to the INTx line.
pub const VIRTIO_MSI_NO_VECTOR: u16 = 0xffff;

pub struct PciTransport {
    sink: Box<dyn IrqSink>,
    queue_vectors: Vec<u16>,
    config_vector: u16,
    isr_status: u8,
    irq_asserted: bool,
    device_id: u16,
    subsys_id: u16,
    class: u32,
}

impl PciTransport {
    pub(crate) fn allocate(
        queue_count: usize,
        sink: Box<dyn IrqSink>,
    ) -> Result<Self, BindError> {
        let mut queue_vectors = Vec::new();
        queue_vectors
            .try_reserve_exact(queue_count)
            .map_err(|_| BindError::OutOfMemory(TransportKind::Pci))?;
        queue_vectors.resize(queue_count, VIRTIO_MSI_NO_VECTOR);
        Ok(Self {
            sink,
            queue_vectors,
            config_vector: VIRTIO_MSI_NO_VECTOR,
            isr_status: 0,
            irq_asserted: false,
            device_id: 0,
            subsys_id: 0,
            class: 0,
        })
    }

    pub fn device_id(&self) -> u16 {
        self.device_id
    }

    pub fn subsys_id(&self) -> u16 {
        self.subsys_id
    }

    pub fn class(&self) -> u32 {
        self.class
    }

    pub fn set_queue_vector(&mut self, queue: u16, vector: u16) {
        if let Some(slot) = self.queue_vectors.get_mut(queue as usize) {
            *slot = vector;
        }
    }

    pub fn queue_vector(&self, queue: u16) -> u16 {
        self.queue_vectors
            .get(queue as usize)
            .copied()
            .unwrap_or(VIRTIO_MSI_NO_VECTOR)
    }

    pub fn set_config_vector(&mut self, vector: u16) {
        self.config_vector = vector;
    }

    /// ISR read semantics: returns the pending bits, clears them, and
    /// deasserts the INTx line.
    pub fn read_isr(&mut self) -> u8 {
        let isr = self.isr_status;
        self.isr_status = 0;
        if self.irq_asserted {
            self.sink.lower_irq();
            self.irq_asserted = false;
        }
        isr
    }

    pub fn isr_status(&self) -> u8 {
        self.isr_status
    }

    fn deliver(&mut self, vector: u16) {
        if vector != VIRTIO_MSI_NO_VECTOR {
            self.sink.signal_msix(vector);
        } else if !self.irq_asserted {
            // INTx is level-triggered; it stays up until the guest reads the
            // ISR register.
            self.sink.raise_irq();
            self.irq_asserted = true;
        }
    }
}

impl VirtioTransport for PciTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Pci
    }

    fn init(&mut self, info: &DeviceInfo) {
        self.device_id = VIRTIO_PCI_DEVICE_ID_BASE + info.device_type;
        self.subsys_id = info.subsys_id;
        self.class = info.class;
    }

    fn exit(&mut self) {
        self.isr_status = 0;
        if self.irq_asserted {
            self.sink.lower_irq();
            self.irq_asserted = false;
        }
    }

    fn signal_vq(&mut self, queue: u16) {
        self.isr_status |= VIRTIO_PCI_ISR_QUEUE;
        self.deliver(self.queue_vector(queue));
    }

    fn signal_config(&mut self) {
        self.isr_status |= VIRTIO_PCI_ISR_CONFIG;
        self.deliver(self.config_vector);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
