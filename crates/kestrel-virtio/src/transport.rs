//! Transport-agnostic device handle and transport binding.
//!
//! A [`VirtioDevice`] starts unbound. Attach code calls
//! [`VirtioDevice::bind`] once with the transport kind the machine config
//! selected; the matching variant ([`PciTransport`](crate::pci::PciTransport)
//! or [`MmioTransport`](crate::mmio::MmioTransport)) is allocated, installed
//! as the device's operations table, and initialized. The ring logic in
//! [`queue`](crate::queue) never depends on which variant is installed.

use core::any::Any;
use core::fmt;

use thiserror::Error;

use crate::mmio::MmioTransport;
use crate::pci::PciTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Pci,
    Mmio,
    /// Channel I/O (s390). Recognized so configs can name it, but no variant
    /// is implemented here; binding it fails with
    /// [`BindError::UnsupportedTransport`].
    Ccw,
}

impl TransportKind {
    pub fn name(self) -> &'static str {
        match self {
            TransportKind::Pci => "pci",
            TransportKind::Mmio => "mmio",
            TransportKind::Ccw => "ccw",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum BindError {
    #[error("out of memory allocating {0} transport state")]
    OutOfMemory(TransportKind),
    #[error("unsupported virtio transport: {0}")]
    UnsupportedTransport(TransportKind),
    #[error("device is already bound to a {0} transport")]
    AlreadyBound(TransportKind),
}

/// Identity and sizing for one device instance, supplied by attach code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Virtio device type (1 = net, 2 = blk, ...).
    pub device_type: u16,
    pub subsys_id: u16,
    pub class: u32,
    /// Number of virtqueues the transport tracks state for.
    pub queue_count: usize,
}

/// Sink for interrupts produced on behalf of a virtio device. Injected at
/// bind time; the concrete end is the machine's interrupt wiring.
pub trait IrqSink {
    fn raise_irq(&mut self);
    fn lower_irq(&mut self);
    fn signal_msix(&mut self, vector: u16);
}

/// Recording [`IrqSink`] for tests and wiring bring-up.
#[derive(Debug, Default, Clone)]
pub struct IrqLog {
    pub raised: u64,
    pub lowered: u64,
    pub msix_vectors: Vec<u16>,
}

impl IrqSink for IrqLog {
    fn raise_irq(&mut self) {
        self.raised += 1;
    }

    fn lower_irq(&mut self) {
        self.lowered += 1;
    }

    fn signal_msix(&mut self, vector: u16) {
        self.msix_vectors.push(vector);
    }
}

/// The per-transport operations a bound device exposes. Selected once at
/// bind time and never swapped afterwards.
pub trait VirtioTransport {
    fn kind(&self) -> TransportKind;

    /// Variant-specific setup, run by [`VirtioDevice::bind`] right after the
    /// variant is installed.
    fn init(&mut self, info: &DeviceInfo);

    /// Variant-specific teardown, run by [`VirtioDevice::unbind`].
    fn exit(&mut self);

    /// Delivers a completion notification for one virtqueue.
    fn signal_vq(&mut self, queue: u16);

    /// Delivers a configuration-change notification.
    fn signal_config(&mut self);

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Transport-agnostic handle for one emulated virtio device.
///
/// Owns its transport state for the whole device lifetime; dropping the
/// handle (or calling [`unbind`](Self::unbind)) releases it exactly once.
#[derive(Default)]
pub struct VirtioDevice {
    transport: Option<Box<dyn VirtioTransport>>,
}

impl VirtioDevice {
    pub fn new() -> Self {
        Self { transport: None }
    }

    /// Binds the device to `kind`, allocating and initializing the variant's
    /// private state. On any error the handle is left exactly as it was: no
    /// transport installed, nothing partially initialized.
    pub fn bind(
        &mut self,
        kind: TransportKind,
        info: &DeviceInfo,
        sink: Box<dyn IrqSink>,
    ) -> Result<(), BindError> {
        if let Some(bound) = &self.transport {
            return Err(BindError::AlreadyBound(bound.kind()));
        }

        let mut transport: Box<dyn VirtioTransport> = match kind {
            TransportKind::Pci => Box::new(PciTransport::allocate(info.queue_count, sink)?),
            TransportKind::Mmio => Box::new(MmioTransport::allocate(info.queue_count, sink)?),
            TransportKind::Ccw => return Err(BindError::UnsupportedTransport(kind)),
        };
        transport.init(info);
        self.transport = Some(transport);
        Ok(())
    }

    /// Runs the transport's `exit` and releases its state. Idempotent.
    pub fn unbind(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.exit();
        }
    }

    pub fn is_bound(&self) -> bool {
        self.transport.is_some()
    }

    pub fn transport_kind(&self) -> Option<TransportKind> {
        self.transport.as_ref().map(|t| t.kind())
    }

    pub fn transport(&self) -> Option<&dyn VirtioTransport> {
        self.transport.as_deref()
    }

    pub fn transport_mut(&mut self) -> Option<&mut (dyn VirtioTransport + 'static)> {
        self.transport.as_deref_mut()
    }

    /// Downcasts the bound transport to its concrete variant.
    pub fn transport_as<T: VirtioTransport + 'static>(&self) -> Option<&T> {
        self.transport.as_deref()?.as_any().downcast_ref::<T>()
    }

    pub fn transport_as_mut<T: VirtioTransport + 'static>(&mut self) -> Option<&mut T> {
        self.transport
            .as_deref_mut()?
            .as_any_mut()
            .downcast_mut::<T>()
    }

    /// Forwards to the bound transport; a no-op on an unbound handle.
    pub fn signal_vq(&mut self, queue: u16) {
        if let Some(transport) = self.transport.as_deref_mut() {
            transport.signal_vq(queue);
        }
    }

    pub fn signal_config(&mut self) {
        if let Some(transport) = self.transport.as_deref_mut() {
            transport.signal_config();
        }
    }
}

impl Drop for VirtioDevice {
    fn drop(&mut self) {
        self.unbind();
    }
}
