use std::sync::{Arc, Mutex};

use kestrel_virtio::mmio::{MmioTransport, VIRTIO_MMIO_INT_CONFIG, VIRTIO_MMIO_INT_VRING};
use kestrel_virtio::pci::{
    PciTransport, VIRTIO_MSI_NO_VECTOR, VIRTIO_PCI_DEVICE_ID_BASE, VIRTIO_PCI_ISR_CONFIG,
    VIRTIO_PCI_ISR_QUEUE,
};
use kestrel_virtio::transport::{
    BindError, DeviceInfo, IrqLog, IrqSink, TransportKind, VirtioDevice,
};

/// Cloneable sink so tests can inspect interrupts after handing the box to a
/// device.
#[derive(Clone, Default)]
struct SharedIrq {
    inner: Arc<Mutex<IrqLog>>,
}

impl SharedIrq {
    fn log(&self) -> IrqLog {
        self.inner.lock().unwrap().clone()
    }
}

impl IrqSink for SharedIrq {
    fn raise_irq(&mut self) {
        self.inner.lock().unwrap().raise_irq();
    }

    fn lower_irq(&mut self) {
        self.inner.lock().unwrap().lower_irq();
    }

    fn signal_msix(&mut self, vector: u16) {
        self.inner.lock().unwrap().signal_msix(vector);
    }
}

fn blk_info() -> DeviceInfo {
    DeviceInfo {
        device_type: 2,
        subsys_id: 2,
        class: 0x010000,
        queue_count: 1,
    }
}

#[test]
fn binds_pci_and_installs_ops_once() {
    let mut dev = VirtioDevice::new();
    assert!(!dev.is_bound());

    dev.bind(TransportKind::Pci, &blk_info(), Box::new(IrqLog::default()))
        .unwrap();
    assert!(dev.is_bound());
    assert_eq!(dev.transport_kind(), Some(TransportKind::Pci));

    let pci = dev.transport_as::<PciTransport>().unwrap();
    assert_eq!(pci.device_id(), VIRTIO_PCI_DEVICE_ID_BASE + 2);
    assert_eq!(pci.subsys_id(), 2);
    assert_eq!(pci.class(), 0x010000);

    // The table is installed once; a second bind must not replace it.
    let err = dev
        .bind(TransportKind::Mmio, &blk_info(), Box::new(IrqLog::default()))
        .unwrap_err();
    assert!(matches!(err, BindError::AlreadyBound(TransportKind::Pci)));
    assert_eq!(dev.transport_kind(), Some(TransportKind::Pci));
}

#[test]
fn unsupported_transport_leaves_device_unbound() {
    let mut dev = VirtioDevice::new();
    let err = dev
        .bind(TransportKind::Ccw, &blk_info(), Box::new(IrqLog::default()))
        .unwrap_err();
    assert!(matches!(
        err,
        BindError::UnsupportedTransport(TransportKind::Ccw)
    ));
    assert!(!dev.is_bound());
    assert!(dev.transport().is_none());
}

#[test]
fn allocation_failure_leaves_device_unbound() {
    // A queue-state table this large cannot be reserved; the bind must fail
    // cleanly with nothing installed.
    let info = DeviceInfo {
        queue_count: usize::MAX,
        ..blk_info()
    };

    for kind in [TransportKind::Pci, TransportKind::Mmio] {
        let mut dev = VirtioDevice::new();
        let err = dev
            .bind(kind, &info, Box::new(IrqLog::default()))
            .unwrap_err();
        assert!(matches!(err, BindError::OutOfMemory(k) if k == kind));
        assert!(!dev.is_bound());
    }
}

#[test]
fn transport_kind_names_match_config_spelling() {
    assert_eq!(TransportKind::Pci.name(), "pci");
    assert_eq!(TransportKind::Mmio.name(), "mmio");
    assert_eq!(TransportKind::Ccw.name(), "ccw");
}

#[test]
fn pci_signal_routes_to_msix_when_vector_assigned() {
    let sink = SharedIrq::default();
    let mut dev = VirtioDevice::new();
    dev.bind(TransportKind::Pci, &blk_info(), Box::new(sink.clone()))
        .unwrap();

    let pci = dev.transport_as_mut::<PciTransport>().unwrap();
    pci.set_queue_vector(0, 3);
    pci.set_config_vector(7);

    dev.signal_vq(0);
    dev.signal_config();

    let log = sink.log();
    assert_eq!(log.msix_vectors, [3, 7]);
    assert_eq!(log.raised, 0);

    let pci = dev.transport_as::<PciTransport>().unwrap();
    assert_eq!(
        pci.isr_status(),
        VIRTIO_PCI_ISR_QUEUE | VIRTIO_PCI_ISR_CONFIG
    );
}

#[test]
fn pci_signal_falls_back_to_level_irq_without_vector() {
    let sink = SharedIrq::default();
    let mut dev = VirtioDevice::new();
    dev.bind(TransportKind::Pci, &blk_info(), Box::new(sink.clone()))
        .unwrap();

    assert_eq!(
        dev.transport_as::<PciTransport>().unwrap().queue_vector(0),
        VIRTIO_MSI_NO_VECTOR
    );

    dev.signal_vq(0);
    dev.signal_vq(0);
    // Level-triggered: one assertion until the guest reads the ISR.
    assert_eq!(sink.log().raised, 1);

    let pci = dev.transport_as_mut::<PciTransport>().unwrap();
    assert_eq!(pci.read_isr(), VIRTIO_PCI_ISR_QUEUE);
    assert_eq!(pci.read_isr(), 0); // read clears
    assert_eq!(sink.log().lowered, 1);

    // The next completion re-raises the line.
    dev.signal_vq(0);
    assert_eq!(sink.log().raised, 2);
}

#[test]
fn mmio_interrupt_status_accumulates_and_acks() {
    let sink = SharedIrq::default();
    let mut dev = VirtioDevice::new();
    dev.bind(TransportKind::Mmio, &blk_info(), Box::new(sink.clone()))
        .unwrap();

    dev.signal_vq(0);
    dev.signal_config();

    let mmio = dev.transport_as_mut::<MmioTransport>().unwrap();
    assert_eq!(
        mmio.interrupt_status(),
        VIRTIO_MMIO_INT_VRING | VIRTIO_MMIO_INT_CONFIG
    );
    assert_eq!(sink.log().raised, 1);

    // Partial ack keeps the line up.
    mmio.ack(VIRTIO_MMIO_INT_VRING);
    assert_eq!(mmio.interrupt_status(), VIRTIO_MMIO_INT_CONFIG);
    assert_eq!(sink.log().lowered, 0);

    mmio.ack(VIRTIO_MMIO_INT_CONFIG);
    assert_eq!(mmio.interrupt_status(), 0);
    assert_eq!(sink.log().lowered, 1);
}

#[test]
fn mmio_tracks_queue_ready_state() {
    let mut dev = VirtioDevice::new();
    let info = DeviceInfo {
        queue_count: 2,
        ..blk_info()
    };
    dev.bind(TransportKind::Mmio, &info, Box::new(IrqLog::default()))
        .unwrap();

    let mmio = dev.transport_as_mut::<MmioTransport>().unwrap();
    assert_eq!(mmio.device_type(), 2);
    assert!(!mmio.queue_ready(0));
    mmio.set_queue_ready(1, true);
    assert!(mmio.queue_ready(1));
    // Out-of-range queues read as not ready and are ignored on write.
    mmio.set_queue_ready(9, true);
    assert!(!mmio.queue_ready(9));
}

#[test]
fn unbind_runs_exit_and_releases_the_transport() {
    let sink = SharedIrq::default();
    let mut dev = VirtioDevice::new();
    dev.bind(TransportKind::Pci, &blk_info(), Box::new(sink.clone()))
        .unwrap();

    dev.signal_vq(0); // line goes up
    dev.unbind();
    assert!(!dev.is_bound());
    assert_eq!(sink.log().lowered, 1);

    // Signalling an unbound device is a no-op, and the handle can be bound
    // again.
    dev.signal_vq(0);
    assert_eq!(sink.log().raised, 1);
    dev.bind(TransportKind::Mmio, &blk_info(), Box::new(sink.clone()))
        .unwrap();
    assert_eq!(dev.transport_kind(), Some(TransportKind::Mmio));
}

#[test]
fn dropping_a_bound_device_releases_the_line() {
    let sink = SharedIrq::default();
    {
        let mut dev = VirtioDevice::new();
        dev.bind(TransportKind::Mmio, &blk_info(), Box::new(sink.clone()))
            .unwrap();
        dev.signal_vq(0);
        assert_eq!(sink.log().raised, 1);
    }
    assert_eq!(sink.log().lowered, 1);
}
