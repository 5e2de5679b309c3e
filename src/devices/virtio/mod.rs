//! Virtio device infrastructure.
//!
//! This module implements the device side of the virtio 1.x specification:
//! the MMIO transport, the virtqueue engine, and the devices built on top.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Guest                                   │
//! │   ┌─────────────────────────────────────────────────────────┐  │
//! │   │                  virtio Driver                          │  │
//! │   │   - Writes requests to descriptor ring                  │  │
//! │   │   - Updates available ring                              │  │
//! │   │   - Notifies device via MMIO write                      │  │
//! │   └─────────────────────────────────────────────────────────┘  │
//! └──────────────────────────┬──────────────────────────────────────┘
//!                            │ Shared Memory (virtqueue)
//! ┌──────────────────────────▼──────────────────────────────────────┐
//! │                         VMM                                     │
//! │   ┌─────────────────────────────────────────────────────────┐  │
//! │   │                 virtio Device                           │  │
//! │   │   - Reads requests from descriptor ring                 │  │
//! │   │   - Processes requests (packets, etc.)                  │  │
//! │   │   - Updates used ring, raises the IRQ line              │  │
//! │   └─────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # MMIO Transport
//!
//! We use the virtio-mmio transport (as opposed to PCI). The device appears
//! at a fixed memory address and is discovered via kernel command line:
//!
//! ```text
//! virtio_mmio.device=4K@0xd0000000:5
//! ```
//!
//! This tells Linux: "There's a 4KB virtio device at address 0xd0000000, IRQ 5"
//!
//! Reference: <https://docs.oasis-open.org/virtio/virtio/v1.1/virtio-v1.1.html>

pub mod net;
pub mod queue;
pub mod transport;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::guest::{GuestAccessError, GuestBus};
use queue::QueueHandle;

// ============================================================================
// MMIO Register Offsets (virtio-mmio v2)
// ============================================================================

/// Magic value register - always reads as "virt" (0x74726976).
pub const MMIO_MAGIC_VALUE: u64 = 0x000;

/// Version register - we implement version 2.
pub const MMIO_VERSION: u64 = 0x004;

/// Device type ID register.
pub const MMIO_DEVICE_ID: u64 = 0x008;

/// Vendor ID register.
pub const MMIO_VENDOR_ID: u64 = 0x00c;

/// Device features register (read).
pub const MMIO_DEVICE_FEATURES: u64 = 0x010;

/// Device features selection register (write).
pub const MMIO_DEVICE_FEATURES_SEL: u64 = 0x014;

/// Driver features register (write).
pub const MMIO_DRIVER_FEATURES: u64 = 0x020;

/// Driver features selection register (write).
pub const MMIO_DRIVER_FEATURES_SEL: u64 = 0x024;

/// Queue selection register (write).
pub const MMIO_QUEUE_SEL: u64 = 0x030;

/// Maximum queue size register (read).
pub const MMIO_QUEUE_NUM_MAX: u64 = 0x034;

/// Queue size register (write).
pub const MMIO_QUEUE_NUM: u64 = 0x038;

/// Legacy (virtio-mmio v1) guest page frame register. Not supported; a
/// write here means the driver fell back to the legacy transport.
pub const MMIO_QUEUE_PFN: u64 = 0x040;

/// Queue ready register (read/write).
pub const MMIO_QUEUE_READY: u64 = 0x044;

/// Queue notify register (write).
pub const MMIO_QUEUE_NOTIFY: u64 = 0x050;

/// Interrupt status register (read).
pub const MMIO_INTERRUPT_STATUS: u64 = 0x060;

/// Interrupt acknowledge register (write).
pub const MMIO_INTERRUPT_ACK: u64 = 0x064;

/// Device status register (read/write).
pub const MMIO_STATUS: u64 = 0x070;

/// Queue descriptor low address register (write).
pub const MMIO_QUEUE_DESC_LOW: u64 = 0x080;

/// Queue descriptor high address register (write).
pub const MMIO_QUEUE_DESC_HIGH: u64 = 0x084;

/// Queue driver (available) low address register (write).
pub const MMIO_QUEUE_DRIVER_LOW: u64 = 0x090;

/// Queue driver (available) high address register (write).
pub const MMIO_QUEUE_DRIVER_HIGH: u64 = 0x094;

/// Queue device (used) low address register (write).
pub const MMIO_QUEUE_DEVICE_LOW: u64 = 0x0a0;

/// Queue device (used) high address register (write).
pub const MMIO_QUEUE_DEVICE_HIGH: u64 = 0x0a4;

/// Shared memory region selection register (write).
pub const MMIO_SHM_SEL: u64 = 0x0ac;

/// Shared memory region length, low word (read).
pub const MMIO_SHM_LEN_LOW: u64 = 0x0b0;

/// Shared memory region length, high word (read).
pub const MMIO_SHM_LEN_HIGH: u64 = 0x0b4;

/// Shared memory region base, low word (read).
pub const MMIO_SHM_BASE_LOW: u64 = 0x0b8;

/// Shared memory region base, high word (read).
pub const MMIO_SHM_BASE_HIGH: u64 = 0x0bc;

/// Configuration atomicity counter (read).
pub const MMIO_CONFIG_GENERATION: u64 = 0x0fc;

/// Start of the device-specific configuration window.
pub const MMIO_CONFIG: u64 = 0x100;

// ============================================================================
// Magic and Version
// ============================================================================

/// Magic value "virt" (little-endian).
pub const VIRTIO_MMIO_MAGIC: u32 = 0x7472_6976;

/// MMIO version we support.
pub const VIRTIO_MMIO_VERSION: u32 = 2;

/// Our vendor ID (arbitrary, not registered).
pub const VIRTIO_VENDOR_ID: u32 = 0x0;

/// Device type ID for network cards.
pub const VIRTIO_ID_NET: u32 = 1;

// ============================================================================
// Device Status Flags
// ============================================================================

/// Guest has acknowledged the device.
pub const STATUS_ACKNOWLEDGE: u32 = 1;

/// Guest has loaded a driver.
pub const STATUS_DRIVER: u32 = 2;

/// Driver is ready.
pub const STATUS_DRIVER_OK: u32 = 4;

/// Feature negotiation complete.
pub const STATUS_FEATURES_OK: u32 = 8;

// ============================================================================
// Interrupt Status Bits
// ============================================================================

/// A virtqueue used-ring event.
pub const INT_VRING: u32 = 1 << 0;

/// The device configuration changed.
pub const INT_CONFIG: u32 = 1 << 1;

// ============================================================================
// Device-Independent Feature Bits
// ============================================================================

/// VIRTIO_F_VERSION_1 - the device conforms to virtio 1.x. Required for
/// virtio-mmio v2; bit 32 of the 64-bit feature word.
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

/// VIRTIO_RING_F_EVENT_IDX - each side publishes the ring index at which it
/// wants to be woken, enabling arbitrary interrupt suppression.
pub const VIRTIO_RING_F_EVENT_IDX: u64 = 1 << 29;

/// Errors raised by the virtio transport, queue engine, and devices.
#[derive(Error, Debug)]
pub enum VirtioError {
    #[error("guest memory access failed: {0}")]
    GuestAccess(#[from] GuestAccessError),

    #[error("unsupported MMIO access at offset {offset:#x} ({len} bytes)")]
    InvalidRegister { offset: u64, len: usize },

    #[error("queue {0} is not ready")]
    QueueNotReady(u16),

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(&'static str),

    #[error("unsupported GSO type {0}")]
    UnsupportedGso(u8),

    #[error("checksum region {start}+{offset} is outside the {len}-byte packet")]
    ChecksumRange { start: u16, offset: u16, len: usize },

    #[error("backend rejected the packet: {0}")]
    BackendFailure(String),

    #[error("device worker has exited")]
    WorkerGone,
}

/// Capability set a device plugs into the MMIO transport.
///
/// The transport owns the register file and queue configuration; the handler
/// owns device semantics. `on_enable` is invoked once feature negotiation
/// completes (`FEATURES_OK` written while every queue is ready) and hands
/// the device its negotiated features plus live queue handles; `on_disable`
/// is invoked on reset.
pub trait VirtioDeviceHandler: Send {
    /// Device type ID reported at `MMIO_DEVICE_ID`.
    fn device_id(&self) -> u32;

    /// Number of virtqueues the device exposes.
    fn num_queues(&self) -> u16;

    /// Maximum size of each virtqueue.
    fn max_queue_size(&self) -> u16;

    /// The 64-bit host feature word.
    fn device_features(&self) -> u64;

    /// Read from the device-specific configuration window. `offset` is
    /// relative to the window start; bytes beyond the window read as zero.
    fn read_config(&self, offset: u64, data: &mut [u8]);

    /// Write to the device-specific configuration window. Returns true if
    /// the device accepted the write (drives the config-change interrupt).
    fn write_config(&mut self, offset: u64, data: &[u8]) -> bool;

    /// Feature negotiation is complete; the device takes its queues and the
    /// interrupt line it will raise completions on.
    fn on_enable(
        &mut self,
        features: u64,
        queues: Vec<QueueHandle>,
        irq: Arc<InterruptLine>,
    ) -> Result<(), VirtioError>;

    /// The driver wrote `QUEUE_NOTIFY` for the given queue.
    fn on_notify(&mut self, queue: u16) -> Result<(), VirtioError>;

    /// The device is being reset.
    fn on_disable(&mut self);
}

/// Level-triggered interrupt line shared between a device worker and the
/// MMIO register file.
///
/// The worker sets status bits, the vCPU thread clears them via
/// `INTERRUPT_ACK`; whichever update flips the computed level owns the
/// `set_irq` call. The `level` mirror uses an atomic swap so exactly one
/// writer observes each transition.
pub struct InterruptLine {
    status: AtomicU32,
    level: AtomicBool,
    line: u32,
    bus: Arc<dyn GuestBus>,
}

impl InterruptLine {
    pub fn new(bus: Arc<dyn GuestBus>, line: u32) -> Self {
        Self {
            status: AtomicU32::new(0),
            level: AtomicBool::new(false),
            line,
            bus,
        }
    }

    /// OR the given bits into the interrupt status.
    pub fn raise(&self, bits: u32) {
        self.status.fetch_or(bits, Ordering::SeqCst);
        self.update_line();
    }

    /// Clear the given bits (INTERRUPT_ACK semantics).
    pub fn ack(&self, bits: u32) {
        self.status.fetch_and(!bits, Ordering::SeqCst);
        self.update_line();
    }

    /// Drop all pending interrupts (device reset).
    pub fn clear(&self) {
        self.status.store(0, Ordering::SeqCst);
        self.update_line();
    }

    /// Reinstate a snapshotted status word and re-arm the line.
    pub fn restore(&self, status: u32) {
        self.status.store(status, Ordering::SeqCst);
        self.update_line();
    }

    pub fn status(&self) -> u32 {
        self.status.load(Ordering::SeqCst)
    }

    /// IRQ line number this device was allocated.
    pub fn line(&self) -> u32 {
        self.line
    }

    fn update_line(&self) {
        let level = self.status.load(Ordering::SeqCst) != 0;
        if self.level.swap(level, Ordering::SeqCst) != level {
            self.bus.set_irq(self.line, level);
        }
    }
}
