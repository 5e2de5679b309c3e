//! Discovery records for virtio-mmio devices.
//!
//! The MMIO transport has no probing mechanism of its own; the guest learns
//! about each device through whatever the hypervisor emits at boot - a
//! kernel command-line argument, a device-tree node, or an ACPI DSDT entry
//! with a GSI routing record. All three derive from the same
//! `{base, size, irq}` tuple, so this module only produces those inputs;
//! the table emitters themselves live with the boot code.

use crate::devices::mmio::MmioRange;

/// Kernel command-line argument announcing one device:
///
/// ```text
/// virtio_mmio.device=4K@0xd0000000:5
/// ```
///
/// meaning "a 4KB virtio device at 0xd0000000, IRQ 5". Sizes that are a
/// whole number of KiB use the `<n>K` shorthand Linux accepts.
pub fn kernel_cmdline_arg(range: &MmioRange) -> String {
    if range.size % 1024 == 0 {
        format!(
            "virtio_mmio.device={}K@{:#x}:{}",
            range.size / 1024,
            range.base,
            range.irq
        )
    } else {
        format!(
            "virtio_mmio.device={}@{:#x}:{}",
            range.size, range.base, range.irq
        )
    }
}

/// Device-tree node name for the range (`virtio_mmio@<unit-address>`).
pub fn device_tree_node_name(range: &MmioRange) -> String {
    format!("virtio_mmio@{:x}", range.base)
}

/// Inputs for one ACPI DSDT device definition (an `LNRO0005` node plus its
/// interrupt routing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcpiDeviceRecord {
    /// Index used to name the AML node (VM00, VM01, ...).
    pub id: u8,
    /// MMIO base address.
    pub mmio_base: u64,
    /// MMIO region size.
    pub mmio_size: u32,
    /// GSI (Global System Interrupt) number.
    pub gsi: u32,
}

impl AcpiDeviceRecord {
    pub fn new(id: u8, range: &MmioRange) -> Self {
        Self {
            id,
            mmio_base: range.base,
            mmio_size: range.size as u32,
            gsi: range.irq,
        }
    }
}

/// ACPI records for a set of allocated ranges, in allocation order.
pub fn acpi_records(ranges: &[MmioRange]) -> Vec<AcpiDeviceRecord> {
    ranges
        .iter()
        .enumerate()
        .map(|(i, r)| AcpiDeviceRecord::new(i as u8, r))
        .collect()
}
