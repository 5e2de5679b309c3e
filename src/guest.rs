//! Guest memory gateway.
//!
//! The only surface through which a device touches guest physical memory or
//! an interrupt line. The hypervisor implements [`GuestBus`] on top of its
//! vCPU runtime; [`MmapGuestBus`] is a ready-made implementation backed by
//! the vm-memory crate for embedders and tests.
//!
//! A single `read_at`/`write_at` call is atomic as far as the device is
//! concerned (the hypervisor provides that). No ordering across calls is
//! implied; the virtqueue code sequences its own accesses.

use std::sync::Arc;

use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

/// Errors raised by guest memory accesses.
#[derive(Error, Debug)]
pub enum GuestAccessError {
    #[error("guest address {addr:#x} is outside the physical address space")]
    AddressOverflow { addr: u64 },

    #[error("short access of {len} bytes at guest address {addr:#x}")]
    OutOfBounds { addr: u64, len: usize },

    #[error("failed to allocate guest memory: {0}")]
    Allocation(String),
}

/// Narrow capability handed to every device: read guest memory, write guest
/// memory, toggle an IRQ line. Callable from any thread.
pub trait GuestBus: Send + Sync {
    /// Read `data.len()` bytes at the guest physical address `addr`.
    fn read_at(&self, addr: u64, data: &mut [u8]) -> Result<(), GuestAccessError>;

    /// Write `data` at the guest physical address `addr`.
    fn write_at(&self, addr: u64, data: &[u8]) -> Result<(), GuestAccessError>;

    /// Drive an interrupt line to the given level.
    ///
    /// Idempotent at the hypervisor; the transport layer additionally
    /// suppresses redundant transitions before calling this.
    fn set_irq(&self, line: u32, level: bool);
}

/// Guest addresses with bit 63 set are never valid: they cannot be produced
/// by a sane driver and would wrap the arithmetic below.
fn check_range(addr: u64, len: usize) -> Result<(), GuestAccessError> {
    if addr >= 1 << 63 {
        return Err(GuestAccessError::AddressOverflow { addr });
    }
    if addr.checked_add(len as u64).is_none() {
        return Err(GuestAccessError::AddressOverflow { addr });
    }
    Ok(())
}

pub(crate) fn read_u16(bus: &dyn GuestBus, addr: u64) -> Result<u16, GuestAccessError> {
    let mut buf = [0u8; 2];
    bus.read_at(addr, &mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

pub(crate) fn write_u16(bus: &dyn GuestBus, addr: u64, value: u16) -> Result<(), GuestAccessError> {
    bus.write_at(addr, &value.to_le_bytes())
}

pub(crate) fn read_u32(bus: &dyn GuestBus, addr: u64) -> Result<u32, GuestAccessError> {
    let mut buf = [0u8; 4];
    bus.read_at(addr, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn write_u32(bus: &dyn GuestBus, addr: u64, value: u32) -> Result<(), GuestAccessError> {
    bus.write_at(addr, &value.to_le_bytes())
}

/// Callback invoked when a device drives an IRQ line.
pub type IrqSink = Box<dyn Fn(u32, bool) + Send + Sync>;

/// Guest bus backed by an anonymous mmap region starting at guest physical
/// address zero.
///
/// This is the same shape the hypervisor uses for real guests (a single
/// contiguous `GuestMemoryMmap` region); here it doubles as the test
/// substrate so the device code is exercised against the production memory
/// backend.
pub struct MmapGuestBus {
    mem: GuestMemoryMmap,
    irq_sink: IrqSink,
}

impl MmapGuestBus {
    /// Allocate a guest memory region of `size` bytes with a no-op IRQ sink.
    pub fn new(size: usize) -> Result<Self, GuestAccessError> {
        Self::with_irq_sink(size, Box::new(|_, _| {}))
    }

    /// Allocate a guest memory region and route `set_irq` to `irq_sink`.
    pub fn with_irq_sink(size: usize, irq_sink: IrqSink) -> Result<Self, GuestAccessError> {
        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), size)])
            .map_err(|e| GuestAccessError::Allocation(e.to_string()))?;
        Ok(Self { mem, irq_sink })
    }
}

impl GuestBus for MmapGuestBus {
    fn read_at(&self, addr: u64, data: &mut [u8]) -> Result<(), GuestAccessError> {
        check_range(addr, data.len())?;
        self.mem
            .read_slice(data, GuestAddress(addr))
            .map_err(|_| GuestAccessError::OutOfBounds {
                addr,
                len: data.len(),
            })
    }

    fn write_at(&self, addr: u64, data: &[u8]) -> Result<(), GuestAccessError> {
        check_range(addr, data.len())?;
        self.mem
            .write_slice(data, GuestAddress(addr))
            .map_err(|_| GuestAccessError::OutOfBounds {
                addr,
                len: data.len(),
            })
    }

    fn set_irq(&self, line: u32, level: bool) {
        (self.irq_sink)(line, level);
    }
}

impl<T: GuestBus + ?Sized> GuestBus for Arc<T> {
    fn read_at(&self, addr: u64, data: &mut [u8]) -> Result<(), GuestAccessError> {
        (**self).read_at(addr, data)
    }

    fn write_at(&self, addr: u64, data: &[u8]) -> Result<(), GuestAccessError> {
        (**self).write_at(addr, data)
    }

    fn set_irq(&self, line: u32, level: bool) {
        (**self).set_irq(line, level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn read_vec(bus: &dyn GuestBus, addr: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        bus.read_at(addr, &mut data).unwrap();
        data
    }

    #[test]
    fn test_write_read() {
        let bus = MmapGuestBus::new(4096).unwrap();
        bus.write_at(0x10, &[1, 2, 3, 4]).unwrap();
        assert_eq!(read_vec(&bus, 0x10, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_le_helpers() {
        let bus = MmapGuestBus::new(4096).unwrap();
        write_u16(&bus, 0x100, 0xbeef).unwrap();
        write_u32(&bus, 0x104, 0x12345678).unwrap();
        assert_eq!(read_u16(&bus, 0x100).unwrap(), 0xbeef);
        assert_eq!(read_u32(&bus, 0x104).unwrap(), 0x12345678);
        assert_eq!(read_vec(&bus, 0x100, 2), vec![0xef, 0xbe]);
    }

    #[test]
    fn test_out_of_bounds() {
        let bus = MmapGuestBus::new(4096).unwrap();
        let mut buf = [0u8; 2];
        assert!(bus.read_at(4095, &mut buf).is_err());
        assert!(bus.write_at(4095, &[1, 2]).is_err());
    }

    #[test]
    fn test_high_addresses_rejected() {
        let bus = MmapGuestBus::new(4096).unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(
            bus.read_at(1 << 63, &mut buf),
            Err(GuestAccessError::AddressOverflow { .. })
        ));
        assert!(matches!(
            bus.write_at(u64::MAX - 1, &[0, 0, 0, 0]),
            Err(GuestAccessError::AddressOverflow { .. })
        ));
    }

    #[test]
    fn test_irq_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let bus = MmapGuestBus::with_irq_sink(
            4096,
            Box::new(move |line, level| sink.lock().unwrap().push((line, level))),
        )
        .unwrap();
        bus.set_irq(5, true);
        bus.set_irq(5, false);
        assert_eq!(*seen.lock().unwrap(), vec![(5, true), (5, false)]);
    }
}
