//! Virtqueue engine.
//!
//! Device-side implementation of the split virtqueue: walking descriptor
//! chains, dequeuing from the available ring, posting completions to the
//! used ring, and the EVENT_IDX interrupt-suppression protocol.
//!
//! Ring layout (all little-endian, sizes in bytes):
//!
//! ```text
//! descriptor table   16 * size      { addr: u64, len: u32, flags: u16, next: u16 }
//! available ring     4 + 2 * size   { flags: u16, idx: u16, ring: [u16; size] }
//!                    + 2            used_event (EVENT_IDX only)
//! used ring          4 + 8 * size   { flags: u16, idx: u16, ring: [{id: u32, len: u32}; size] }
//!                    + 2            avail_event (EVENT_IDX only)
//! ```
//!
//! Cursors are free-running 16-bit counters; wrap-around is implicit in the
//! modular arithmetic and the driver and device agree on the ring window.

use std::sync::{Arc, Mutex};

use crate::guest::{read_u16, write_u16, write_u32, GuestBus};

use super::VirtioError;

/// Descriptor flag: buffer continues in next descriptor.
pub const VIRTQ_DESC_F_NEXT: u16 = 1;

/// Descriptor flag: buffer is device-writable (vs device-readable).
pub const VIRTQ_DESC_F_WRITE: u16 = 2;

/// Descriptor flag: buffer holds an indirect descriptor table.
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4;

/// Available ring flag: the driver does not want completion interrupts.
/// Advisory, and superseded entirely by EVENT_IDX when negotiated.
pub const VIRTQ_AVAIL_F_NO_INTERRUPT: u16 = 1;

/// A virtqueue descriptor.
///
/// Each descriptor points to a buffer in guest memory and optionally
/// chains to another descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqDesc {
    /// Guest physical address of the buffer.
    pub addr: u64,
    /// Length of the buffer in bytes.
    pub len: u32,
    /// Flags (NEXT, WRITE, INDIRECT).
    pub flags: u16,
    /// Index of next descriptor if NEXT flag is set.
    pub next: u16,
}

impl VirtqDesc {
    /// Size of a descriptor in bytes.
    pub const SIZE: u64 = 16;

    /// Read a descriptor from guest memory.
    pub fn read_from(bus: &dyn GuestBus, addr: u64) -> Result<Self, VirtioError> {
        let mut buf = [0u8; Self::SIZE as usize];
        bus.read_at(addr, &mut buf)?;
        Ok(Self {
            addr: u64::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ]),
            len: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            flags: u16::from_le_bytes([buf[12], buf[13]]),
            next: u16::from_le_bytes([buf[14], buf[15]]),
        })
    }

    pub fn is_writable(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }
}

/// One resolved link of a descriptor chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainEntry {
    /// Guest physical address of the payload.
    pub addr: u64,
    /// Payload length in bytes.
    pub len: u32,
    /// Whether the device may write this buffer.
    pub writable: bool,
}

/// The canonical vring_need_event predicate (virtio 1.x §2.6.7.2).
///
/// True iff the driver's requested wake-up index `event` lies in the
/// half-open window `(old, new]`, treating 16-bit wrap.
pub fn vring_need_event(event: u16, new: u16, old: u16) -> bool {
    new.wrapping_sub(event.wrapping_add(1)) < new.wrapping_sub(old)
}

/// Virtqueue state.
///
/// Configured by the MMIO transport from driver register writes; consumed
/// by the device worker through [`QueueHandle`]. All cursor mutation happens
/// on the worker; the transport only touches configuration fields while the
/// queue is torn down (reset) or being set up (not yet ready).
#[derive(Debug)]
pub struct VirtQueue {
    /// Ring length the driver chose. Zero until configured.
    pub size: u16,
    /// Largest ring length the device supports.
    pub max_size: u16,
    /// Driver wrote QUEUE_READY=1.
    pub ready: bool,
    /// Guest physical address of the descriptor table.
    pub desc_addr: u64,
    /// Guest physical address of the available ring.
    pub avail_addr: u64,
    /// Guest physical address of the used ring.
    pub used_addr: u64,
    /// Device cursor into the available ring.
    pub last_avail_idx: u16,
    /// Device cursor into the used ring.
    pub used_idx: u16,
    /// EVENT_IDX negotiated for this device.
    pub event_idx: bool,
}

impl VirtQueue {
    pub fn new(max_size: u16) -> Self {
        Self {
            size: 0,
            max_size,
            ready: false,
            desc_addr: 0,
            avail_addr: 0,
            used_addr: 0,
            last_avail_idx: 0,
            used_idx: 0,
            event_idx: false,
        }
    }

    /// Return the queue to its post-reset state. `max_size` survives.
    pub fn reset(&mut self) {
        let max_size = self.max_size;
        *self = Self::new(max_size);
    }

    /// Read the available ring header. The header must be read before any
    /// ring slot so the device observes the driver's publication order.
    pub fn avail_header(&self, bus: &dyn GuestBus) -> Result<(u16, u16), VirtioError> {
        let flags = read_u16(bus, self.avail_addr)?;
        let idx = read_u16(bus, self.avail_addr + 2)?;
        Ok((flags, idx))
    }

    /// Pop the next descriptor chain head from the available ring, or
    /// `None` when the device has caught up with the driver.
    pub fn dequeue_available(&mut self, bus: &dyn GuestBus) -> Result<Option<u16>, VirtioError> {
        if !self.ready || self.size == 0 {
            return Ok(None);
        }

        let avail_idx = read_u16(bus, self.avail_addr + 2)?;
        if avail_idx == self.last_avail_idx {
            return Ok(None);
        }

        let slot = u64::from(self.last_avail_idx % self.size);
        let head = read_u16(bus, self.avail_addr + 4 + slot * 2)?;
        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);
        Ok(Some(head))
    }

    /// Resolve the descriptor chain starting at `head` into its payloads.
    ///
    /// The walk is bounded at `size` links so a corrupt or malicious `next`
    /// cycle cannot hang the device. Indirect descriptors are not part of
    /// this device profile and are rejected.
    pub fn walk_chain(
        &self,
        bus: &dyn GuestBus,
        head: u16,
    ) -> Result<Vec<ChainEntry>, VirtioError> {
        let mut entries = Vec::new();
        let mut idx = head;

        loop {
            if idx >= self.size {
                return Err(VirtioError::InvalidDescriptor(
                    "descriptor index out of range",
                ));
            }
            let desc = VirtqDesc::read_from(bus, self.desc_addr + u64::from(idx) * VirtqDesc::SIZE)?;
            if desc.flags & VIRTQ_DESC_F_INDIRECT != 0 {
                return Err(VirtioError::InvalidDescriptor(
                    "indirect descriptors not supported",
                ));
            }
            entries.push(ChainEntry {
                addr: desc.addr,
                len: desc.len,
                writable: desc.is_writable(),
            });
            if desc.flags & VIRTQ_DESC_F_NEXT == 0 {
                return Ok(entries);
            }
            if entries.len() >= usize::from(self.size) {
                return Err(VirtioError::InvalidDescriptor(
                    "descriptor chain exceeds queue size",
                ));
            }
            idx = desc.next;
        }
    }

    /// Publish a completed chain to the used ring.
    ///
    /// Writes the `{id, len}` element first and only then the incremented
    /// `used_idx`, so the driver never observes an index covering an
    /// unwritten element. Returns `(old_used_idx, new_used_idx)` for the
    /// interrupt decision.
    pub fn complete(
        &mut self,
        bus: &dyn GuestBus,
        head: u16,
        total_written: u32,
    ) -> Result<(u16, u16), VirtioError> {
        let old = self.used_idx;
        let slot = u64::from(old % self.size);
        let elem_addr = self.used_addr + 4 + slot * 8;

        write_u32(bus, elem_addr, u32::from(head))?;
        write_u32(bus, elem_addr + 4, total_written)?;

        let new = old.wrapping_add(1);
        write_u16(bus, self.used_addr + 2, new)?;
        self.used_idx = new;
        Ok((old, new))
    }

    /// Decide whether completions in `(old_used, new_used]` warrant an
    /// interrupt.
    ///
    /// With EVENT_IDX the driver publishes `used_event` past the available
    /// ring; otherwise the advisory NO_INTERRUPT flag applies. A failed
    /// guest read falls back to waking the driver.
    pub fn should_interrupt(
        &self,
        bus: &dyn GuestBus,
        old_used: u16,
        new_used: u16,
        avail_flags: u16,
    ) -> bool {
        if self.event_idx {
            let used_event_addr = self.avail_addr + 4 + u64::from(self.size) * 2;
            match read_u16(bus, used_event_addr) {
                Ok(used_event) => vring_need_event(used_event, new_used, old_used),
                Err(_) => true,
            }
        } else {
            avail_flags & VIRTQ_AVAIL_F_NO_INTERRUPT == 0
        }
    }

    /// Publish the device's wake-up index (`avail_event`, past the used
    /// ring) when EVENT_IDX is negotiated; otherwise a no-op.
    pub fn publish_avail_event(&self, bus: &dyn GuestBus, value: u16) -> Result<(), VirtioError> {
        if !self.event_idx {
            return Ok(());
        }
        let avail_event_addr = self.used_addr + 4 + u64::from(self.size) * 8;
        write_u16(bus, avail_event_addr, value)?;
        Ok(())
    }
}

/// Shared handle to one virtqueue.
///
/// The transport keeps the owning side for register accesses and reset; the
/// device worker holds clones. Each operation takes the lock for just that
/// operation; serialization of whole TX/RX passes comes from the
/// single-worker model, not from this lock.
#[derive(Clone)]
pub struct QueueHandle {
    index: u16,
    state: Arc<Mutex<VirtQueue>>,
}

impl QueueHandle {
    pub fn new(index: u16, state: Arc<Mutex<VirtQueue>>) -> Self {
        Self { index, state }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().unwrap().ready
    }

    pub fn size(&self) -> u16 {
        self.state.lock().unwrap().size
    }

    pub fn last_avail_idx(&self) -> u16 {
        self.state.lock().unwrap().last_avail_idx
    }

    pub fn used_idx(&self) -> u16 {
        self.state.lock().unwrap().used_idx
    }

    pub fn avail_header(&self, bus: &dyn GuestBus) -> Result<(u16, u16), VirtioError> {
        self.state.lock().unwrap().avail_header(bus)
    }

    pub fn dequeue_available(&self, bus: &dyn GuestBus) -> Result<Option<u16>, VirtioError> {
        self.state.lock().unwrap().dequeue_available(bus)
    }

    /// Peek the head the next dequeue would return, without consuming it.
    pub fn peek_available(&self, bus: &dyn GuestBus) -> Result<Option<u16>, VirtioError> {
        let q = self.state.lock().unwrap();
        if !q.ready || q.size == 0 {
            return Ok(None);
        }
        let avail_idx = read_u16(bus, q.avail_addr + 2)?;
        if avail_idx == q.last_avail_idx {
            return Ok(None);
        }
        let slot = u64::from(q.last_avail_idx % q.size);
        Ok(Some(read_u16(bus, q.avail_addr + 4 + slot * 2)?))
    }

    pub fn walk_chain(&self, bus: &dyn GuestBus, head: u16) -> Result<Vec<ChainEntry>, VirtioError> {
        self.state.lock().unwrap().walk_chain(bus, head)
    }

    pub fn complete(
        &self,
        bus: &dyn GuestBus,
        head: u16,
        total_written: u32,
    ) -> Result<(u16, u16), VirtioError> {
        self.state.lock().unwrap().complete(bus, head, total_written)
    }

    pub fn should_interrupt(
        &self,
        bus: &dyn GuestBus,
        old_used: u16,
        new_used: u16,
        avail_flags: u16,
    ) -> bool {
        self.state
            .lock()
            .unwrap()
            .should_interrupt(bus, old_used, new_used, avail_flags)
    }

    pub fn publish_avail_event(&self, bus: &dyn GuestBus) -> Result<(), VirtioError> {
        let q = self.state.lock().unwrap();
        q.publish_avail_event(bus, q.last_avail_idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::MmapGuestBus;

    const DESC_TABLE: u64 = 0x1000;
    const AVAIL_RING: u64 = 0x2000;
    const USED_RING: u64 = 0x3000;

    fn fixture(size: u16) -> (Arc<MmapGuestBus>, VirtQueue) {
        let bus = Arc::new(MmapGuestBus::new(0x10000).unwrap());
        let mut q = VirtQueue::new(256);
        q.size = size;
        q.ready = true;
        q.desc_addr = DESC_TABLE;
        q.avail_addr = AVAIL_RING;
        q.used_addr = USED_RING;
        (bus, q)
    }

    fn write_desc(bus: &dyn GuestBus, i: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let base = DESC_TABLE + u64::from(i) * 16;
        bus.write_at(base, &addr.to_le_bytes()).unwrap();
        bus.write_at(base + 8, &len.to_le_bytes()).unwrap();
        bus.write_at(base + 12, &flags.to_le_bytes()).unwrap();
        bus.write_at(base + 14, &next.to_le_bytes()).unwrap();
    }

    fn push_avail(bus: &dyn GuestBus, q: &VirtQueue, heads: &[u16]) {
        let idx = crate::guest::read_u16(bus, AVAIL_RING + 2).unwrap();
        for (i, head) in heads.iter().enumerate() {
            let slot = u64::from(idx.wrapping_add(i as u16) % q.size);
            write_u16(bus, AVAIL_RING + 4 + slot * 2, *head).unwrap();
        }
        write_u16(bus, AVAIL_RING + 2, idx.wrapping_add(heads.len() as u16)).unwrap();
    }

    fn read_used_elem(bus: &dyn GuestBus, q: &VirtQueue, slot: u16) -> (u32, u32) {
        let base = USED_RING + 4 + u64::from(slot % q.size) * 8;
        let id = crate::guest::read_u32(bus, base).unwrap();
        let len = crate::guest::read_u32(bus, base + 4).unwrap();
        (id, len)
    }

    #[test]
    fn test_dequeue_empty() {
        let (bus, mut q) = fixture(8);
        assert_eq!(q.dequeue_available(&*bus).unwrap(), None);
    }

    #[test]
    fn test_dequeue_not_ready() {
        let (bus, mut q) = fixture(8);
        push_avail(&*bus, &q, &[3]);
        q.ready = false;
        assert_eq!(q.dequeue_available(&*bus).unwrap(), None);
    }

    #[test]
    fn test_dequeue_in_order() {
        let (bus, mut q) = fixture(8);
        push_avail(&*bus, &q, &[5, 2, 7]);
        assert_eq!(q.dequeue_available(&*bus).unwrap(), Some(5));
        assert_eq!(q.dequeue_available(&*bus).unwrap(), Some(2));
        assert_eq!(q.dequeue_available(&*bus).unwrap(), Some(7));
        assert_eq!(q.dequeue_available(&*bus).unwrap(), None);
        assert_eq!(q.last_avail_idx, 3);
    }

    #[test]
    fn test_dequeue_wraps_modulo_size() {
        let (bus, mut q) = fixture(4);
        // Drive the cursor around the ring twice.
        for round in 0..8u16 {
            push_avail(&*bus, &q, &[round % 4]);
            assert_eq!(q.dequeue_available(&*bus).unwrap(), Some(round % 4));
        }
        assert_eq!(q.last_avail_idx, 8);
    }

    #[test]
    fn test_walk_single() {
        let (bus, q) = fixture(8);
        write_desc(&*bus, 0, 0x4000, 64, 0, 0);
        let chain = q.walk_chain(&*bus, 0).unwrap();
        assert_eq!(
            chain,
            vec![ChainEntry {
                addr: 0x4000,
                len: 64,
                writable: false
            }]
        );
    }

    #[test]
    fn test_walk_multi() {
        let (bus, q) = fixture(8);
        write_desc(&*bus, 2, 0x4000, 16, VIRTQ_DESC_F_NEXT, 5);
        write_desc(&*bus, 5, 0x5000, 32, VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE, 1);
        write_desc(&*bus, 1, 0x6000, 8, VIRTQ_DESC_F_WRITE, 0);
        let chain = q.walk_chain(&*bus, 2).unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].addr, 0x4000);
        assert!(!chain[0].writable);
        assert!(chain[1].writable);
        assert_eq!(chain[2].len, 8);
    }

    #[test]
    fn test_walk_head_out_of_range() {
        let (bus, q) = fixture(8);
        assert!(matches!(
            q.walk_chain(&*bus, 8),
            Err(VirtioError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn test_walk_rejects_indirect() {
        let (bus, q) = fixture(8);
        write_desc(&*bus, 0, 0x4000, 64, VIRTQ_DESC_F_INDIRECT, 0);
        assert!(matches!(
            q.walk_chain(&*bus, 0),
            Err(VirtioError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn test_walk_bounded_on_cycle() {
        let (bus, q) = fixture(8);
        // 0 -> 1 -> 0 -> ... never terminates without the bound.
        write_desc(&*bus, 0, 0x4000, 16, VIRTQ_DESC_F_NEXT, 1);
        write_desc(&*bus, 1, 0x5000, 16, VIRTQ_DESC_F_NEXT, 0);
        assert!(matches!(
            q.walk_chain(&*bus, 0),
            Err(VirtioError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn test_complete_publishes_elem_and_idx() {
        let (bus, mut q) = fixture(8);
        let (old, new) = q.complete(&*bus, 5, 100).unwrap();
        assert_eq!((old, new), (0, 1));
        assert_eq!(read_used_elem(&*bus, &q, 0), (5, 100));
        assert_eq!(read_u16(&*bus, USED_RING + 2).unwrap(), 1);
        assert_eq!(q.used_idx, 1);

        let (old, new) = q.complete(&*bus, 2, 0).unwrap();
        assert_eq!((old, new), (1, 2));
        assert_eq!(read_used_elem(&*bus, &q, 1), (2, 0));
    }

    #[test]
    fn test_vring_need_event_matches_window_definition() {
        // Invariant: need_event(event, new, old) iff the wake-up index
        // event+1 lies in the half-open (old, new] window under 16-bit
        // wrap, i.e. event itself lies in [old, new).
        let cases: &[u16] = &[0, 1, 2, 5, 0x7fff, 0x8000, 0xfffe, 0xffff];
        for &old in cases {
            for dist in [1u16, 2, 5, 0x7fff] {
                let new = old.wrapping_add(dist);
                for &event in cases {
                    let in_window = event.wrapping_sub(old) < dist;
                    assert_eq!(
                        vring_need_event(event, new, old),
                        in_window,
                        "event={event:#x} new={new:#x} old={old:#x}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_should_interrupt_flag_mode() {
        let (bus, q) = fixture(8);
        write_u16(&*bus, AVAIL_RING, 0).unwrap();
        assert!(q.should_interrupt(&*bus, 0, 1, 0));
        assert!(!q.should_interrupt(&*bus, 0, 1, VIRTQ_AVAIL_F_NO_INTERRUPT));
    }

    #[test]
    fn test_should_interrupt_event_idx_mode() {
        let (bus, mut q) = fixture(8);
        q.event_idx = true;
        let used_event_addr = AVAIL_RING + 4 + 2 * 8;

        // Driver wants a wake at index 5: completions up to 5 stay silent.
        write_u16(&*bus, used_event_addr, 5).unwrap();
        assert!(!q.should_interrupt(&*bus, 0, 3, 0));
        assert!(q.should_interrupt(&*bus, 3, 6, 0));
        // NO_INTERRUPT is ignored once EVENT_IDX governs.
        assert!(q.should_interrupt(&*bus, 3, 6, VIRTQ_AVAIL_F_NO_INTERRUPT));
    }

    #[test]
    fn test_should_interrupt_defaults_true_on_bad_ring() {
        let (bus, mut q) = fixture(8);
        q.event_idx = true;
        q.avail_addr = 0xffff_f000; // outside guest memory
        assert!(q.should_interrupt(&*bus, 0, 1, 0));
    }

    #[test]
    fn test_publish_avail_event() {
        let (bus, mut q) = fixture(8);
        let avail_event_addr = USED_RING + 4 + 8 * 8;

        // Not negotiated: no write happens.
        q.publish_avail_event(&*bus, 42).unwrap();
        assert_eq!(read_u16(&*bus, avail_event_addr).unwrap(), 0);

        q.event_idx = true;
        q.publish_avail_event(&*bus, 42).unwrap();
        assert_eq!(read_u16(&*bus, avail_event_addr).unwrap(), 42);
    }

    #[test]
    fn test_reset_zeroes_state() {
        let (bus, mut q) = fixture(8);
        push_avail(&*bus, &q, &[1]);
        q.dequeue_available(&*bus).unwrap();
        q.complete(&*bus, 1, 0).unwrap();
        q.event_idx = true;

        q.reset();
        assert_eq!(q.size, 0);
        assert!(!q.ready);
        assert_eq!(q.desc_addr, 0);
        assert_eq!(q.avail_addr, 0);
        assert_eq!(q.used_addr, 0);
        assert_eq!(q.last_avail_idx, 0);
        assert_eq!(q.used_idx, 0);
        assert!(!q.event_idx);
        assert_eq!(q.max_size, 256);
    }

    #[test]
    fn test_queue_handle_roundtrip() {
        let (bus, q) = fixture(8);
        let handle = QueueHandle::new(0, Arc::new(Mutex::new(q)));
        write_desc(&*bus, 0, 0x4000, 64, 0, 0);
        {
            let state = handle.state.clone();
            push_avail(&*bus, &state.lock().unwrap(), &[0]);
        }
        assert_eq!(handle.peek_available(&*bus).unwrap(), Some(0));
        assert_eq!(handle.dequeue_available(&*bus).unwrap(), Some(0));
        let chain = handle.walk_chain(&*bus, 0).unwrap();
        assert_eq!(chain.len(), 1);
        handle.complete(&*bus, 0, 0).unwrap();
        assert_eq!(handle.used_idx(), 1);
    }
}
