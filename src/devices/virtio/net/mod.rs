//! Virtio network device.
//!
//! Two queues: RX (0) and TX (1). All queue processing runs on one
//! long-lived worker thread fed by a bounded channel; the MMIO notify path,
//! the host-side RX injector, and the reset path each post a message and
//! block on a one-shot response. That single consumer is what serializes
//! cursor updates, `pending_rx`, and backpressure accounting without
//! fine-grained locks.
//!
//! ```text
//! vCPU thread ──QUEUE_NOTIFY──▶ Kick(q) ──┐
//! host ingress ──enqueue_rx──▶ RxFrame ───┤──▶ worker ──▶ virtqueues ──▶ guest memory
//! reset path ──STATUS=0──────▶ Reset ─────┘        │
//!                                                  └──▶ backend.handle_tx
//! ```
//!
//! TX gathers each descriptor chain into a pooled contiguous buffer,
//! finalizes the checksum when the guest asked for offload, and hands the
//! packet to the [`NetBackend`]. RX delivers pending packets into
//! guest-posted writable chains using merged buffers: the 12-byte header's
//! `num_buffers` counts the descriptors a packet actually consumed.

mod csum;
pub mod loopback;
pub mod pool;

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::guest::GuestBus;
use crate::sync::{completion, CompletionTx, Semaphore};

use super::queue::{ChainEntry, QueueHandle};
use super::{
    InterruptLine, VirtioDeviceHandler, VirtioError, INT_VRING, VIRTIO_ID_NET,
    VIRTIO_RING_F_EVENT_IDX,
};
use pool::{BufferPool, TxPacket, TX_POOL_MAX};

/// Receive queue index.
pub const RX_QUEUE: u16 = 0;

/// Transmit queue index.
pub const TX_QUEUE: u16 = 1;

/// Ring size advertised for both queues.
pub const NET_MAX_QUEUE_SIZE: u16 = 256;

/// Upper bound on host-injected packets awaiting guest RX buffers.
pub const MAX_PENDING_RX: usize = 256;

/// The virtio-net header preceding every packet on the wire format.
pub const VIRTIO_NET_HDR_SIZE: usize = 12;

/// Work messages outstanding at once; producers block past this.
const WORK_QUEUE_DEPTH: usize = 64;

/// Backlog sizes worth a diagnostic as `pending_rx` grows.
const RX_BACKLOG_MARKS: [usize; 6] = [1, 8, 32, 64, 128, 256];

// Device feature bits (virtio 1.1 §5.1.3).
pub const VIRTIO_NET_F_CSUM: u64 = 1 << 0;
pub const VIRTIO_NET_F_MAC: u64 = 1 << 5;
pub const VIRTIO_NET_F_MRG_RXBUF: u64 = 1 << 15;

// Header flags and GSO types (virtio 1.1 §5.1.6).
pub const VIRTIO_NET_HDR_F_NEEDS_CSUM: u8 = 1;
pub const VIRTIO_NET_HDR_GSO_NONE: u8 = 0;

/// The 12-byte virtio-net header, little-endian on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtioNetHdr {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
    pub num_buffers: u16,
}

impl VirtioNetHdr {
    pub fn from_bytes(b: &[u8; VIRTIO_NET_HDR_SIZE]) -> Self {
        Self {
            flags: b[0],
            gso_type: b[1],
            hdr_len: u16::from_le_bytes([b[2], b[3]]),
            gso_size: u16::from_le_bytes([b[4], b[5]]),
            csum_start: u16::from_le_bytes([b[6], b[7]]),
            csum_offset: u16::from_le_bytes([b[8], b[9]]),
            num_buffers: u16::from_le_bytes([b[10], b[11]]),
        }
    }

    pub fn to_bytes(self) -> [u8; VIRTIO_NET_HDR_SIZE] {
        let mut b = [0u8; VIRTIO_NET_HDR_SIZE];
        b[0] = self.flags;
        b[1] = self.gso_type;
        b[2..4].copy_from_slice(&self.hdr_len.to_le_bytes());
        b[4..6].copy_from_slice(&self.gso_size.to_le_bytes());
        b[6..8].copy_from_slice(&self.csum_start.to_le_bytes());
        b[8..10].copy_from_slice(&self.csum_offset.to_le_bytes());
        b[10..12].copy_from_slice(&self.num_buffers.to_le_bytes());
        b
    }
}

/// Consumer of outbound packets.
///
/// `handle_tx` takes ownership of the packet; dropping it (or calling
/// `TxPacket::release`) returns the buffer to the device's pool. A backend
/// that needs the bytes beyond the call must copy them first.
pub trait NetBackend: Send + Sync {
    fn handle_tx(&self, packet: TxPacket) -> io::Result<()>;
}

/// Hook by which a backend that re-injects frames (loopback and friends)
/// obtains the device handle after construction.
pub trait NetDeviceBinder {
    fn bind(&self, net: &Net);
}

/// Construction parameters for [`Net`].
#[derive(Debug, Clone, Copy)]
pub struct NetConfig {
    pub mac: [u8; 6],
    /// Advertise VIRTIO_RING_F_EVENT_IDX.
    pub event_idx: bool,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            // Locally administered, QEMU-style prefix.
            mac: [0x52, 0x54, 0x00, 0xa6, 0x00, 0x01],
            event_idx: true,
        }
    }
}

/// Device state layered on top of the transport snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetSnapshot {
    pub mac: [u8; 6],
    pub link_up: bool,
}

enum WorkMsg {
    Kick {
        queue: u16,
        resp: CompletionTx<Result<(), VirtioError>>,
    },
    RxFrame {
        frame: Vec<u8>,
        resp: CompletionTx<Result<(), VirtioError>>,
    },
    Enable {
        features: u64,
        queues: Vec<QueueHandle>,
        irq: Arc<InterruptLine>,
        resp: CompletionTx<Result<(), VirtioError>>,
    },
    Reset {
        resp: CompletionTx<Result<(), VirtioError>>,
    },
    Shutdown,
}

/// Virtio network device handle.
///
/// Cloneable; one clone plugs into the MMIO transport as the device
/// handler, others serve host-side ingress via [`enqueue_rx`](Net::enqueue_rx).
#[derive(Clone)]
pub struct Net {
    shared: Arc<NetShared>,
}

/// Weak counterpart of [`Net`] for backends that must not keep the device
/// alive (a loopback backend referencing its own device would otherwise
/// form a cycle).
#[derive(Clone)]
pub struct WeakNet {
    shared: Weak<NetShared>,
}

impl WeakNet {
    pub fn upgrade(&self) -> Option<Net> {
        self.shared.upgrade().map(|shared| Net { shared })
    }
}

struct NetShared {
    mac: [u8; 6],
    event_idx: bool,
    link_up: Arc<AtomicBool>,
    rx_slots: Arc<Semaphore>,
    work: mpsc::SyncSender<WorkMsg>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for NetShared {
    fn drop(&mut self) {
        let _ = self.work.send(WorkMsg::Shutdown);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Net {
    /// Create the device and spawn its worker thread.
    pub fn new(
        config: NetConfig,
        bus: Arc<dyn GuestBus>,
        backend: Arc<dyn NetBackend>,
    ) -> io::Result<Self> {
        let (work_tx, work_rx) = mpsc::sync_channel(WORK_QUEUE_DEPTH);
        let rx_slots = Arc::new(Semaphore::new(MAX_PENDING_RX));
        let link_up = Arc::new(AtomicBool::new(true));

        let mut worker = NetWorker {
            bus,
            backend,
            rx_slots: rx_slots.clone(),
            link_up: link_up.clone(),
            pool: BufferPool::new(TX_POOL_MAX),
            rx_queue: None,
            tx_queue: None,
            irq: None,
            pending_rx: VecDeque::new(),
            backlog_mark: 0,
        };
        let handle = thread::Builder::new()
            .name("virtio-net".into())
            .spawn(move || worker.run(work_rx))?;

        Ok(Self {
            shared: Arc::new(NetShared {
                mac: config.mac,
                event_idx: config.event_idx,
                link_up,
                rx_slots,
                work: work_tx,
                worker: Mutex::new(Some(handle)),
            }),
        })
    }

    pub fn downgrade(&self) -> WeakNet {
        WeakNet {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn mac(&self) -> [u8; 6] {
        self.shared.mac
    }

    pub fn link_up(&self) -> bool {
        self.shared.link_up.load(Ordering::SeqCst)
    }

    /// Permits left before [`enqueue_rx`](Self::enqueue_rx) blocks.
    pub fn rx_slots_available(&self) -> usize {
        self.shared.rx_slots.available()
    }

    /// Inject a frame towards the guest.
    ///
    /// Blocks while `MAX_PENDING_RX` packets already await guest buffers,
    /// then until the worker has queued the copy and run one RX delivery
    /// pass. The backpressure permit is returned only once the packet
    /// reaches guest memory or a reset drops it.
    pub fn enqueue_rx(&self, frame: &[u8]) -> Result<(), VirtioError> {
        self.shared.rx_slots.acquire();
        self.roundtrip(|resp| WorkMsg::RxFrame {
            frame: frame.to_vec(),
            resp,
        })
    }

    pub fn snapshot(&self) -> NetSnapshot {
        NetSnapshot {
            mac: self.shared.mac,
            link_up: self.link_up(),
        }
    }

    pub fn restore(&self, snap: &NetSnapshot) {
        self.shared.link_up.store(snap.link_up, Ordering::SeqCst);
    }

    fn roundtrip(
        &self,
        make: impl FnOnce(CompletionTx<Result<(), VirtioError>>) -> WorkMsg,
    ) -> Result<(), VirtioError> {
        let (tx, rx) = completion();
        self.shared
            .work
            .send(make(tx))
            .map_err(|_| VirtioError::WorkerGone)?;
        rx.wait().unwrap_or(Err(VirtioError::WorkerGone))
    }
}

impl VirtioDeviceHandler for Net {
    fn device_id(&self) -> u32 {
        VIRTIO_ID_NET
    }

    fn num_queues(&self) -> u16 {
        2
    }

    fn max_queue_size(&self) -> u16 {
        NET_MAX_QUEUE_SIZE
    }

    fn device_features(&self) -> u64 {
        let mut features = super::VIRTIO_F_VERSION_1
            | VIRTIO_NET_F_CSUM
            | VIRTIO_NET_F_MAC
            | VIRTIO_NET_F_MRG_RXBUF;
        if self.shared.event_idx {
            features |= VIRTIO_RING_F_EVENT_IDX;
        }
        features
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        // 6-byte MAC, status byte (bit 0 = link up), one reserved byte.
        let mut cfg = [0u8; 8];
        cfg[..6].copy_from_slice(&self.shared.mac);
        cfg[6] = u8::from(self.link_up());
        for (i, b) in data.iter_mut().enumerate() {
            *b = *cfg.get(offset as usize + i).unwrap_or(&0);
        }
    }

    fn write_config(&mut self, offset: u64, _data: &[u8]) -> bool {
        // No writable net config fields in this profile.
        debug!("virtio-net: ignoring config write at offset {offset:#x}");
        false
    }

    fn on_enable(
        &mut self,
        features: u64,
        queues: Vec<QueueHandle>,
        irq: Arc<InterruptLine>,
    ) -> Result<(), VirtioError> {
        self.roundtrip(|resp| WorkMsg::Enable {
            features,
            queues,
            irq,
            resp,
        })
    }

    fn on_notify(&mut self, queue: u16) -> Result<(), VirtioError> {
        self.roundtrip(|resp| WorkMsg::Kick { queue, resp })
    }

    fn on_disable(&mut self) {
        // Reset never fails from the host's viewpoint.
        let _ = self.roundtrip(|resp| WorkMsg::Reset { resp });
    }
}

/// State owned by the worker thread. Nothing here is shared; the channel is
/// the only way in.
struct NetWorker {
    bus: Arc<dyn GuestBus>,
    backend: Arc<dyn NetBackend>,
    rx_slots: Arc<Semaphore>,
    link_up: Arc<AtomicBool>,
    pool: Arc<BufferPool>,
    rx_queue: Option<QueueHandle>,
    tx_queue: Option<QueueHandle>,
    irq: Option<Arc<InterruptLine>>,
    pending_rx: VecDeque<Vec<u8>>,
    backlog_mark: usize,
}

impl NetWorker {
    fn run(&mut self, work: mpsc::Receiver<WorkMsg>) {
        while let Ok(msg) = work.recv() {
            match msg {
                WorkMsg::Kick { queue, resp } => {
                    let result = match queue {
                        RX_QUEUE => self.process_rx(),
                        TX_QUEUE => self.process_tx(),
                        other => {
                            warn!("virtio-net: kick for unknown queue {other}");
                            Ok(())
                        }
                    };
                    resp.complete(result);
                }
                WorkMsg::RxFrame { frame, resp } => {
                    self.pending_rx.push_back(frame);
                    self.note_backlog();
                    let result = self.process_rx();
                    resp.complete(result);
                }
                WorkMsg::Enable {
                    features,
                    mut queues,
                    irq,
                    resp,
                } => {
                    resp.complete(if queues.len() == 2 {
                        debug!("virtio-net: enabled with features {features:#x}");
                        self.tx_queue = queues.pop();
                        self.rx_queue = queues.pop();
                        self.irq = Some(irq);
                        Ok(())
                    } else {
                        Err(VirtioError::InvalidDescriptor("expected two queues"))
                    });
                }
                WorkMsg::Reset { resp } => {
                    self.reset();
                    resp.complete(Ok(()));
                }
                WorkMsg::Shutdown => {
                    self.reset();
                    break;
                }
            }
        }
    }

    fn note_backlog(&mut self) {
        let n = self.pending_rx.len();
        if RX_BACKLOG_MARKS.contains(&n) && n > self.backlog_mark {
            self.backlog_mark = n;
            debug!("virtio-net: rx backlog reached {n} packets");
        }
    }

    fn reset(&mut self) {
        let dropped = self.pending_rx.len();
        self.pending_rx.clear();
        self.rx_slots.release_n(dropped);
        self.rx_queue = None;
        self.tx_queue = None;
        self.irq = None;
        self.backlog_mark = 0;
        self.link_up.store(true, Ordering::SeqCst);
    }

    /// Drain the TX available ring: gather each chain, offload checksums,
    /// hand packets to the backend. A bad chain fails only itself; the
    /// first error is reported through the notify response.
    fn process_tx(&mut self) -> Result<(), VirtioError> {
        let Some(q) = self.tx_queue.clone() else {
            return Ok(());
        };
        if !q.is_ready() {
            return Err(VirtioError::QueueNotReady(TX_QUEUE));
        }

        let bus = self.bus.clone();
        let (avail_flags, avail_idx) = q.avail_header(&*bus)?;
        let old_used = q.used_idx();
        let mut result = Ok(());

        while q.last_avail_idx() != avail_idx {
            let Some(head) = q.dequeue_available(&*bus)? else {
                break;
            };
            if let Err(e) = self.tx_one(&q, head) {
                warn!("virtio-net: tx chain {head} failed: {e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        q.publish_avail_event(&*bus)?;
        self.complete_pass(&q, old_used, avail_flags);
        result
    }

    fn tx_one(&self, q: &QueueHandle, head: u16) -> Result<(), VirtioError> {
        let bus = &*self.bus;
        let chain = q.walk_chain(bus, head)?;
        if chain.iter().any(|e| e.writable) {
            return Err(VirtioError::InvalidDescriptor(
                "writable descriptor in TX chain",
            ));
        }
        let total: usize = chain.iter().map(|e| e.len as usize).sum();
        if total < VIRTIO_NET_HDR_SIZE {
            return Err(VirtioError::InvalidDescriptor(
                "TX chain shorter than net header",
            ));
        }

        // Gather: the leading 12 bytes are the header, everything after is
        // packet payload, both possibly split across descriptors.
        let mut hdr_bytes = [0u8; VIRTIO_NET_HDR_SIZE];
        let mut packet = self.pool.take(total - VIRTIO_NET_HDR_SIZE);
        let mut off = 0usize;
        for e in &chain {
            let len = e.len as usize;
            let mut copied = 0usize;
            if off < VIRTIO_NET_HDR_SIZE {
                let n = (VIRTIO_NET_HDR_SIZE - off).min(len);
                bus.read_at(e.addr, &mut hdr_bytes[off..off + n])?;
                copied = n;
            }
            if copied < len {
                let dst_start = off + copied - VIRTIO_NET_HDR_SIZE;
                bus.read_at(
                    e.addr + copied as u64,
                    &mut packet.buf_mut()[dst_start..dst_start + (len - copied)],
                )?;
            }
            off += len;
        }

        let hdr = VirtioNetHdr::from_bytes(&hdr_bytes);
        if hdr.gso_type != VIRTIO_NET_HDR_GSO_NONE {
            return Err(VirtioError::UnsupportedGso(hdr.gso_type));
        }
        if hdr.flags & VIRTIO_NET_HDR_F_NEEDS_CSUM != 0 {
            csum::finalize_checksum(&mut packet, hdr.csum_start, hdr.csum_offset)?;
        }

        self.backend
            .handle_tx(packet)
            .map_err(|e| VirtioError::BackendFailure(e.to_string()))?;
        q.complete(bus, head, 0)?;
        Ok(())
    }

    /// Deliver pending packets into guest RX chains until either side runs
    /// out.
    fn process_rx(&mut self) -> Result<(), VirtioError> {
        let Some(q) = self.rx_queue.clone() else {
            return Ok(());
        };
        if !q.is_ready() || self.pending_rx.is_empty() {
            return Ok(());
        }

        let bus = self.bus.clone();
        let (avail_flags, _) = q.avail_header(&*bus)?;
        let old_used = q.used_idx();
        let mut result = Ok(());

        while let Some(pkt) = self.pending_rx.pop_front() {
            match self.deliver_one(&q, &pkt) {
                Ok(true) => {
                    self.rx_slots.release();
                }
                Ok(false) => {
                    // Not enough buffer space yet; keep the packet and wait
                    // for the driver.
                    self.pending_rx.push_front(pkt);
                    break;
                }
                Err(e) => {
                    self.pending_rx.push_front(pkt);
                    if result.is_ok() {
                        result = Err(e);
                    }
                    break;
                }
            }
        }

        q.publish_avail_event(&*bus)?;
        self.complete_pass(&q, old_used, avail_flags);
        result
    }

    /// Try to place one packet. `Ok(false)` means the driver has not posted
    /// enough capacity; nothing was consumed.
    fn deliver_one(&self, q: &QueueHandle, pkt: &[u8]) -> Result<bool, VirtioError> {
        let bus = &*self.bus;
        let needed = VIRTIO_NET_HDR_SIZE + pkt.len();

        loop {
            let Some(head) = q.peek_available(bus)? else {
                return Ok(false);
            };

            let chain = match q.walk_chain(bus, head).and_then(|chain| {
                validate_rx_chain(&chain)?;
                Ok(chain)
            }) {
                Ok(chain) => chain,
                Err(e) => {
                    // Malformed chain: retire it empty and move on; the
                    // packet is still deliverable into the next chain.
                    warn!("virtio-net: dropping rx chain {head}: {e}");
                    q.dequeue_available(bus)?;
                    q.complete(bus, head, 0)?;
                    continue;
                }
            };

            let capacity: usize = chain.iter().map(|e| e.len as usize).sum();
            if capacity < needed {
                let (_, avail_idx) = q.avail_header(bus)?;
                if avail_idx.wrapping_sub(q.last_avail_idx()) >= 2 {
                    // A bigger chain is queued behind this one; retire the
                    // short chain empty so the packet can land there.
                    q.dequeue_available(bus)?;
                    q.complete(bus, head, 0)?;
                    continue;
                }
                return Ok(false);
            }

            q.dequeue_available(bus)?;
            if let Err(e) = self.fill_rx(q, head, &chain, pkt) {
                // The chain is consumed either way; close it out so the
                // driver gets it back.
                let _ = q.complete(bus, head, 0);
                return Err(e);
            }
            return Ok(true);
        }
    }

    /// Copy the packet into a validated chain and publish it used.
    ///
    /// The first descriptor is written last, once `num_buffers` is known,
    /// so the guest never observes a header without its final buffer count.
    fn fill_rx(
        &self,
        q: &QueueHandle,
        head: u16,
        chain: &[ChainEntry],
        pkt: &[u8],
    ) -> Result<(), VirtioError> {
        let bus = &*self.bus;
        let first = &chain[0];

        let first_total = (first.len as usize).min(VIRTIO_NET_HDR_SIZE + pkt.len());
        let first_payload = first_total - VIRTIO_NET_HDR_SIZE;
        let mut first_buf = vec![0u8; first_total];
        first_buf[VIRTIO_NET_HDR_SIZE..].copy_from_slice(&pkt[..first_payload]);

        let mut written = first_payload;
        let mut buffers_used: u16 = 1;
        for e in &chain[1..] {
            if written == pkt.len() {
                break;
            }
            let n = (e.len as usize).min(pkt.len() - written);
            bus.write_at(e.addr, &pkt[written..written + n])?;
            written += n;
            buffers_used += 1;
        }

        let hdr = VirtioNetHdr {
            num_buffers: buffers_used,
            ..Default::default()
        };
        first_buf[..VIRTIO_NET_HDR_SIZE].copy_from_slice(&hdr.to_bytes());
        bus.write_at(first.addr, &first_buf)?;

        q.complete(bus, head, (VIRTIO_NET_HDR_SIZE + pkt.len()) as u32)?;
        Ok(())
    }

    /// End-of-pass interrupt decision shared by TX and RX.
    fn complete_pass(&self, q: &QueueHandle, old_used: u16, avail_flags: u16) {
        let new_used = q.used_idx();
        if new_used == old_used {
            return;
        }
        if q.should_interrupt(&*self.bus, old_used, new_used, avail_flags) {
            if let Some(irq) = &self.irq {
                irq.raise(INT_VRING);
            }
        }
    }
}

fn validate_rx_chain(chain: &[ChainEntry]) -> Result<(), VirtioError> {
    if chain.iter().any(|e| !e.writable) {
        return Err(VirtioError::InvalidDescriptor(
            "read-only descriptor in RX chain",
        ));
    }
    if (chain[0].len as usize) < VIRTIO_NET_HDR_SIZE {
        return Err(VirtioError::InvalidDescriptor(
            "RX chain head shorter than net header",
        ));
    }
    Ok(())
}
