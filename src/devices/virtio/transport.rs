//! Virtio MMIO transport (v2).
//!
//! The register file a virtio device presents at its guest-physical base
//! address: feature-selection windows, per-queue configuration, device
//! status, interrupt status, and the device-specific config window starting
//! at offset 0x100. Queue notifications dispatch to the plugged-in
//! [`VirtioDeviceHandler`]; everything else is transport state owned here.
//!
//! Register map reference: virtio 1.1 §4.2.2. The PCI transport is a
//! sibling with equivalent semantics; only MMIO is implemented.

use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::devices::mmio::{MmioDevice, MmioRange};
use crate::guest::GuestBus;

use super::queue::{QueueHandle, VirtQueue};
use super::{
    InterruptLine, VirtioDeviceHandler, VirtioError, INT_CONFIG, MMIO_CONFIG,
    MMIO_CONFIG_GENERATION, MMIO_DEVICE_FEATURES, MMIO_DEVICE_FEATURES_SEL, MMIO_DEVICE_ID,
    MMIO_DRIVER_FEATURES, MMIO_DRIVER_FEATURES_SEL, MMIO_INTERRUPT_ACK, MMIO_INTERRUPT_STATUS,
    MMIO_MAGIC_VALUE, MMIO_QUEUE_DESC_HIGH, MMIO_QUEUE_DESC_LOW, MMIO_QUEUE_DEVICE_HIGH,
    MMIO_QUEUE_DEVICE_LOW, MMIO_QUEUE_DRIVER_HIGH, MMIO_QUEUE_DRIVER_LOW, MMIO_QUEUE_NOTIFY,
    MMIO_QUEUE_NUM, MMIO_QUEUE_NUM_MAX, MMIO_QUEUE_PFN, MMIO_QUEUE_READY, MMIO_QUEUE_SEL,
    MMIO_SHM_BASE_HIGH, MMIO_SHM_BASE_LOW, MMIO_SHM_LEN_HIGH, MMIO_SHM_LEN_LOW, MMIO_SHM_SEL,
    MMIO_STATUS, MMIO_VENDOR_ID, MMIO_VERSION, STATUS_FEATURES_OK, VIRTIO_MMIO_MAGIC,
    VIRTIO_MMIO_VERSION, VIRTIO_VENDOR_ID,
};

/// Per-queue portion of the transport snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub size: u16,
    pub max_size: u16,
    pub ready: bool,
    pub desc_addr: u64,
    pub avail_addr: u64,
    pub used_addr: u64,
    pub last_avail_idx: u16,
    pub used_idx: u16,
    pub enable: bool,
}

/// Snapshot of the transport register file. Devices layer their own state
/// on top of this.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportSnapshot {
    pub device_feature_sel: u32,
    pub driver_feature_sel: u32,
    pub device_features: [u32; 2],
    pub driver_features: [u32; 2],
    pub queue_sel: u32,
    pub device_status: u32,
    pub interrupt_status: u32,
    pub config_generation: u32,
    pub queues: Vec<QueueSnapshot>,
}

/// The virtio-mmio register file for one device.
pub struct MmioTransport {
    bus: Arc<dyn GuestBus>,
    range: MmioRange,
    irq: Arc<InterruptLine>,
    device: Box<dyn VirtioDeviceHandler>,

    device_features: [u32; 2],
    driver_features: [u32; 2],
    device_feature_sel: u32,
    driver_feature_sel: u32,

    device_status: u32,
    config_generation: u32,
    queue_sel: u32,
    shm_sel: u32,

    queues: Vec<Arc<Mutex<VirtQueue>>>,
    enabled: bool,
}

impl MmioTransport {
    pub fn new(
        bus: Arc<dyn GuestBus>,
        range: MmioRange,
        device: Box<dyn VirtioDeviceHandler>,
    ) -> Self {
        let features = device.device_features();
        let queues = (0..device.num_queues())
            .map(|_| Arc::new(Mutex::new(VirtQueue::new(device.max_queue_size()))))
            .collect();
        Self {
            irq: Arc::new(InterruptLine::new(bus.clone(), range.irq)),
            bus,
            range,
            device,
            device_features: [features as u32, (features >> 32) as u32],
            driver_features: [0, 0],
            device_feature_sel: 0,
            driver_feature_sel: 0,
            device_status: 0,
            config_generation: 0,
            queue_sel: 0,
            shm_sel: 0,
            queues,
            enabled: false,
        }
    }

    /// The MMIO window and IRQ line this transport was allocated.
    pub fn range(&self) -> MmioRange {
        self.range
    }

    /// The interrupt line shared with the device worker.
    pub fn interrupt(&self) -> Arc<InterruptLine> {
        self.irq.clone()
    }

    fn driver_features64(&self) -> u64 {
        u64::from(self.driver_features[0]) | u64::from(self.driver_features[1]) << 32
    }

    fn device_features64(&self) -> u64 {
        u64::from(self.device_features[0]) | u64::from(self.device_features[1]) << 32
    }

    fn selected_queue(&self) -> Option<&Arc<Mutex<VirtQueue>>> {
        self.queues.get(self.queue_sel as usize)
    }

    fn queue_handles(&self) -> Vec<QueueHandle> {
        self.queues
            .iter()
            .enumerate()
            .map(|(i, q)| QueueHandle::new(i as u16, q.clone()))
            .collect()
    }

    /// Enable the device once the driver has accepted features and marked
    /// every queue ready. Checked after the writes that can complete the
    /// condition: DRIVER_FEATURES, STATUS, and QUEUE_READY.
    fn maybe_enable(&mut self) -> Result<(), VirtioError> {
        if self.enabled
            || self.device_status & STATUS_FEATURES_OK == 0
            || self.queues.is_empty()
            || !self.queues.iter().all(|q| q.lock().unwrap().ready)
        {
            return Ok(());
        }

        let negotiated = self.driver_features64() & self.device_features64();
        let event_idx = negotiated & super::VIRTIO_RING_F_EVENT_IDX != 0;
        for q in &self.queues {
            q.lock().unwrap().event_idx = event_idx;
        }

        debug!(
            "virtio-mmio {:#x}: enabling device {} with features {:#x}",
            self.range.base,
            self.device.device_id(),
            negotiated
        );
        self.device
            .on_enable(negotiated, self.queue_handles(), self.irq.clone())?;
        self.enabled = true;
        Ok(())
    }

    /// STATUS=0 write: disable the device and return the register file to
    /// its post-creation state. Device features survive.
    fn reset(&mut self) {
        debug!("virtio-mmio {:#x}: device reset", self.range.base);
        self.device.on_disable();
        self.enabled = false;
        for q in &self.queues {
            q.lock().unwrap().reset();
        }
        self.irq.clear();
        self.driver_features = [0, 0];
        self.device_feature_sel = 0;
        self.driver_feature_sel = 0;
        self.device_status = 0;
        self.config_generation = 0;
        self.queue_sel = 0;
        self.shm_sel = 0;
    }

    fn bump_config_generation(&mut self) {
        self.config_generation = self.config_generation.wrapping_add(1);
        self.irq.raise(INT_CONFIG);
    }

    fn read_register(&mut self, offset: u64) -> u32 {
        match offset {
            MMIO_MAGIC_VALUE => VIRTIO_MMIO_MAGIC,
            MMIO_VERSION => VIRTIO_MMIO_VERSION,
            MMIO_DEVICE_ID => self.device.device_id(),
            MMIO_VENDOR_ID => VIRTIO_VENDOR_ID,
            MMIO_DEVICE_FEATURES => *self
                .device_features
                .get(self.device_feature_sel as usize)
                .unwrap_or(&0),
            MMIO_DRIVER_FEATURES => *self
                .driver_features
                .get(self.driver_feature_sel as usize)
                .unwrap_or(&0),
            MMIO_QUEUE_SEL => self.queue_sel,
            MMIO_QUEUE_NUM_MAX => self
                .selected_queue()
                .map_or(0, |q| u32::from(q.lock().unwrap().max_size)),
            MMIO_QUEUE_NUM => self
                .selected_queue()
                .map_or(0, |q| u32::from(q.lock().unwrap().size)),
            MMIO_QUEUE_READY => self
                .selected_queue()
                .map_or(0, |q| u32::from(q.lock().unwrap().ready)),
            MMIO_INTERRUPT_STATUS => self.irq.status(),
            MMIO_STATUS => self.device_status,
            MMIO_QUEUE_DESC_LOW => self
                .selected_queue()
                .map_or(0, |q| q.lock().unwrap().desc_addr as u32),
            MMIO_QUEUE_DESC_HIGH => self
                .selected_queue()
                .map_or(0, |q| (q.lock().unwrap().desc_addr >> 32) as u32),
            MMIO_QUEUE_DRIVER_LOW => self
                .selected_queue()
                .map_or(0, |q| q.lock().unwrap().avail_addr as u32),
            MMIO_QUEUE_DRIVER_HIGH => self
                .selected_queue()
                .map_or(0, |q| (q.lock().unwrap().avail_addr >> 32) as u32),
            MMIO_QUEUE_DEVICE_LOW => self
                .selected_queue()
                .map_or(0, |q| q.lock().unwrap().used_addr as u32),
            MMIO_QUEUE_DEVICE_HIGH => self
                .selected_queue()
                .map_or(0, |q| (q.lock().unwrap().used_addr >> 32) as u32),
            MMIO_SHM_SEL => self.shm_sel,
            // No shared-memory regions: all-ones signals absence.
            MMIO_SHM_LEN_LOW | MMIO_SHM_LEN_HIGH | MMIO_SHM_BASE_LOW | MMIO_SHM_BASE_HIGH => {
                u32::MAX
            }
            MMIO_CONFIG_GENERATION => self.config_generation,
            _ => {
                warn!(
                    "virtio-mmio {:#x}: unknown register read at {:#x}",
                    self.range.base, offset
                );
                0
            }
        }
    }

    fn write_register(&mut self, offset: u64, value: u32) -> Result<(), VirtioError> {
        match offset {
            MMIO_DEVICE_FEATURES_SEL => self.device_feature_sel = value,
            MMIO_DRIVER_FEATURES => {
                let sel = self.driver_feature_sel as usize;
                if sel < self.driver_features.len() && self.driver_features[sel] != value {
                    self.driver_features[sel] = value;
                    self.bump_config_generation();
                }
                self.maybe_enable()?;
            }
            MMIO_DRIVER_FEATURES_SEL => self.driver_feature_sel = value,
            MMIO_QUEUE_SEL => self.queue_sel = value,
            MMIO_QUEUE_NUM => match self.selected_queue() {
                Some(q) => {
                    let mut q = q.lock().unwrap();
                    if value == 0 || value <= u32::from(q.max_size) {
                        // Zero is the driver walking the size back while
                        // reconfiguring.
                        q.size = value as u16;
                    } else {
                        warn!(
                            "virtio-mmio {:#x}: queue {} size {} exceeds max {}",
                            self.range.base, self.queue_sel, value, q.max_size
                        );
                    }
                }
                None => warn!(
                    "virtio-mmio {:#x}: QUEUE_NUM write with invalid queue {}",
                    self.range.base, self.queue_sel
                ),
            },
            MMIO_QUEUE_PFN => {
                // Legacy transport register. Seeing this means the driver
                // skipped VERSION_1 negotiation; we are modern-only.
                warn!(
                    "virtio-mmio {:#x}: ignoring legacy QUEUE_PFN write ({:#x}); \
                     driver failed VERSION_1 negotiation?",
                    self.range.base, value
                );
            }
            MMIO_QUEUE_READY => {
                let sel = self.queue_sel as u16;
                match self.selected_queue() {
                    Some(q) => {
                        let mut q = q.lock().unwrap();
                        if value & 1 != 0 {
                            if q.size == 0 {
                                return Err(VirtioError::QueueNotReady(sel));
                            }
                            q.ready = true;
                            debug!(
                                "virtio-mmio {:#x}: queue {} ready: size={} desc={:#x} avail={:#x} used={:#x}",
                                self.range.base, sel, q.size, q.desc_addr, q.avail_addr, q.used_addr
                            );
                        } else {
                            q.reset();
                        }
                    }
                    None => return Err(VirtioError::QueueNotReady(sel)),
                }
                self.maybe_enable()?;
            }
            MMIO_QUEUE_NOTIFY => {
                // The guest says the available ring has new entries; any
                // failure surfaces as a failed notify write.
                self.device.on_notify(value as u16)?;
            }
            MMIO_INTERRUPT_ACK => self.irq.ack(value),
            MMIO_STATUS => {
                if value == 0 {
                    self.reset();
                } else {
                    self.device_status = value;
                    self.maybe_enable()?;
                }
            }
            MMIO_QUEUE_DESC_LOW => self.set_queue_addr(|q| &mut q.desc_addr, value, false),
            MMIO_QUEUE_DESC_HIGH => self.set_queue_addr(|q| &mut q.desc_addr, value, true),
            MMIO_QUEUE_DRIVER_LOW => self.set_queue_addr(|q| &mut q.avail_addr, value, false),
            MMIO_QUEUE_DRIVER_HIGH => self.set_queue_addr(|q| &mut q.avail_addr, value, true),
            MMIO_QUEUE_DEVICE_LOW => self.set_queue_addr(|q| &mut q.used_addr, value, false),
            MMIO_QUEUE_DEVICE_HIGH => self.set_queue_addr(|q| &mut q.used_addr, value, true),
            MMIO_SHM_SEL => self.shm_sel = value,
            _ => {
                warn!(
                    "virtio-mmio {:#x}: unknown register write at {:#x} = {:#x}",
                    self.range.base, offset, value
                );
            }
        }
        Ok(())
    }

    fn set_queue_addr(
        &mut self,
        field: impl Fn(&mut VirtQueue) -> &mut u64,
        value: u32,
        high: bool,
    ) {
        if let Some(q) = self.selected_queue() {
            let mut q = q.lock().unwrap();
            let addr = field(&mut *q);
            if high {
                *addr = (*addr & 0x0000_0000_FFFF_FFFF) | (u64::from(value) << 32);
            } else {
                *addr = (*addr & 0xFFFF_FFFF_0000_0000) | u64::from(value);
            }
        }
    }

    /// Capture the register file for persistence.
    pub fn snapshot(&self) -> TransportSnapshot {
        TransportSnapshot {
            device_feature_sel: self.device_feature_sel,
            driver_feature_sel: self.driver_feature_sel,
            device_features: self.device_features,
            driver_features: self.driver_features,
            queue_sel: self.queue_sel,
            device_status: self.device_status,
            interrupt_status: self.irq.status(),
            config_generation: self.config_generation,
            queues: self
                .queues
                .iter()
                .map(|q| {
                    let q = q.lock().unwrap();
                    QueueSnapshot {
                        size: q.size,
                        max_size: q.max_size,
                        ready: q.ready,
                        desc_addr: q.desc_addr,
                        avail_addr: q.avail_addr,
                        used_addr: q.used_addr,
                        last_avail_idx: q.last_avail_idx,
                        used_idx: q.used_idx,
                        enable: self.enabled,
                    }
                })
                .collect(),
        }
    }

    /// Reinstate a snapshot taken by [`snapshot`](Self::snapshot),
    /// re-arming the IRQ line and re-enabling the device handler when the
    /// snapshot was taken from an enabled device.
    pub fn restore(&mut self, snap: &TransportSnapshot) -> Result<(), VirtioError> {
        self.device.on_disable();
        self.enabled = false;

        self.device_feature_sel = snap.device_feature_sel;
        self.driver_feature_sel = snap.driver_feature_sel;
        self.device_features = snap.device_features;
        self.driver_features = snap.driver_features;
        self.queue_sel = snap.queue_sel;
        self.device_status = snap.device_status;
        self.config_generation = snap.config_generation;

        let negotiated = self.driver_features64() & self.device_features64();
        let event_idx = negotiated & super::VIRTIO_RING_F_EVENT_IDX != 0;
        let was_enabled = snap.queues.iter().any(|q| q.enable);
        for (q, qs) in self.queues.iter().zip(&snap.queues) {
            let mut q = q.lock().unwrap();
            q.size = qs.size;
            q.max_size = qs.max_size;
            q.ready = qs.ready;
            q.desc_addr = qs.desc_addr;
            q.avail_addr = qs.avail_addr;
            q.used_addr = qs.used_addr;
            q.last_avail_idx = qs.last_avail_idx;
            q.used_idx = qs.used_idx;
            q.event_idx = event_idx;
        }

        self.irq.restore(snap.interrupt_status);

        if was_enabled {
            self.device
                .on_enable(negotiated, self.queue_handles(), self.irq.clone())?;
            self.enabled = true;
        }
        Ok(())
    }
}

impl MmioDevice for MmioTransport {
    fn read(&mut self, offset: u64, data: &mut [u8]) -> Result<(), VirtioError> {
        if offset >= MMIO_CONFIG {
            self.device.read_config(offset - MMIO_CONFIG, data);
            return Ok(());
        }
        if !matches!(data.len(), 1 | 2 | 4 | 8) {
            return Err(VirtioError::InvalidRegister {
                offset,
                len: data.len(),
            });
        }

        // Registers are 32-bit; align down and deliver the little-endian
        // value truncated to the access width. An 8-byte access spans the
        // adjacent register pair.
        let aligned = offset & !0x3;
        let start = (offset & 0x3) as usize;
        let mut value = u64::from(self.read_register(aligned));
        if start + data.len() > 4 {
            value |= u64::from(self.read_register(aligned + 4)) << 32;
        }
        let bytes = value.to_le_bytes();
        let len = data.len().min(8 - start);
        data[..len].copy_from_slice(&bytes[start..start + len]);
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), VirtioError> {
        if offset >= MMIO_CONFIG {
            if self.device.write_config(offset - MMIO_CONFIG, data) {
                self.bump_config_generation();
            }
            return Ok(());
        }
        if offset & 0x3 != 0 || !matches!(data.len(), 1 | 2 | 4 | 8) {
            return Err(VirtioError::InvalidRegister {
                offset,
                len: data.len(),
            });
        }

        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        let value = u64::from_le_bytes(buf);
        self.write_register(offset, value as u32)?;
        if data.len() == 8 {
            self.write_register(offset + 4, (value >> 32) as u32)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::virtio::{
        INT_VRING, MMIO_CONFIG, STATUS_ACKNOWLEDGE, STATUS_DRIVER, STATUS_DRIVER_OK,
        VIRTIO_F_VERSION_1,
    };
    use crate::guest::MmapGuestBus;

    /// Handler double recording transport callbacks.
    struct TestDevice {
        state: Arc<Mutex<TestDeviceState>>,
    }

    #[derive(Default)]
    struct TestDeviceState {
        enabled: Option<u64>,
        disables: u32,
        notifies: Vec<u16>,
        config: [u8; 8],
    }

    impl TestDevice {
        fn new() -> (Self, Arc<Mutex<TestDeviceState>>) {
            let state = Arc::new(Mutex::new(TestDeviceState {
                config: *b"\x01\x02\x03\x04\x05\x06\x07\x08",
                ..Default::default()
            }));
            (
                Self {
                    state: state.clone(),
                },
                state,
            )
        }
    }

    impl VirtioDeviceHandler for TestDevice {
        fn device_id(&self) -> u32 {
            42
        }

        fn num_queues(&self) -> u16 {
            2
        }

        fn max_queue_size(&self) -> u16 {
            256
        }

        fn device_features(&self) -> u64 {
            VIRTIO_F_VERSION_1 | 0x23
        }

        fn read_config(&self, offset: u64, data: &mut [u8]) {
            let cfg = self.state.lock().unwrap().config;
            for (i, b) in data.iter_mut().enumerate() {
                *b = *cfg.get(offset as usize + i).unwrap_or(&0);
            }
        }

        fn write_config(&mut self, offset: u64, data: &[u8]) -> bool {
            let mut st = self.state.lock().unwrap();
            let mut acked = false;
            for (i, b) in data.iter().enumerate() {
                if let Some(slot) = st.config.get_mut(offset as usize + i) {
                    *slot = *b;
                    acked = true;
                }
            }
            acked
        }

        fn on_enable(
            &mut self,
            features: u64,
            queues: Vec<QueueHandle>,
            _irq: Arc<InterruptLine>,
        ) -> Result<(), VirtioError> {
            assert_eq!(queues.len(), 2);
            self.state.lock().unwrap().enabled = Some(features);
            Ok(())
        }

        fn on_notify(&mut self, queue: u16) -> Result<(), VirtioError> {
            self.state.lock().unwrap().notifies.push(queue);
            Ok(())
        }

        fn on_disable(&mut self) {
            self.state.lock().unwrap().disables += 1;
        }
    }

    fn transport() -> (MmioTransport, Arc<Mutex<TestDeviceState>>) {
        let bus = Arc::new(MmapGuestBus::new(0x10000).unwrap());
        let (dev, state) = TestDevice::new();
        let range = MmioRange {
            base: 0xd000_0000,
            size: 0x1000,
            irq: 5,
        };
        (MmioTransport::new(bus, range, Box::new(dev)), state)
    }

    fn read_u32_reg(t: &mut MmioTransport, offset: u64) -> u32 {
        let mut buf = [0u8; 4];
        t.read(offset, &mut buf).unwrap();
        u32::from_le_bytes(buf)
    }

    fn write_u32_reg(t: &mut MmioTransport, offset: u64, value: u32) {
        t.write(offset, &value.to_le_bytes()).unwrap();
    }

    /// Drive the full driver-side bring-up sequence.
    fn bring_up(t: &mut MmioTransport, features_lo: u32, features_hi: u32) {
        write_u32_reg(t, MMIO_STATUS, STATUS_ACKNOWLEDGE);
        write_u32_reg(t, MMIO_STATUS, STATUS_ACKNOWLEDGE | STATUS_DRIVER);
        write_u32_reg(t, MMIO_DRIVER_FEATURES_SEL, 0);
        write_u32_reg(t, MMIO_DRIVER_FEATURES, features_lo);
        write_u32_reg(t, MMIO_DRIVER_FEATURES_SEL, 1);
        write_u32_reg(t, MMIO_DRIVER_FEATURES, features_hi);
        write_u32_reg(
            t,
            MMIO_STATUS,
            STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_FEATURES_OK,
        );
        for q in 0..2 {
            write_u32_reg(t, MMIO_QUEUE_SEL, q);
            write_u32_reg(t, MMIO_QUEUE_NUM, 8);
            write_u32_reg(t, MMIO_QUEUE_DESC_LOW, 0x1000 + q * 0x100);
            write_u32_reg(t, MMIO_QUEUE_DRIVER_LOW, 0x2000 + q * 0x100);
            write_u32_reg(t, MMIO_QUEUE_DEVICE_LOW, 0x3000 + q * 0x100);
            write_u32_reg(t, MMIO_QUEUE_READY, 1);
        }
        write_u32_reg(
            t,
            MMIO_STATUS,
            STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_FEATURES_OK | STATUS_DRIVER_OK,
        );
    }

    #[test]
    fn test_magic_and_version_read() {
        let (mut t, _) = transport();
        assert_eq!(read_u32_reg(&mut t, MMIO_MAGIC_VALUE), 0x7472_6976);
        assert_eq!(read_u32_reg(&mut t, MMIO_VERSION), 2);
        assert_eq!(read_u32_reg(&mut t, MMIO_DEVICE_ID), 42);
    }

    #[test]
    fn test_feature_negotiation_round_trip() {
        let (mut t, _) = transport();
        // High feature word carries VERSION_1 as bit 0.
        write_u32_reg(&mut t, MMIO_DEVICE_FEATURES_SEL, 1);
        let hi = read_u32_reg(&mut t, MMIO_DEVICE_FEATURES);
        assert_eq!(hi & 1, 1);

        write_u32_reg(&mut t, MMIO_DRIVER_FEATURES_SEL, 1);
        write_u32_reg(&mut t, MMIO_DRIVER_FEATURES, 1);
        assert_eq!(read_u32_reg(&mut t, MMIO_DRIVER_FEATURES), 1);
    }

    #[test]
    fn test_sub_word_and_wide_reads() {
        let (mut t, _) = transport();
        // 2-byte read at MAGIC: low half of "virt".
        let mut buf2 = [0u8; 2];
        t.read(MMIO_MAGIC_VALUE, &mut buf2).unwrap();
        assert_eq!(u16::from_le_bytes(buf2), 0x6976);
        // 1-byte read at offset 2 inside MAGIC.
        let mut buf1 = [0u8; 1];
        t.read(MMIO_MAGIC_VALUE + 2, &mut buf1).unwrap();
        assert_eq!(buf1[0], 0x72);
        // 8-byte read spans MAGIC and VERSION.
        let mut buf8 = [0u8; 8];
        t.read(MMIO_MAGIC_VALUE, &mut buf8).unwrap();
        assert_eq!(u64::from_le_bytes(buf8), (2u64 << 32) | 0x7472_6976);
        // Unsupported width.
        let mut buf3 = [0u8; 3];
        assert!(matches!(
            t.read(MMIO_MAGIC_VALUE, &mut buf3),
            Err(VirtioError::InvalidRegister { .. })
        ));
    }

    #[test]
    fn test_queue_configuration() {
        let (mut t, _) = transport();
        write_u32_reg(&mut t, MMIO_QUEUE_SEL, 1);
        assert_eq!(read_u32_reg(&mut t, MMIO_QUEUE_NUM_MAX), 256);

        // Oversized queue size is rejected, valid one sticks.
        write_u32_reg(&mut t, MMIO_QUEUE_NUM, 512);
        assert_eq!(read_u32_reg(&mut t, MMIO_QUEUE_NUM), 0);
        write_u32_reg(&mut t, MMIO_QUEUE_NUM, 128);
        assert_eq!(read_u32_reg(&mut t, MMIO_QUEUE_NUM), 128);

        // 64-bit ring address assembled from halves.
        write_u32_reg(&mut t, MMIO_QUEUE_DESC_LOW, 0xdead_b000);
        write_u32_reg(&mut t, MMIO_QUEUE_DESC_HIGH, 0x1);
        assert_eq!(read_u32_reg(&mut t, MMIO_QUEUE_DESC_LOW), 0xdead_b000);
        assert_eq!(read_u32_reg(&mut t, MMIO_QUEUE_DESC_HIGH), 0x1);

        // Ready requires a size; clearing ready resets the queue.
        write_u32_reg(&mut t, MMIO_QUEUE_READY, 1);
        assert_eq!(read_u32_reg(&mut t, MMIO_QUEUE_READY), 1);
        write_u32_reg(&mut t, MMIO_QUEUE_READY, 0);
        assert_eq!(read_u32_reg(&mut t, MMIO_QUEUE_READY), 0);
        assert_eq!(read_u32_reg(&mut t, MMIO_QUEUE_NUM), 0);
        assert_eq!(read_u32_reg(&mut t, MMIO_QUEUE_DESC_LOW), 0);
    }

    #[test]
    fn test_queue_ready_without_size_fails() {
        let (mut t, _) = transport();
        write_u32_reg(&mut t, MMIO_QUEUE_SEL, 0);
        let err = t.write(MMIO_QUEUE_READY, &1u32.to_le_bytes());
        assert!(matches!(err, Err(VirtioError::QueueNotReady(0))));
    }

    #[test]
    fn test_enable_after_negotiation() {
        let (mut t, state) = transport();
        bring_up(&mut t, 0x23, 1);
        let enabled = state.lock().unwrap().enabled;
        assert_eq!(enabled, Some(VIRTIO_F_VERSION_1 | 0x23));
    }

    #[test]
    fn test_enable_intersects_features() {
        let (mut t, state) = transport();
        // Driver asks for bits the device never offered.
        bring_up(&mut t, 0xff, 1);
        let enabled = state.lock().unwrap().enabled;
        assert_eq!(enabled, Some(VIRTIO_F_VERSION_1 | 0x23));
    }

    #[test]
    fn test_notify_dispatches() {
        let (mut t, state) = transport();
        bring_up(&mut t, 0x23, 1);
        write_u32_reg(&mut t, MMIO_QUEUE_NOTIFY, 1);
        write_u32_reg(&mut t, MMIO_QUEUE_NOTIFY, 0);
        assert_eq!(state.lock().unwrap().notifies, vec![1, 0]);
    }

    #[test]
    fn test_interrupt_ack_clears_bits() {
        let (mut t, _) = transport();
        t.interrupt().raise(INT_VRING | INT_CONFIG);
        assert_eq!(
            read_u32_reg(&mut t, MMIO_INTERRUPT_STATUS),
            INT_VRING | INT_CONFIG
        );
        write_u32_reg(&mut t, MMIO_INTERRUPT_ACK, INT_VRING);
        assert_eq!(read_u32_reg(&mut t, MMIO_INTERRUPT_STATUS), INT_CONFIG);
    }

    #[test]
    fn test_config_window_read_write() {
        let (mut t, state) = transport();
        let mut buf = [0u8; 4];
        t.read(MMIO_CONFIG, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        // Odd widths and offsets are fine in the config window.
        let mut one = [0u8; 1];
        t.read(MMIO_CONFIG + 5, &mut one).unwrap();
        assert_eq!(one[0], 6);

        let gen_before = read_u32_reg(&mut t, MMIO_CONFIG_GENERATION);
        t.write(MMIO_CONFIG + 2, &[0xaa]).unwrap();
        assert_eq!(state.lock().unwrap().config[2], 0xaa);
        let gen_after = read_u32_reg(&mut t, MMIO_CONFIG_GENERATION);
        assert_eq!(gen_after, gen_before + 1);
        assert_ne!(read_u32_reg(&mut t, MMIO_INTERRUPT_STATUS) & INT_CONFIG, 0);

        // A write past the device's window is not acknowledged: no bump.
        t.write(MMIO_CONFIG + 0x80, &[1]).unwrap();
        assert_eq!(read_u32_reg(&mut t, MMIO_CONFIG_GENERATION), gen_after);
    }

    #[test]
    fn test_shm_reads_all_ones() {
        let (mut t, _) = transport();
        assert_eq!(read_u32_reg(&mut t, MMIO_SHM_LEN_LOW), u32::MAX);
        assert_eq!(read_u32_reg(&mut t, MMIO_SHM_LEN_HIGH), u32::MAX);
        assert_eq!(read_u32_reg(&mut t, MMIO_SHM_BASE_LOW), u32::MAX);
        assert_eq!(read_u32_reg(&mut t, MMIO_SHM_BASE_HIGH), u32::MAX);
    }

    #[test]
    fn test_legacy_queue_pfn_ignored() {
        let (mut t, state) = transport();
        write_u32_reg(&mut t, MMIO_QUEUE_PFN, 0x1234);
        // Nothing blew up, nothing dispatched.
        assert!(state.lock().unwrap().notifies.is_empty());
    }

    #[test]
    fn test_status_zero_resets_everything() {
        let (mut t, state) = transport();
        bring_up(&mut t, 0x23, 1);
        t.interrupt().raise(INT_VRING);

        write_u32_reg(&mut t, MMIO_STATUS, 0);

        assert_eq!(state.lock().unwrap().disables, 1);
        assert_eq!(read_u32_reg(&mut t, MMIO_STATUS), 0);
        assert_eq!(read_u32_reg(&mut t, MMIO_INTERRUPT_STATUS), 0);
        assert_eq!(read_u32_reg(&mut t, MMIO_CONFIG_GENERATION), 0);
        for q in 0..2 {
            write_u32_reg(&mut t, MMIO_QUEUE_SEL, q);
            assert_eq!(read_u32_reg(&mut t, MMIO_QUEUE_NUM), 0);
            assert_eq!(read_u32_reg(&mut t, MMIO_QUEUE_READY), 0);
            assert_eq!(read_u32_reg(&mut t, MMIO_QUEUE_DESC_LOW), 0);
        }
        // The device can be brought up again afterwards.
        bring_up(&mut t, 0x23, 1);
        assert!(state.lock().unwrap().enabled.is_some());
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let (mut t, _) = transport();
        bring_up(&mut t, 0x23, 1);
        // Feature writes during bring-up raised INT_CONFIG; leave only the
        // vring bit pending.
        write_u32_reg(&mut t, MMIO_INTERRUPT_ACK, INT_CONFIG);
        t.interrupt().raise(INT_VRING);
        let snap = t.snapshot();
        assert!(snap.queues.iter().all(|q| q.enable));

        // A fresh transport restored from the snapshot matches it.
        let (mut t2, state2) = transport();
        t2.restore(&snap).unwrap();
        assert_eq!(t2.snapshot(), snap);
        assert_eq!(read_u32_reg(&mut t2, MMIO_INTERRUPT_STATUS), INT_VRING);
        assert!(state2.lock().unwrap().enabled.is_some());
    }
}
