//! Argon - para-virtualized I/O devices for a user-space hypervisor.
//!
//! This crate implements the device side of the virtio 1.x specification
//! over the MMIO transport: the register file, the split-virtqueue engine,
//! and a virtio-net device on top. The hypervisor plugs in through two
//! narrow seams:
//!
//! - [`guest::GuestBus`]: read/write guest physical memory, toggle an IRQ
//!   line. Everything the devices do to the machine goes through it.
//! - [`devices::mmio::MmioBus`]: routes guest MMIO exits to the device
//!   that owns the address.
//!
//! A typical wiring, with the vCPU loop and backend elided:
//!
//! ```ignore
//! let bus: Arc<dyn GuestBus> = hypervisor_bus();
//! let net = Net::new(NetConfig::default(), bus.clone(), backend)?;
//!
//! let range = MmioRange::allocate(0, 5);
//! let mut mmio = MmioBus::new();
//! mmio.register(range, Box::new(MmioTransport::new(bus, range, Box::new(net.clone()))));
//!
//! // Tell the guest where to look:
//! cmdline.push(discovery::kernel_cmdline_arg(&range));
//!
//! // Host-side ingress:
//! net.enqueue_rx(&frame)?;
//! ```

pub mod devices;
pub mod discovery;
pub mod guest;
pub mod sync;

pub use devices::mmio::{MmioBus, MmioDevice, MmioRange};
pub use devices::virtio::net::{Net, NetBackend, NetConfig, NetDeviceBinder};
pub use devices::virtio::transport::{MmioTransport, TransportSnapshot};
pub use devices::virtio::{VirtioDeviceHandler, VirtioError};
pub use guest::{GuestBus, MmapGuestBus};
