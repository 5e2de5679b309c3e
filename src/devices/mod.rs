//! Device emulation for the VMM.

pub mod mmio;
pub mod virtio;
