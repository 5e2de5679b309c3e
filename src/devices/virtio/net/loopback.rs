//! Loopback backend: every transmitted frame is re-injected as RX.
//!
//! Mostly a test vehicle, but also the reference for how a backend binds
//! back to its device. Re-injection cannot happen on the device worker
//! (the worker is the one calling `handle_tx`, and `enqueue_rx` waits for
//! it), so frames hop through a pump thread.

use std::io;
use std::sync::{mpsc, Mutex};
use std::thread;

use log::warn;

use super::pool::TxPacket;
use super::{Net, NetBackend, NetDeviceBinder};

pub struct LoopbackBackend {
    frames: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(None),
        }
    }
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NetBackend for LoopbackBackend {
    fn handle_tx(&self, packet: TxPacket) -> io::Result<()> {
        let frames = self.frames.lock().unwrap();
        match &*frames {
            Some(tx) => tx
                .send(packet.to_vec())
                .map_err(|_| io::Error::other("loopback pump is gone")),
            None => Err(io::Error::other("loopback backend not bound")),
        }
        // `packet` drops here, returning the buffer to the pool.
    }
}

impl NetDeviceBinder for LoopbackBackend {
    fn bind(&self, net: &Net) {
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        // The pump holds only a weak handle; a strong one would keep the
        // device (and through it this backend) alive forever.
        let weak = net.downgrade();
        let spawned = thread::Builder::new()
            .name("virtio-net-loopback".into())
            .spawn(move || {
                while let Ok(frame) = rx.recv() {
                    let Some(net) = weak.upgrade() else {
                        break;
                    };
                    if let Err(e) = net.enqueue_rx(&frame) {
                        warn!("loopback: dropping frame: {e}");
                    }
                }
            });
        match spawned {
            Ok(_) => *self.frames.lock().unwrap() = Some(tx),
            Err(e) => warn!("loopback: failed to spawn pump thread: {e}"),
        }
    }
}
