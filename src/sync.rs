//! Small synchronization primitives shared by the device workers.

use std::sync::mpsc;
use std::sync::{Condvar, Mutex};

/// Counting semaphore.
///
/// The standard library has no semaphore; this is the usual mutex + condvar
/// construction. Used to bound host-side RX injection: a producer acquires a
/// permit per pending packet and the device worker releases it once the
/// packet reaches guest memory or is dropped by a reset.
pub struct Semaphore {
    permits: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cv: Condvar::new(),
        }
    }

    /// Block until a permit is available, then take it.
    pub fn acquire(&self) {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.cv.wait(permits).unwrap();
        }
        *permits -= 1;
    }

    /// Take a permit if one is available.
    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock().unwrap();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Return one permit.
    pub fn release(&self) {
        self.release_n(1);
    }

    /// Return `n` permits at once (reset path).
    pub fn release_n(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut permits = self.permits.lock().unwrap();
        *permits += n;
        if n == 1 {
            self.cv.notify_one();
        } else {
            self.cv.notify_all();
        }
    }

    /// Currently available permits. Racy by nature; test introspection only.
    pub fn available(&self) -> usize {
        *self.permits.lock().unwrap()
    }
}

/// Create a one-shot completion pair.
///
/// Producers posting a message to a device worker block on the receiver half
/// until the worker has drained the operation and reports its result.
pub fn completion<T>() -> (CompletionTx<T>, CompletionRx<T>) {
    let (tx, rx) = mpsc::sync_channel(1);
    (CompletionTx(tx), CompletionRx(rx))
}

pub struct CompletionTx<T>(mpsc::SyncSender<T>);

impl<T> CompletionTx<T> {
    /// Deliver the result, waking the waiting producer.
    pub fn complete(self, value: T) {
        // The producer may have vanished (its thread is being torn down);
        // nothing to deliver to in that case.
        let _ = self.0.send(value);
    }
}

pub struct CompletionRx<T>(mpsc::Receiver<T>);

impl<T> CompletionRx<T> {
    /// Block until the result arrives. `None` means the worker dropped the
    /// completion without responding (it exited).
    pub fn wait(self) -> Option<T> {
        self.0.recv().ok()
    }
}
