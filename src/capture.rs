//! Hand-off of PCM buffers between the capture interrupt and the recording task.
//!
//! Every buffer is owned by exactly one side at a time: it moves by value through two lock-free
//! single-producer/single-consumer queues. The interrupt side only ever dequeues an empty buffer
//! and enqueues a filled one, both O(1) and non-blocking, and never touches flash.
//!
//! ```text
//!            free  (task -> interrupt)
//!   TaskEnd ───────────────────────────▶ CaptureEnd
//!           ◀───────────────────────────
//!            ready (interrupt -> task)
//! ```

use crate::{PCM_SAMPLES_PER_BUF, PCMBUF_NUM};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use heapless::spsc::{Consumer, Producer, Queue};

// one spare slot, a heapless spsc queue of size N holds N - 1 elements
const QUEUE_SIZE: usize = PCMBUF_NUM + 1;

/// A fixed-size capture buffer.
pub struct PcmTransaction {
    id: u8,
    filled: bool,
    samples: [i16; PCM_SAMPLES_PER_BUF],
}

impl PcmTransaction {
    const fn new(id: u8) -> Self {
        Self {
            id,
            filled: false,
            samples: [0; PCM_SAMPLES_PER_BUF],
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Whether the buffer went through [`CaptureEnd::complete`] rather than
    /// [`CaptureEnd::release`].
    pub fn is_filled(&self) -> bool {
        self.filled
    }

    pub fn samples(&self) -> &[i16; PCM_SAMPLES_PER_BUF] {
        &self.samples
    }

    /// Destination for the capture hardware.
    pub fn samples_mut(&mut self) -> &mut [i16; PCM_SAMPLES_PER_BUF] {
        &mut self.samples
    }
}

/// Backing storage of the hand-off, usually placed in a `static`.
pub struct PcmChannel {
    free: Queue<PcmTransaction, QUEUE_SIZE>,
    ready: Queue<PcmTransaction, QUEUE_SIZE>,
    pending: AtomicBool,
    overruns: AtomicU32,
}

impl Default for PcmChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl PcmChannel {
    pub const fn new() -> Self {
        Self {
            free: Queue::new(),
            ready: Queue::new(),
            pending: AtomicBool::new(false),
            overruns: AtomicU32::new(0),
        }
    }

    /// Splits the channel into its two ends and hands all [`PCMBUF_NUM`] buffers to the capture
    /// side. Call once.
    pub fn split(&mut self) -> (CaptureEnd<'_>, TaskEnd<'_>) {
        let (mut free_tx, free_rx) = self.free.split();
        let (ready_tx, ready_rx) = self.ready.split();

        for id in 0..PCMBUF_NUM {
            // the queue is sized for the whole pool
            let _ = free_tx.enqueue(PcmTransaction::new(id as u8));
        }

        (
            CaptureEnd {
                free: free_rx,
                ready: ready_tx,
                pending: &self.pending,
                overruns: &self.overruns,
            },
            TaskEnd {
                free: free_tx,
                ready: ready_rx,
                pending: &self.pending,
                overruns: &self.overruns,
            },
        )
    }
}

/// Interrupt side of the hand-off.
pub struct CaptureEnd<'a> {
    free: Consumer<'a, PcmTransaction, QUEUE_SIZE>,
    ready: Producer<'a, PcmTransaction, QUEUE_SIZE>,
    pending: &'a AtomicBool,
    overruns: &'a AtomicU32,
}

impl CaptureEnd<'_> {
    /// Takes the next empty buffer. `None` means the task fell behind and capture stalls; each
    /// such event is counted as an overrun.
    pub fn acquire(&mut self) -> Option<PcmTransaction> {
        let txn = self.free.dequeue();
        if txn.is_none() {
            // single writer, a plain load/store keeps this usable without CAS
            let overruns = self.overruns.load(Ordering::Relaxed);
            self.overruns.store(overruns.wrapping_add(1), Ordering::Relaxed);
        }
        txn
    }

    /// Passes a filled buffer to the task and wakes it.
    pub fn complete(&mut self, mut txn: PcmTransaction) {
        txn.filled = true;
        // cannot fail, the queue is sized for the whole pool
        let _ = self.ready.enqueue(txn);
        self.pending.store(true, Ordering::Release);
    }

    /// Gives back a buffer that was not filled, e.g. when capture stops mid-transfer.
    pub fn release(&mut self, mut txn: PcmTransaction) {
        txn.filled = false;
        let _ = self.ready.enqueue(txn);
    }
}

/// Task side of the hand-off.
pub struct TaskEnd<'a> {
    free: Producer<'a, PcmTransaction, QUEUE_SIZE>,
    ready: Consumer<'a, PcmTransaction, QUEUE_SIZE>,
    pending: &'a AtomicBool,
    overruns: &'a AtomicU32,
}

impl TaskEnd<'_> {
    pub fn take_ready(&mut self) -> Option<PcmTransaction> {
        self.ready.dequeue()
    }

    /// Returns a consumed buffer to the capture side.
    pub fn recycle(&mut self, txn: PcmTransaction) {
        let _ = self.free.enqueue(txn);
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Whether the capture side signalled since the last [`TaskEnd::clear_wake`].
    pub fn is_woken(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub fn clear_wake(&self) {
        self.pending.store(false, Ordering::Release);
    }

    pub fn overruns(&self) -> u32 {
        self.overruns.load(Ordering::Relaxed)
    }
}

/// Control surface of the capture hardware, driven from the recording task.
///
/// After [`Capture::stop`] returns the hardware must not hold any buffer anymore: every buffer
/// it took via [`CaptureEnd::acquire`] has been passed back through `complete` or `release`.
/// Stopping an already stopped device does nothing.
pub trait Capture {
    fn start(&mut self);
    fn stop(&mut self);
}

impl<T: Capture> Capture for &mut T {
    fn start(&mut self) {
        (*self).start()
    }

    fn stop(&mut self) {
        (*self).stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_move_between_ends() {
        let mut channel = PcmChannel::new();
        let (mut isr, mut task) = channel.split();

        let mut txn = isr.acquire().unwrap();
        txn.samples_mut()[0] = 42;
        isr.complete(txn);
        assert!(task.is_woken());
        assert_eq!(task.ready_count(), 1);

        let txn = task.take_ready().unwrap();
        assert!(txn.is_filled());
        assert_eq!(txn.samples()[0], 42);
        task.clear_wake();
        task.recycle(txn);
        assert!(!task.is_woken());
        assert!(task.take_ready().is_none());
    }

    #[test]
    fn exhausted_pool_counts_overruns() {
        let mut channel = PcmChannel::new();
        let (mut isr, task) = channel.split();

        let mut held = Vec::new();
        for _ in 0..PCMBUF_NUM {
            held.push(isr.acquire().unwrap());
        }
        assert!(isr.acquire().is_none());
        assert!(isr.acquire().is_none());
        assert_eq!(task.overruns(), 2);

        let ids: Vec<u8> = held.iter().map(|t| t.id()).collect();
        assert_eq!(ids, (0..PCMBUF_NUM as u8).collect::<Vec<_>>());
    }

    #[test]
    fn released_buffers_are_not_filled() {
        let mut channel = PcmChannel::new();
        let (mut isr, mut task) = channel.split();

        let txn = isr.acquire().unwrap();
        isr.release(txn);
        assert!(!task.is_woken());
        assert!(!task.take_ready().unwrap().is_filled());
    }
}
