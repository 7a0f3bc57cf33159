//! Bounded block queues between the audio callbacks and the worker.
//!
//! Two of these connect the duplex boundary to the worker thread: ingress
//! (capture callback → worker) and egress (worker → playback callback). Both
//! are fixed-capacity and drop-on-full; the audio callbacks only ever use the
//! non-blocking operations, so a stalled worker costs dropped blocks, never a
//! missed hardware deadline.
//!
//! Built on `crossbeam_channel::bounded`, whose `try_send` / `recv_timeout` /
//! `try_recv` trio matches the three access patterns exactly.

pub mod block;

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::buffering::block::AudioBlock;

/// Queue capacity: 4 blocks ≈ 1.8 s of audio at the canonical block size.
/// Deep enough to ride out one slow conversion cycle, shallow enough that a
/// persistently slow model surfaces as drops instead of unbounded latency.
pub const QUEUE_CAPACITY: usize = 4;

/// Producer half of a block queue.
#[derive(Clone)]
pub struct BlockProducer {
    tx: Sender<AudioBlock>,
}

/// Consumer half of a block queue.
#[derive(Clone)]
pub struct BlockConsumer {
    rx: Receiver<AudioBlock>,
}

/// Create a matched producer/consumer pair with the given capacity.
pub fn create_block_queue(capacity: usize) -> (BlockProducer, BlockConsumer) {
    let (tx, rx) = bounded(capacity);
    (BlockProducer { tx }, BlockConsumer { rx })
}

impl BlockProducer {
    /// Non-blocking push. Returns `false` when the queue is full (or the
    /// consumer side is gone); the caller is responsible for counting the
    /// drop. Safe to call from the real-time audio callback.
    pub fn try_push(&self, block: AudioBlock) -> bool {
        match self.tx.try_send(block) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Current number of queued blocks.
    pub fn depth(&self) -> usize {
        self.tx.len()
    }
}

impl BlockConsumer {
    /// Bounded-wait pop for the worker thread. Returns `None` after `timeout`
    /// so the caller can re-check its running flag.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<AudioBlock> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Non-blocking pop for the playback callback. `None` means the caller
    /// substitutes silence.
    pub fn try_pop(&self) -> Option<AudioBlock> {
        self.rx.try_recv().ok()
    }

    /// Current number of queued blocks.
    pub fn depth(&self) -> usize {
        self.rx.len()
    }
}
