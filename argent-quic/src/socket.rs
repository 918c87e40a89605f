//! Datagram socket adapter seam.
//!
//! The core never opens sockets; it speaks to whatever the embedder
//! provides through [`DatagramSocket`]. Batches are best-effort: once a
//! flush is attempted the outstanding ledger is not rolled back.

#![forbid(unsafe_code)]

use crate::types::Instant;
use bytes::Bytes;
use std::net::SocketAddr;

/// One datagram off the wire.
#[derive(Debug, Clone)]
pub struct ReceivedDatagram {
    pub peer: SocketAddr,
    pub payload: Bytes,

    /// IP TOS byte; the low two bits carry ECN.
    pub tos: u8,

    /// Receive timestamp from the socket layer.
    pub rx_time: Instant,
}

/// Outcome of a batch send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Bytes accepted by the kernel.
    Sent { bytes: usize },

    /// Transient backpressure; retry on writability.
    WouldBlock,

    /// Unrecoverable socket failure; the connection closes with
    /// INTERNAL_ERROR.
    Fatal,
}

/// The UDP socket adapter (external collaborator).
pub trait DatagramSocket: Send {
    /// Send a batch of datagrams to the connected peer, ideally in one
    /// syscall.
    fn send_batch(&mut self, datagrams: &[Bytes]) -> SendOutcome;

    /// Non-blocking receive.
    fn receive(&mut self) -> Option<ReceivedDatagram>;

    /// Kernel supports segmentation offload for equal-size batches.
    fn supports_segmentation(&self) -> bool {
        false
    }

    /// Kernel coalesces receives (GRO).
    fn supports_receive_offload(&self) -> bool {
        false
    }
}

/// Accumulates packets and flushes them in bounded batches.
#[derive(Debug)]
pub struct PacketBatch {
    datagrams: Vec<Bytes>,
    max_batch: usize,
}

impl PacketBatch {
    pub fn new(max_batch: usize) -> Self {
        Self { datagrams: Vec::with_capacity(max_batch), max_batch: max_batch.max(1) }
    }

    /// Queue a datagram; returns `true` when the batch should flush.
    pub fn push(&mut self, datagram: Bytes) -> bool {
        self.datagrams.push(datagram);
        self.datagrams.len() >= self.max_batch
    }

    pub fn is_empty(&self) -> bool {
        self.datagrams.is_empty()
    }

    pub fn len(&self) -> usize {
        self.datagrams.len()
    }

    /// Flush everything queued. Best-effort: queued packets are dropped
    /// from the batch regardless of outcome, matching the no-rollback
    /// contract with the outstanding ledger.
    pub fn flush(&mut self, socket: &mut dyn DatagramSocket) -> SendOutcome {
        if self.datagrams.is_empty() {
            return SendOutcome::Sent { bytes: 0 };
        }
        let outcome = socket.send_batch(&self.datagrams);
        self.datagrams.clear();
        outcome
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory socket capturing outgoing datagrams.
    pub struct MemorySocket {
        pub sent: Vec<Vec<Bytes>>,
        pub rx_queue: VecDeque<ReceivedDatagram>,
        pub would_block: bool,
    }

    impl MemorySocket {
        pub fn new() -> Self {
            Self { sent: Vec::new(), rx_queue: VecDeque::new(), would_block: false }
        }

        pub fn sent_datagrams(&self) -> usize {
            self.sent.iter().map(|b| b.len()).sum()
        }
    }

    impl DatagramSocket for MemorySocket {
        fn send_batch(&mut self, datagrams: &[Bytes]) -> SendOutcome {
            if self.would_block {
                return SendOutcome::WouldBlock;
            }
            let bytes = datagrams.iter().map(|d| d.len()).sum();
            self.sent.push(datagrams.to_vec());
            SendOutcome::Sent { bytes }
        }

        fn receive(&mut self) -> Option<ReceivedDatagram> {
            self.rx_queue.pop_front()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemorySocket;
    use super::*;

    #[test]
    fn batch_flushes_at_capacity() {
        let mut batch = PacketBatch::new(2);
        assert!(!batch.push(Bytes::from_static(b"one")));
        assert!(batch.push(Bytes::from_static(b"two")));

        let mut socket = MemorySocket::new();
        let outcome = batch.flush(&mut socket);
        assert_eq!(outcome, SendOutcome::Sent { bytes: 6 });
        assert!(batch.is_empty());
        assert_eq!(socket.sent.len(), 1);
        assert_eq!(socket.sent[0].len(), 2);
    }

    #[test]
    fn wouldblock_still_clears_batch() {
        // Best-effort: no rollback after a flush attempt.
        let mut batch = PacketBatch::new(4);
        batch.push(Bytes::from_static(b"data"));
        let mut socket = MemorySocket::new();
        socket.would_block = true;
        assert_eq!(batch.flush(&mut socket), SendOutcome::WouldBlock);
        assert!(batch.is_empty());
    }

    #[test]
    fn empty_flush_is_noop() {
        let mut batch = PacketBatch::new(4);
        let mut socket = MemorySocket::new();
        assert_eq!(batch.flush(&mut socket), SendOutcome::Sent { bytes: 0 });
        assert!(socket.sent.is_empty());
    }
}
