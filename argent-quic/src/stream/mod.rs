//! # Stream engine (RFC 9000 Sections 2-3)
//!
//! A stream is two independent half-lives plus its flow-control windows.
//! Unidirectional streams only instantiate the half they own; frames for
//! the missing half are stream-state violations.

#![forbid(unsafe_code)]

pub mod manager;
pub mod recv;
pub mod send;

pub use manager::StreamManager;
pub use recv::{RecvHalf, RecvReset, RecvState};
pub use send::{PendingReset, SendHalf, SendSegment, SendState};

use crate::error::{QuicError, Result, TransportErrorCode};
use crate::flow_control::{RecvWindow, SendWindow};
use crate::settings::StreamPriority;
use crate::types::{Side, StreamDirection, StreamId};

/// Full per-stream state owned by the connection's stream arena.
#[derive(Debug)]
pub struct StreamState {
    pub id: StreamId,

    /// Stream group for group-stream frames; plain streams carry none.
    pub group_id: Option<u64>,

    send: Option<SendHalf>,
    recv: Option<RecvHalf>,

    /// Credit the peer granted us for this stream.
    pub send_window: SendWindow,

    /// Window we advertise to the peer.
    pub recv_window: RecvWindow,

    pub priority: StreamPriority,

    /// STOP_SENDING owed to the peer (set once, resent on loss).
    pub pending_stop_sending: Option<u64>,

    /// Queued in the writable scheduler (owned by the manager).
    pub(crate) queued: bool,
}

impl StreamState {
    pub fn new(
        id: StreamId,
        local_side: Side,
        send_max: u64,
        recv_max: u64,
        priority: StreamPriority,
    ) -> Self {
        let (has_send, has_recv) = match id.direction() {
            StreamDirection::Bidirectional => (true, true),
            StreamDirection::Unidirectional => {
                let ours = id.initiator() == local_side;
                (ours, !ours)
            }
        };
        Self {
            id,
            group_id: None,
            send: has_send.then(SendHalf::default),
            recv: has_recv.then(RecvHalf::default),
            send_window: SendWindow::new(send_max),
            recv_window: RecvWindow::new(recv_max),
            priority,
            pending_stop_sending: None,
            queued: false,
        }
    }

    pub fn send_half(&mut self) -> Result<&mut SendHalf> {
        self.send
            .as_mut()
            .ok_or_else(|| QuicError::new(TransportErrorCode::StreamStateError, "receive-only stream"))
    }

    pub fn recv_half(&mut self) -> Result<&mut RecvHalf> {
        self.recv
            .as_mut()
            .ok_or_else(|| QuicError::new(TransportErrorCode::StreamStateError, "send-only stream"))
    }

    pub fn send_half_opt(&mut self) -> Option<&mut SendHalf> {
        self.send.as_mut()
    }

    pub fn recv_half_opt(&mut self) -> Option<&mut RecvHalf> {
        self.recv.as_mut()
    }

    /// Whether the scheduler has anything to emit here.
    pub fn wants_to_send(&self) -> bool {
        self.send.as_ref().is_some_and(|s| s.wants_to_send())
    }

    /// Both half-lives terminal and nothing left to retransmit.
    pub fn is_closed(&self) -> bool {
        self.send.as_ref().is_none_or(|s| s.is_terminal())
            && self.recv.as_ref().is_none_or(|r| r.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unidirectional_streams_have_one_half() {
        // Client-initiated uni stream (id 2) seen from the client.
        let mut ours = StreamState::new(StreamId::new(2), Side::Client, 100, 100, StreamPriority::default());
        assert!(ours.send_half().is_ok());
        assert!(ours.recv_half().is_err());

        // The same stream seen from the server.
        let mut theirs = StreamState::new(StreamId::new(2), Side::Server, 100, 100, StreamPriority::default());
        assert!(theirs.send_half().is_err());
        assert!(theirs.recv_half().is_ok());
    }

    #[test]
    fn bidirectional_streams_have_both() {
        let mut stream = StreamState::new(StreamId::new(0), Side::Server, 100, 100, StreamPriority::default());
        assert!(stream.send_half().is_ok());
        assert!(stream.recv_half().is_ok());
        assert!(!stream.is_closed());
    }

    #[test]
    fn uni_send_stream_closes_when_delivered() {
        let mut stream = StreamState::new(StreamId::new(2), Side::Client, 100, 100, StreamPriority::default());
        let half = stream.send_half().unwrap();
        half.write(bytes::Bytes::from_static(b"x"), true).unwrap();
        let seg = half.dequeue_segment(10, 10).unwrap();
        half.on_ack(seg.offset, seg.data.len() as u64, true);
        assert!(stream.is_closed());
    }
}
