//! # argent-quic: QUIC transport core
//!
//! An RFC 9000/9001/9002 QUIC transport engine (client and server) with
//! the common extensions: ACK frequency and IMMEDIATE_ACK
//! (draft-ietf-quic-ack-frequency), DATAGRAM (RFC 9221), reliable
//! stream reset (draft-ietf-quic-reliable-stream-reset), stream groups,
//! transport knobs, key update and ECN.
//!
//! ## Architecture
//!
//! The core is a pure state machine: no sockets, no event loop, no TLS
//! stack. Four inputs drive it (received datagrams, application
//! requests, timer expirations, socket writability) and it produces
//! datagrams to send, application events, and timer deadlines.
//!
//! ```text
//! argent-quic/
//! ├── types        - VarInt codec, IDs, the injected clock
//! ├── error        - transport error codes, the one Result type
//! ├── settings     - TransportSettings + negotiated parameters
//! ├── frames       - frame sum, zero-copy parse, build
//! ├── packet       - headers, packet numbers, number spaces
//! ├── crypto       - AEAD/header-cipher seams, key phases, handshake
//! ├── token        - Retry / NEW_TOKEN plaintext token codec
//! ├── ack          - per-space ACK engine and ACK-frequency policy
//! ├── stream       - send/recv halves, reassembly, manager, priorities
//! ├── flow_control - stream/connection windows, count limits
//! ├── recovery     - outstanding packets, loss, PTO, BBRv2, pacer
//! ├── connection   - the state machine, CIDs, paths, timers
//! ├── scheduler    - the write loop: packing, probing, batching
//! ├── observer     - sent/acked/lost plumbing, qlog-style sink
//! └── socket       - datagram socket / batch writer adapter seam
//! ```
//!
//! External collaborators are trait objects the embedder injects:
//! [`crypto::CryptoHandshake`] for TLS 1.3, [`socket::DatagramSocket`]
//! for UDP, [`types::Clock`] for time, [`observer::EventLogger`] for
//! structured tracing. Tests drive all of them deterministically.
//!
//! ## Concurrency model
//!
//! Single-threaded cooperative per connection: a [`Connection`] is owned
//! by one executor context and runs to completion between suspension
//! points. Nothing in this crate locks.

#![forbid(unsafe_code)]

pub mod ack;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod observer;
pub mod packet;
pub mod range_set;
pub mod recovery;
pub mod scheduler;
pub mod settings;
pub mod socket;
pub mod stream;
pub mod token;
pub mod types;

pub use connection::{Connection, ConnectionEvent, ConnectionState};
pub use error::{QuicError, Result, TransportErrorCode};
pub use frames::Frame;
pub use packet::{PacketNumberSpace, ProtectionType};
pub use recovery::{bbr2::Bbr2, Bandwidth, CongestionController};
pub use settings::{AckFrequencyPolicy, StreamPriority, TransportParameters, TransportSettings};
pub use stream::StreamManager;
pub use types::{ConnectionId, Instant, Side, StreamDirection, StreamId, VarIntCodec};
