//! End-to-end connection tests over an in-memory wire with scripted
//! handshake and null ciphers: handshake progression, stream delivery,
//! probe cloning, close and idle semantics.

use super::*;
use crate::crypto::testing::null_keys;
use crate::crypto::{CryptoHandshake, EncryptionLevel, HandshakeEvent, KeyDirection};
use crate::recovery::bbr2::Bbr2;
use crate::settings::{AckFrequencyPolicy, TransportParameters, TransportSettings};
use crate::socket::ReceivedDatagram;
use crate::types::{ConnectionId, Instant, Side, StreamDirection};
use bytes::Bytes;
use core::time::Duration;
use rand::rngs::mock::StepRng;
use std::net::SocketAddr;

// ============================================================================
// Scripted handshake driver
// ============================================================================

/// Deterministic TLS stand-in: fixed flights, null key material.
struct TestHandshake {
    side: Side,
    queue: Vec<HandshakeEvent>,
    server_flight_sent: bool,
    client_fin_sent: bool,
}

impl TestHandshake {
    fn new(side: Side) -> Self {
        Self { side, queue: Vec::new(), server_flight_sent: false, client_fin_sent: false }
    }

    fn keys(&mut self, level: EncryptionLevel) {
        self.queue.push(HandshakeEvent::KeysAvailable {
            level,
            direction: KeyDirection::Read,
            keys: null_keys(),
        });
        self.queue.push(HandshakeEvent::KeysAvailable {
            level,
            direction: KeyDirection::Write,
            keys: null_keys(),
        });
    }

    fn peer_params() -> TransportParameters {
        TransportParameters {
            initial_max_data: 1 << 20,
            initial_max_stream_data_bidi_local: 1 << 20,
            initial_max_stream_data_bidi_remote: 1 << 20,
            initial_max_stream_data_uni: 1 << 20,
            initial_max_streams_bidi: 16,
            initial_max_streams_uni: 16,
            active_connection_id_limit: 4,
            max_datagram_frame_size: 65535,
            ..TransportParameters::default()
        }
    }
}

impl CryptoHandshake for TestHandshake {
    fn install_initial_keys(&mut self, _dcid: &ConnectionId) -> crate::error::Result<()> {
        self.keys(EncryptionLevel::Initial);
        if self.side.is_client() {
            self.queue.push(HandshakeEvent::TransmitCryptoData {
                level: EncryptionLevel::Initial,
                data: Bytes::from_static(b"client-hello"),
            });
        }
        Ok(())
    }

    fn feed(&mut self, level: EncryptionLevel, _data: &[u8]) -> crate::error::Result<()> {
        match (self.side, level) {
            (Side::Server, EncryptionLevel::Initial) if !self.server_flight_sent => {
                self.server_flight_sent = true;
                self.queue.push(HandshakeEvent::TransmitCryptoData {
                    level: EncryptionLevel::Initial,
                    data: Bytes::from_static(b"server-hello"),
                });
                self.keys(EncryptionLevel::Handshake);
                self.queue.push(HandshakeEvent::TransmitCryptoData {
                    level: EncryptionLevel::Handshake,
                    data: Bytes::from_static(b"ee-cert-cv-fin"),
                });
                self.keys(EncryptionLevel::OneRtt);
                self.queue
                    .push(HandshakeEvent::PeerTransportParameters(Self::peer_params()));
            }
            (Side::Server, EncryptionLevel::Handshake) => {
                self.queue.push(HandshakeEvent::HandshakeDone);
            }
            (Side::Client, EncryptionLevel::Initial) => {
                self.keys(EncryptionLevel::Handshake);
            }
            (Side::Client, EncryptionLevel::Handshake) if !self.client_fin_sent => {
                self.client_fin_sent = true;
                self.keys(EncryptionLevel::OneRtt);
                self.queue
                    .push(HandshakeEvent::PeerTransportParameters(Self::peer_params()));
                self.queue.push(HandshakeEvent::TransmitCryptoData {
                    level: EncryptionLevel::Handshake,
                    data: Bytes::from_static(b"client-fin"),
                });
                self.queue.push(HandshakeEvent::HandshakeDone);
            }
            _ => {}
        }
        Ok(())
    }

    fn poll(&mut self) -> Vec<HandshakeEvent> {
        core::mem::take(&mut self.queue)
    }
}

// ============================================================================
// Harness
// ============================================================================

fn client_addr() -> SocketAddr {
    "192.0.2.1:50000".parse().unwrap()
}

fn server_addr() -> SocketAddr {
    "192.0.2.2:4433".parse().unwrap()
}

fn test_settings() -> TransportSettings {
    TransportSettings {
        // Ack every ack-eliciting packet so the tests converge quickly.
        ack_frequency: AckFrequencyPolicy {
            ack_eliciting_threshold: 1,
            ..AckFrequencyPolicy::default()
        },
        opportunistic_acking: true,
        ..TransportSettings::default()
    }
}

fn new_pair(now: Instant) -> (Connection, Connection) {
    let settings = test_settings();
    let client_scid = ConnectionId::from_slice(&[1; 8]).unwrap();
    let server_scid = ConnectionId::from_slice(&[2; 8]).unwrap();
    let initial_dcid = ConnectionId::from_slice(&[3; 8]).unwrap();

    let client = Connection::new_client(
        client_scid.clone(),
        initial_dcid.clone(),
        server_addr(),
        settings.clone(),
        Box::new(TestHandshake::new(Side::Client)),
        Box::new(Bbr2::new(&settings, Box::new(StepRng::new(1, 7)))),
        Box::new(StepRng::new(9, 5)),
        Box::new(crate::observer::NullObserver),
        now,
    )
    .unwrap();

    let server = Connection::new_server(
        server_scid,
        initial_dcid,
        client_scid,
        client_addr(),
        settings.clone(),
        Box::new(TestHandshake::new(Side::Server)),
        Box::new(Bbr2::new(&settings, Box::new(StepRng::new(3, 7)))),
        Box::new(StepRng::new(11, 5)),
        Box::new(crate::observer::NullObserver),
        now,
    )
    .unwrap();

    (client, server)
}

fn deliver(from: &mut Connection, to: &mut Connection, now: Instant) -> usize {
    let mut out = Vec::new();
    from.poll_transmit(now, &mut out);
    let peer = match from.side() {
        Side::Client => client_addr(),
        Side::Server => server_addr(),
    };
    let n = out.len();
    for payload in out {
        to.on_datagram(&ReceivedDatagram { peer, payload, tos: 0, rx_time: now });
    }
    n
}

fn establish(client: &mut Connection, server: &mut Connection, now: Instant) {
    for _ in 0..8 {
        deliver(client, server, now);
        deliver(server, client, now);
        if client.is_established() && server.is_established() {
            return;
        }
    }
    panic!(
        "handshake did not converge: client {:?}, server {:?}",
        client.state(),
        server.state()
    );
}

fn drain_events(conn: &mut Connection) -> Vec<ConnectionEvent> {
    let mut events = Vec::new();
    while let Some(e) = conn.poll_event() {
        events.push(e);
    }
    events
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn handshake_establishes_both_sides() {
    let now = Instant::from_millis(0);
    let (mut client, mut server) = new_pair(now);
    establish(&mut client, &mut server, now);

    assert!(drain_events(&mut client)
        .iter()
        .any(|e| matches!(e, ConnectionEvent::HandshakeComplete)));
    assert!(drain_events(&mut server)
        .iter()
        .any(|e| matches!(e, ConnectionEvent::HandshakeComplete)));
}

#[test]
fn client_initial_is_padded() {
    let now = Instant::from_millis(0);
    let (mut client, _server) = new_pair(now);
    let mut out = Vec::new();
    client.poll_transmit(now, &mut out);
    assert!(!out.is_empty());
    assert!(out[0].len() >= 1200, "client initial was {} bytes", out[0].len());
}

#[test]
fn stream_data_round_trip() {
    let now = Instant::from_millis(0);
    let (mut client, mut server) = new_pair(now);
    establish(&mut client, &mut server, now);
    drain_events(&mut client);
    drain_events(&mut server);

    let id = client.open_stream(StreamDirection::Bidirectional).unwrap();
    client
        .stream_write(id, Bytes::from_static(b"hello over quic"), true)
        .unwrap();
    deliver(&mut client, &mut server, now);

    let events = drain_events(&mut server);
    assert!(events
        .iter()
        .any(|e| matches!(e, ConnectionEvent::StreamReadable(got) if *got == id)));

    let (data, fin) = server.stream_read(id, 1024).unwrap();
    assert_eq!(&data[..], b"hello over quic");
    assert!(fin);

    // The server answers on the same stream.
    server
        .stream_write(id, Bytes::from_static(b"ack from server"), true)
        .unwrap();
    deliver(&mut server, &mut client, now);
    let (data, fin) = client.stream_read(id, 1024).unwrap();
    assert_eq!(&data[..], b"ack from server");
    assert!(fin);
}

#[test]
fn pto_probe_clones_and_delivery_counts_once() {
    let now = Instant::from_millis(0);
    let (mut client, mut server) = new_pair(now);
    establish(&mut client, &mut server, now);
    // Settle handshake-era retransmission state.
    deliver(&mut client, &mut server, now);
    deliver(&mut server, &mut client, now);
    drain_events(&mut client);
    drain_events(&mut server);

    let id = client.open_stream(StreamDirection::Bidirectional).unwrap();
    client.stream_write(id, Bytes::from_static(b"probe me"), true).unwrap();

    // First transmission is withheld (simulated loss).
    let mut withheld = Vec::new();
    client.poll_transmit(now, &mut withheld);
    assert!(!withheld.is_empty());

    // PTO fires; a probe carrying the same stream bytes goes out.
    let pto_at = client.next_timeout().expect("loss timer armed");
    client.on_timeout(pto_at);
    let mut probes = Vec::new();
    client.poll_transmit(pto_at, &mut probes);
    assert!(!probes.is_empty(), "PTO produced no probe");

    // The probe reaches the server; its ACK satisfies delivery.
    for payload in probes {
        server.on_datagram(&ReceivedDatagram {
            peer: client_addr(),
            payload,
            tos: 0,
            rx_time: pto_at,
        });
    }
    let events = drain_events(&mut server);
    assert!(events
        .iter()
        .any(|e| matches!(e, ConnectionEvent::StreamReadable(got) if *got == id)));
    let (data, fin) = server.stream_read(id, 64).unwrap();
    assert_eq!(&data[..], b"probe me");
    assert!(fin);
    deliver(&mut server, &mut client, pto_at);

    let client_events = drain_events(&mut client);
    assert!(client_events
        .iter()
        .any(|e| matches!(e, ConnectionEvent::StreamWritable(got) if *got == id)));

    // The withheld original arrives late: the server trims the duplicate
    // and re-acks; the client must not double-count the clone family.
    let late = pto_at + core::time::Duration::from_millis(5);
    for payload in withheld {
        server.on_datagram(&ReceivedDatagram {
            peer: client_addr(),
            payload,
            tos: 0,
            rx_time: late,
        });
    }
    deliver(&mut server, &mut client, late);
    // One StreamWritable was already observed; delivery must not fire again.
    assert!(!drain_events(&mut client)
        .iter()
        .any(|e| matches!(e, ConnectionEvent::StreamWritable(_))));
}

#[test]
fn datagram_frames_flow() {
    let now = Instant::from_millis(0);
    let (mut client, mut server) = new_pair(now);
    establish(&mut client, &mut server, now);
    drain_events(&mut server);

    client.send_datagram(Bytes::from_static(b"fire and forget")).unwrap();
    deliver(&mut client, &mut server, now);

    let events = drain_events(&mut server);
    assert!(events.iter().any(
        |e| matches!(e, ConnectionEvent::DatagramReceived(d) if &d[..] == b"fire and forget")
    ));
}

#[test]
fn knob_frames_reach_peer() {
    let now = Instant::from_millis(0);
    let (mut client, mut server) = new_pair(now);
    establish(&mut client, &mut server, now);
    drain_events(&mut server);

    client.send_knob(0xccaa, 7, Bytes::from_static(b"42")).unwrap();
    deliver(&mut client, &mut server, now);

    let events = drain_events(&mut server);
    assert!(events.iter().any(|e| matches!(
        e,
        ConnectionEvent::KnobReceived { knob_space: 0xccaa, id: 7, blob } if &blob[..] == b"42"
    )));
}

#[test]
fn close_propagates_and_drains() {
    let now = Instant::from_millis(0);
    let (mut client, mut server) = new_pair(now);
    establish(&mut client, &mut server, now);

    client.close(0x17, "done here", now);
    assert_eq!(client.state(), ConnectionState::Closing);
    deliver(&mut client, &mut server, now);
    // Sending the CONNECTION_CLOSE moves the closer into draining.
    assert_eq!(client.state(), ConnectionState::Draining);
    assert_eq!(server.state(), ConnectionState::Draining);

    let events = drain_events(&mut server);
    assert!(events.iter().any(|e| matches!(
        e,
        ConnectionEvent::ConnectionClosed { error_code: 0x17, is_application: true, .. }
    )));

    // The drain timer takes both to Closed.
    let deadline = client.next_timeout().expect("drain timer armed");
    client.on_timeout(deadline);
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[test]
fn idle_timeout_closes_directly() {
    let now = Instant::from_millis(0);
    let (mut client, mut server) = new_pair(now);
    establish(&mut client, &mut server, now);

    let idle = test_settings().idle_timeout;
    client.on_timeout(now + idle + core::time::Duration::from_millis(1));
    assert_eq!(client.state(), ConnectionState::Closed);
    let _ = server;
}

#[test]
fn stream_reset_reaches_application() {
    let now = Instant::from_millis(0);
    let (mut client, mut server) = new_pair(now);
    establish(&mut client, &mut server, now);
    drain_events(&mut server);

    let id = client.open_stream(StreamDirection::Bidirectional).unwrap();
    client.stream_write(id, Bytes::from_static(b"partial"), false).unwrap();
    deliver(&mut client, &mut server, now);
    drain_events(&mut server);

    client.reset_stream(id, 0x99, None).unwrap();
    deliver(&mut client, &mut server, now);

    let events = drain_events(&mut server);
    assert!(events.iter().any(
        |e| matches!(e, ConnectionEvent::StreamReset { id: got, error_code: 0x99 } if *got == id)
    ));
}

#[test]
fn flow_control_window_updates_flow_back() {
    let now = Instant::from_millis(0);
    let (mut client, mut server) = new_pair(now);
    establish(&mut client, &mut server, now);
    drain_events(&mut server);

    let id = client.open_stream(StreamDirection::Bidirectional).unwrap();
    // Push enough data through that reading it drops the server's
    // headroom below half a window.
    let chunk = Bytes::from(vec![0x61u8; 700 * 1024]);
    client.stream_write(id, chunk, false).unwrap();

    // Advance time each round so pacing tokens refill.
    let mut t = now;
    for _ in 0..400 {
        t = t + Duration::from_millis(25);
        deliver(&mut client, &mut server, t);
        loop {
            let (data, _) = server.stream_read(id, usize::MAX).unwrap();
            if data.is_empty() {
                break;
            }
        }
        deliver(&mut server, &mut client, t);
        let raised = client
            .streams
            .get(id)
            .is_some_and(|s| s.send_window.peer_max() > 1 << 20);
        if raised {
            return;
        }
    }
    panic!("stream window was never raised above the initial 1 MiB");
}
