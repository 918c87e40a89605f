//! # Connection state machine (RFC 9000 Sections 5, 9, 10)
//!
//! The connection is a pure state machine driven by received datagrams,
//! application requests, timer expirations and socket writability. It
//! owns every subsystem: packet number spaces with their ACK trackers
//! and crypto streams, the stream arena, recovery and congestion state,
//! CID and path lifecycles, and the timer table.
//!
//! Protocol errors are `Result`s everywhere below; this module's
//! dispatch entry points are the single place they are caught and turned
//! into the `Closing` transition.

#![forbid(unsafe_code)]

pub mod cid;
pub mod path;
#[cfg(test)]
mod tests;
pub mod timers;

pub use cid::{CidManager, SelfCid};
pub use path::PathState;
pub use timers::{TimerKind, TimerTable};

use crate::ack::{AckTracker, Ecn, ReceivedDisposition};
use crate::crypto::{
    unprotect_header, CryptoHandshake, EncryptionLevel, HandshakeEvent, KeyDirection, KeyPhase,
    OneRttKeys, PacketKeys,
};
use crate::error::{QuicError, Result, TransportErrorCode};
use crate::flow_control::{RecvWindow, SendWindow};
use crate::frames::{
    AckFrame, ConnectionCloseFrame, Frame, FrameDecoder, ResetStreamFrame,
};
use crate::packet::{
    decode_packet_number, header::KEY_PHASE_BIT, parse_packet, LongHeaderType, PacketHeader,
    PacketNumberSpace, ProtectionType,
};
use crate::recovery::{
    pacer::Pacer, CongestionController, CongestionSignal, OutstandingPacket, Recovery, SentFrame,
    TimerVerdict,
};
use crate::settings::{TransportParameters, TransportSettings};
use crate::socket::ReceivedDatagram;
use crate::stream::{RecvHalf, SendHalf, StreamManager};
use crate::types::{
    ConnectionId, Instant, PacketNumber, Side, StreamDirection, StreamId,
};
use crate::observer::TransportObserver;
use bytes::Bytes;
use core::time::Duration;
use rand::RngCore;
use std::collections::VecDeque;
use std::net::SocketAddr;

/// Connection lifecycle (RFC 9000 Section 10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Established,
    Closing,
    Draining,
    Closed,
}

/// Callbacks surfaced to the application, drained via
/// [`Connection::poll_event`].
#[derive(Debug)]
pub enum ConnectionEvent {
    HandshakeComplete,
    StreamReadable(StreamId),
    StreamWritable(StreamId),
    StreamReset { id: StreamId, error_code: u64 },
    StopSendingReceived { id: StreamId, error_code: u64 },
    DatagramReceived(Bytes),
    NewTokenReceived(Bytes),
    KnobReceived { knob_space: u64, id: u64, blob: Bytes },
    ConnectionClosed { error_code: u64, is_application: bool, reason: String },
}

/// Close in progress.
#[derive(Debug, Clone)]
pub(crate) struct CloseState {
    pub error_code: u64,
    pub is_application: bool,
    pub frame_type: Option<u64>,
    pub reason: Bytes,
    pub needs_send: bool,
}

/// Per-space send/receive state (RFC 9000 Section 12.3): packet number
/// counters, the ACK tracker, the CRYPTO stream halves and the keys.
pub(crate) struct PacketSpace {
    pub next_pn: PacketNumber,
    pub acks: AckTracker,
    pub crypto_send: SendHalf,
    pub crypto_recv: RecvHalf,
    pub read_keys: Option<PacketKeys>,
    pub write_keys: Option<PacketKeys>,
    pub discarded: bool,
}

impl PacketSpace {
    fn new(settings: &TransportSettings) -> Self {
        Self {
            next_pn: 0,
            acks: AckTracker::new(settings.ack_frequency, settings.max_ack_delay),
            crypto_send: SendHalf::default(),
            crypto_recv: RecvHalf::default(),
            read_keys: None,
            write_keys: None,
            discarded: false,
        }
    }
}

pub struct Connection {
    pub(crate) side: Side,
    pub(crate) state: ConnectionState,
    pub(crate) settings: TransportSettings,
    pub(crate) peer_params: Option<TransportParameters>,

    pub(crate) spaces: [PacketSpace; 3],
    pub(crate) one_rtt: OneRttKeys,
    pub(crate) handshake: Box<dyn CryptoHandshake>,
    pub(crate) handshake_complete: bool,
    pub(crate) pending_handshake_done: bool,

    pub(crate) streams: StreamManager,
    pub(crate) conn_send_window: SendWindow,
    pub(crate) conn_recv_window: RecvWindow,

    pub(crate) recovery: Recovery,
    pub(crate) congestion: Box<dyn CongestionController>,
    pub(crate) pacer: Pacer,

    pub(crate) cids: CidManager,
    pub(crate) path: PathState,
    pub(crate) probing_path: Option<PathState>,

    pub(crate) timers: TimerTable,
    pub(crate) rng: Box<dyn RngCore + Send>,
    pub(crate) observer: Box<dyn TransportObserver>,

    pub(crate) events: VecDeque<ConnectionEvent>,
    pub(crate) close: Option<CloseState>,

    pub(crate) datagrams_rx: VecDeque<Bytes>,
    pub(crate) datagrams_tx: VecDeque<Bytes>,

    pub(crate) pending_ping: bool,
    pub(crate) pending_immediate_ack: bool,
    pub(crate) probes_due: Option<(PacketNumberSpace, usize)>,
    pub(crate) pending_cid_reissues: Vec<u64>,
    pub(crate) pending_ack_frequency: Option<crate::frames::AckFrequencyFrame>,
    pub(crate) ack_frequency_seq: u64,
    pub(crate) pending_knobs: VecDeque<(u64, u64, Bytes)>,

    pub(crate) decoder: FrameDecoder,
    pub(crate) token: Option<Bytes>,
    pub(crate) last_activity: Instant,

    /// Highest ECN-CE count the peer has reported back; increases are
    /// treated as congestion signals.
    pub(crate) peer_reported_ce: u64,
}

impl Connection {
    /// Build a client connection; the handshake driver starts immediately
    /// via Initial keys derived from `dcid`.
    #[allow(clippy::too_many_arguments)]
    pub fn new_client(
        scid: ConnectionId,
        dcid: ConnectionId,
        peer: SocketAddr,
        settings: TransportSettings,
        mut handshake: Box<dyn CryptoHandshake>,
        congestion: Box<dyn CongestionController>,
        rng: Box<dyn RngCore + Send>,
        observer: Box<dyn TransportObserver>,
        now: Instant,
    ) -> Result<Self> {
        handshake.install_initial_keys(&dcid)?;
        let mut conn = Self::build(
            Side::Client,
            scid,
            dcid,
            peer,
            true,
            settings,
            handshake,
            congestion,
            rng,
            observer,
            now,
        );
        conn.pump_handshake(now)?;
        Ok(conn)
    }

    /// Build a server connection for an accepted Initial.
    #[allow(clippy::too_many_arguments)]
    pub fn new_server(
        scid: ConnectionId,
        client_dcid: ConnectionId,
        client_scid: ConnectionId,
        peer: SocketAddr,
        settings: TransportSettings,
        mut handshake: Box<dyn CryptoHandshake>,
        congestion: Box<dyn CongestionController>,
        rng: Box<dyn RngCore + Send>,
        observer: Box<dyn TransportObserver>,
        now: Instant,
    ) -> Result<Self> {
        handshake.install_initial_keys(&client_dcid)?;
        let mut conn = Self::build(
            Side::Server,
            scid,
            client_scid,
            peer,
            false,
            settings,
            handshake,
            congestion,
            rng,
            observer,
            now,
        );
        conn.pump_handshake(now)?;
        Ok(conn)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        side: Side,
        scid: ConnectionId,
        peer_cid: ConnectionId,
        peer: SocketAddr,
        path_validated: bool,
        settings: TransportSettings,
        handshake: Box<dyn CryptoHandshake>,
        congestion: Box<dyn CongestionController>,
        mut rng: Box<dyn RngCore + Send>,
        observer: Box<dyn TransportObserver>,
        now: Instant,
    ) -> Self {
        let mut reset_token = [0u8; 16];
        rng.fill_bytes(&mut reset_token);
        let self_cid = SelfCid { sequence: 0, cid: scid, reset_token, retired: false };
        let mss = settings.max_udp_payload_size as u64;
        let initial_burst = settings.init_cwnd_in_mss * mss;
        let mut conn = Self {
            side,
            state: ConnectionState::Handshaking,
            spaces: [
                PacketSpace::new(&settings),
                PacketSpace::new(&settings),
                PacketSpace::new(&settings),
            ],
            one_rtt: OneRttKeys::default(),
            handshake,
            handshake_complete: false,
            pending_handshake_done: false,
            streams: StreamManager::new(side, &settings),
            conn_send_window: SendWindow::new(0),
            conn_recv_window: RecvWindow::new(settings.initial_max_data),
            recovery: Recovery::new(
                Duration::from_millis(333),
                settings.max_ack_delay,
                settings.use_adaptive_loss_reordering_thresholds,
                settings.use_inflight_reordering_threshold,
            ),
            congestion,
            pacer: Pacer::new(mss, initial_burst, settings.pacing_timer_tick_interval),
            cids: CidManager::new(self_cid, peer_cid),
            path: PathState::new(peer, path_validated, settings.enable_writable_bytes_limit),
            probing_path: None,
            timers: TimerTable::default(),
            rng,
            observer,
            events: VecDeque::new(),
            close: None,
            datagrams_rx: VecDeque::new(),
            datagrams_tx: VecDeque::new(),
            pending_ping: false,
            pending_immediate_ack: false,
            probes_due: None,
            pending_cid_reissues: Vec::new(),
            pending_ack_frequency: None,
            ack_frequency_seq: 0,
            pending_knobs: VecDeque::new(),
            decoder: FrameDecoder::default(),
            token: None,
            peer_params: None,
            settings,
            last_activity: now,
            peer_reported_ce: 0,
        };
        conn.arm_idle_timer(now);
        conn
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established
    }

    /// Next application event, if any.
    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    /// Earliest timer deadline for the embedder to arm.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.timers.next().map(|(_, d)| d)
    }

    // ========================================================================
    // Application API
    // ========================================================================

    pub fn open_stream(&mut self, dir: StreamDirection) -> Result<StreamId> {
        self.ensure_open()?;
        self.streams.open_local(dir)
    }

    /// Write application bytes; buffers beyond flow control and latches
    /// the blocked state.
    pub fn stream_write(&mut self, id: StreamId, data: Bytes, fin: bool) -> Result<()> {
        self.ensure_open()?;
        let stream = self
            .streams
            .get(id)
            .ok_or_else(|| QuicError::new(TransportErrorCode::StreamStateError, "unknown stream"))?;
        stream.send_half()?.write(data, fin)?;
        self.streams.mark_writable(id);
        Ok(())
    }

    /// Read up to `max_len` ordered bytes; the bool is end-of-stream.
    pub fn stream_read(&mut self, id: StreamId, max_len: usize) -> Result<(Bytes, bool)> {
        let stream = self
            .streams
            .get(id)
            .ok_or_else(|| QuicError::new(TransportErrorCode::StreamStateError, "unknown stream"))?;
        let recv = stream.recv_half()?;
        let before = recv.current_read_offset();
        let (data, fin) = recv.read(max_len);
        let consumed = recv.current_read_offset() - before;

        // Reading frees both stream- and connection-level windows; any
        // advertisement owed rides the next write opportunity.
        stream.recv_window.on_consumed(consumed);
        self.conn_recv_window.on_consumed(consumed);
        self.streams.reap_closed();
        Ok((data, fin))
    }

    /// Reset the send half; `reliable_size` keeps the prefix deliverable.
    pub fn reset_stream(&mut self, id: StreamId, error_code: u64, reliable_size: Option<u64>) -> Result<()> {
        self.ensure_open()?;
        let stream = self
            .streams
            .get(id)
            .ok_or_else(|| QuicError::new(TransportErrorCode::StreamStateError, "unknown stream"))?;
        stream.send_half()?.reset(error_code, reliable_size)?;
        self.streams.mark_writable(id);
        Ok(())
    }

    /// Ask the peer to stop sending on `id`.
    pub fn stop_sending(&mut self, id: StreamId, error_code: u64) -> Result<()> {
        self.ensure_open()?;
        let stream = self
            .streams
            .get(id)
            .ok_or_else(|| QuicError::new(TransportErrorCode::StreamStateError, "unknown stream"))?;
        let _ = stream.recv_half()?;
        stream.pending_stop_sending = Some(error_code);
        self.streams.mark_writable(id);
        Ok(())
    }

    /// Queue an unreliable datagram; oldest entries drop on overflow.
    pub fn send_datagram(&mut self, data: Bytes) -> Result<()> {
        self.ensure_open()?;
        let max = self
            .peer_params
            .as_ref()
            .map(|p| p.max_datagram_frame_size)
            .unwrap_or(0);
        if max == 0 {
            return Err(QuicError::protocol_violation("peer does not accept datagrams"));
        }
        if data.len() as u64 + 8 > max {
            return Err(QuicError::protocol_violation("datagram exceeds peer limit"));
        }
        if self.datagrams_tx.len() >= self.settings.datagram_queue_capacity {
            self.datagrams_tx.pop_front();
        }
        self.datagrams_tx.push_back(data);
        Ok(())
    }

    /// Install an address-validation token for the next Initial flight
    /// (client, from a previous connection's NEW_TOKEN).
    pub fn set_token(&mut self, token: Bytes) {
        if self.side == Side::Client {
            self.token = Some(token);
        }
    }

    /// Ask the peer to ack less (or more) often
    /// (draft-ietf-quic-ack-frequency).
    pub fn request_ack_frequency(
        &mut self,
        ack_eliciting_threshold: u64,
        max_ack_delay: Duration,
        reordering_threshold: u64,
    ) -> Result<()> {
        self.ensure_open()?;
        self.ack_frequency_seq += 1;
        self.pending_ack_frequency = Some(crate::frames::AckFrequencyFrame {
            sequence: self.ack_frequency_seq,
            ack_eliciting_threshold: ack_eliciting_threshold.max(1),
            requested_max_ack_delay: max_ack_delay,
            reordering_threshold,
        });
        Ok(())
    }

    /// Deliver an out-of-band transport knob to the peer.
    pub fn send_knob(&mut self, knob_space: u64, id: u64, blob: Bytes) -> Result<()> {
        self.ensure_open()?;
        self.pending_knobs.push_back((knob_space, id, blob));
        Ok(())
    }

    /// Application close: commits the decision now, the CONNECTION_CLOSE
    /// goes out on the next write opportunity.
    pub fn close(&mut self, error_code: u64, reason: &str, now: Instant) {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Draining | ConnectionState::Closed) {
            return;
        }
        self.begin_close(
            CloseState {
                error_code,
                is_application: true,
                frame_type: None,
                reason: Bytes::copy_from_slice(reason.as_bytes()),
                needs_send: true,
            },
            now,
        );
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            ConnectionState::Handshaking | ConnectionState::Established => Ok(()),
            _ => Err(QuicError::new(TransportErrorCode::NoError, "connection closing")),
        }
    }

    // ========================================================================
    // Datagram intake
    // ========================================================================

    /// Top-level input: one received datagram. Protocol errors close the
    /// connection here; they never propagate to the embedder.
    pub fn on_datagram(&mut self, datagram: &ReceivedDatagram) {
        match self.state {
            ConnectionState::Closed => return,
            ConnectionState::Draining => return,
            ConnectionState::Closing => {
                // Respond at most with another CONNECTION_CLOSE; handled
                // by the write loop. Absorb the packet.
                return;
            }
            _ => {}
        }
        if let Err(error) = self.process_datagram(datagram) {
            self.close_on_error(error, datagram.rx_time);
        }
    }

    fn process_datagram(&mut self, datagram: &ReceivedDatagram) -> Result<()> {
        let now = datagram.rx_time;
        self.last_activity = now;
        self.arm_idle_timer(now);

        if datagram.peer == self.path.peer {
            self.path.on_received(datagram.payload.len() as u64);
        } else {
            self.on_possible_migration(datagram, now)?;
        }

        let ecn = Ecn::from_tos(datagram.tos);
        let mut rest: &[u8] = &datagram.payload;
        let mut first_fragment = true;
        while !rest.is_empty() {
            let parsed = parse_packet(rest, self.cids.self_cid_len());
            let (header, consumed) = match parsed {
                Ok(ok) => ok,
                Err(_) if !first_fragment => break, // later fragments: stop, keep earlier work
                Err(e) => return Err(e),
            };
            let packet = &rest[..consumed];
            if let Err(e) = self.process_packet(packet, header, ecn, now) {
                // Decryption failures and stale-space packets drop
                // silently; real protocol errors propagate.
                if e.code == TransportErrorCode::NoError {
                    tracing::trace!("packet dropped: {}", e.reason);
                } else {
                    return Err(e);
                }
            }
            first_fragment = false;
            rest = &rest[consumed..];
        }

        self.pump_handshake(now)?;
        Ok(())
    }

    /// Internal sentinel: drop this packet without closing.
    fn drop_packet(reason: &'static str) -> QuicError {
        QuicError::new(TransportErrorCode::NoError, reason)
    }

    fn process_packet(
        &mut self,
        packet: &[u8],
        header: PacketHeader<'_>,
        ecn: Ecn,
        now: Instant,
    ) -> Result<()> {
        match header {
            PacketHeader::VersionNegotiation { .. } => {
                // Only meaningful for a client that has not progressed;
                // with a single supported version there is nothing to
                // switch to, so it is dropped.
                Err(Self::drop_packet("version negotiation ignored"))
            }
            PacketHeader::Retry { .. } => Err(Self::drop_packet("retry handled by the listener")),
            PacketHeader::Long { ty, ref scid, pn_offset, packet_len, .. } => {
                // Initial token staleness is the listener's concern; by
                // the time a connection exists the token was accepted.
                if self.side == Side::Client
                    && ty == LongHeaderType::Initial
                    && self.state == ConnectionState::Handshaking
                {
                    // Switch to the server's chosen SCID (RFC 9000 7.2).
                    self.cids.update_initial_peer_cid(scid.clone());
                }
                self.process_protected(packet, ty.protection(), pn_offset, packet_len, ecn, now)
            }
            PacketHeader::Short { ref dcid, pn_offset, packet_len } => {
                if !self.cids.owns_self_cid(dcid) {
                    return Err(Self::drop_packet("unknown destination CID"));
                }
                if self.check_stateless_reset(packet) {
                    self.enter_closed("stateless reset");
                    return Ok(());
                }
                self.process_one_rtt(packet, pn_offset, packet_len, ecn, now)
            }
        }
    }

    fn check_stateless_reset(&self, packet: &[u8]) -> bool {
        if packet.len() < 21 {
            return false;
        }
        let mut token = [0u8; 16];
        token.copy_from_slice(&packet[packet.len() - 16..]);
        self.cids.matches_reset_token(&token)
    }

    fn process_protected(
        &mut self,
        packet: &[u8],
        protection: ProtectionType,
        pn_offset: usize,
        packet_len: usize,
        ecn: Ecn,
        now: Instant,
    ) -> Result<()> {
        let space = protection.space();
        if self.spaces[space.index()].discarded {
            return Err(Self::drop_packet("space discarded"));
        }
        if self.spaces[space.index()].read_keys.is_none() {
            return Err(Self::drop_packet("keys not yet available"));
        }

        let mut buf = packet[..packet_len].to_vec();
        let largest = self.spaces[space.index()].acks.largest_received();
        let keys = self.spaces[space.index()].read_keys.as_ref().expect("checked above");
        let (_, pn_len) = unprotect_header(&mut buf, pn_offset, keys.header.as_ref())
            .map_err(|_| Self::drop_packet("header unprotect failed"))?;
        let truncated = crate::packet::number::parse_truncated(&buf[pn_offset..],
            crate::packet::number::PacketNumberLen::from_bits((buf[0] & 0x03) as u8))
            .map_err(|_| Self::drop_packet("bad packet number"))?;
        let pn = decode_packet_number(largest, truncated, pn_len * 8);

        let (header_bytes, ciphertext) = buf.split_at(pn_offset + pn_len);
        let plaintext = keys
            .aead
            .open(pn, header_bytes, ciphertext)
            .map_err(|_| Self::drop_packet("decrypt failed"))?;

        self.accept_payload(space, pn, &plaintext, packet_len as u64, ecn, now, None)?;

        // A valid Handshake packet retires the Initial space.
        if space == PacketNumberSpace::Handshake && !self.spaces[PacketNumberSpace::Initial.index()].discarded {
            self.discard_space(PacketNumberSpace::Initial);
        }
        Ok(())
    }

    fn process_one_rtt(
        &mut self,
        packet: &[u8],
        pn_offset: usize,
        packet_len: usize,
        ecn: Ecn,
        now: Instant,
    ) -> Result<()> {
        if !self.one_rtt.read_ready() {
            return Err(Self::drop_packet("1-RTT keys not yet available"));
        }

        let mut buf = packet[..packet_len].to_vec();
        let space = PacketNumberSpace::AppData;
        let largest = self.spaces[space.index()].acks.largest_received();

        let hp = self.one_rtt.read_header_cipher()?;
        let (first, pn_len) = unprotect_header(&mut buf, pn_offset, hp)
            .map_err(|_| Self::drop_packet("header unprotect failed"))?;
        let phase_bit = first & KEY_PHASE_BIT != 0;

        let truncated = crate::packet::number::parse_truncated(
            &buf[pn_offset..],
            crate::packet::number::PacketNumberLen::from_bits(first & 0x03),
        )
        .map_err(|_| Self::drop_packet("bad packet number"))?;
        let pn = decode_packet_number(largest, truncated, pn_len * 8);

        let (header_bytes, ciphertext) = buf.split_at(pn_offset + pn_len);
        let aead = self.one_rtt.read_cipher(phase_bit)?;
        let plaintext = match aead.open(pn, header_bytes, ciphertext) {
            Ok(p) => p,
            Err(_) => {
                if self.check_stateless_reset(packet) {
                    self.enter_closed("stateless reset");
                    return Ok(());
                }
                return Err(Self::drop_packet("decrypt failed"));
            }
        };
        self.one_rtt.confirm_read_phase(phase_bit);

        self.accept_payload(
            space,
            pn,
            &plaintext,
            packet_len as u64,
            ecn,
            now,
            Some(KeyPhase::from_bit(phase_bit)),
        )
    }

    /// Record receipt and dispatch every frame of a decrypted payload.
    #[allow(clippy::too_many_arguments)]
    fn accept_payload(
        &mut self,
        space: PacketNumberSpace,
        pn: PacketNumber,
        plaintext: &[u8],
        _packet_size: u64,
        ecn: Ecn,
        now: Instant,
        rx_phase: Option<KeyPhase>,
    ) -> Result<()> {
        // Pre-scan for ack-eliciting content so the tracker's decision
        // uses the whole packet.
        let mut ack_eliciting = false;
        for frame in self.decoder.iter(plaintext) {
            let frame = frame?;
            ack_eliciting |= frame.is_ack_eliciting();
        }

        let srtt = self
            .recovery
            .rtt()
            .has_sample()
            .then(|| self.recovery.rtt().srtt());
        let disposition =
            self.spaces[space.index()]
                .acks
                .on_packet_received(pn, now, ack_eliciting, ecn, srtt);
        if disposition == ReceivedDisposition::Duplicate {
            return Ok(());
        }
        self.arm_delayed_ack_timer(space);

        for frame in self.decoder.iter(plaintext) {
            let frame = frame?;
            self.dispatch_frame(space, frame, rx_phase, now)?;
        }

        self.streams.reap_closed();
        Ok(())
    }

    fn dispatch_frame(
        &mut self,
        space: PacketNumberSpace,
        frame: Frame<'_>,
        rx_phase: Option<KeyPhase>,
        now: Instant,
    ) -> Result<()> {
        match frame {
            Frame::Padding { .. } | Frame::Ping => {}

            Frame::Ack(ack) => self.on_ack_frame(space, &ack, rx_phase, now)?,

            Frame::Crypto(crypto) => {
                let level = match space {
                    PacketNumberSpace::Initial => EncryptionLevel::Initial,
                    PacketNumberSpace::Handshake => EncryptionLevel::Handshake,
                    PacketNumberSpace::AppData => EncryptionLevel::OneRtt,
                };
                let ps = &mut self.spaces[space.index()];
                ps.crypto_recv.on_data(crypto.offset, crypto.data, false)?;
                loop {
                    let (chunk, _) = ps.crypto_recv.read(usize::MAX);
                    if chunk.is_empty() {
                        break;
                    }
                    self.handshake.feed(level, &chunk)?;
                }
            }

            Frame::Stream(stream_frame) => {
                if space != PacketNumberSpace::AppData {
                    return Err(QuicError::protocol_violation("stream frame outside 1-RTT"));
                }
                self.on_stream_frame(&stream_frame)?;
            }

            Frame::ResetStream(reset) => self.on_reset_stream_frame(&reset)?,

            Frame::StopSending(stop) => {
                if let Some(stream) = self.streams.get_or_create(stop.stream_id)? {
                    // The peer no longer wants this data: reset with the
                    // peer's error code echoed back.
                    stream.send_half()?.reset(stop.error_code, None)?;
                    let id = stop.stream_id;
                    self.streams.mark_writable(id);
                    self.events.push_back(ConnectionEvent::StopSendingReceived {
                        id,
                        error_code: stop.error_code,
                    });
                }
            }

            Frame::MaxData { maximum } => self.conn_send_window.on_max(maximum),

            Frame::MaxStreamData { stream_id, maximum } => {
                if let Some(stream) = self.streams.get_or_create(stream_id)? {
                    stream.send_window.on_max(maximum);
                    if stream.wants_to_send() {
                        self.streams.mark_writable(stream_id);
                        self.events.push_back(ConnectionEvent::StreamWritable(stream_id));
                    }
                }
            }

            Frame::MaxStreamsBidi { maximum } => {
                self.streams.on_max_streams(StreamDirection::Bidirectional, maximum)
            }
            Frame::MaxStreamsUni { maximum } => {
                self.streams.on_max_streams(StreamDirection::Unidirectional, maximum)
            }

            Frame::DataBlocked { .. }
            | Frame::StreamDataBlocked { .. }
            | Frame::StreamsBlockedBidi { .. }
            | Frame::StreamsBlockedUni { .. } => {
                // Informational; our window updates are driven by
                // consumption, which these frames cannot accelerate.
            }

            Frame::NewConnectionId(frame) => self.cids.on_new_cid(&frame)?,

            Frame::RetireConnectionId { sequence } => {
                let dcid = self.cids.active_peer_cid().clone();
                self.cids.on_retire_cid(sequence, &dcid)?;
                // Replenish the peer's CID pool; the sequences queue
                // internally and the write loop emits them.
                let _ = self.cids.issue_self_cids(self.rng.as_mut());
            }

            Frame::PathChallenge { data } => {
                self.path.on_path_challenge(data);
            }

            Frame::PathResponse { data } => {
                if !self.path.on_path_response(&data) {
                    if let Some(probing) = self.probing_path.as_mut() {
                        if probing.on_path_response(&data) {
                            self.commit_migration(now);
                        }
                    }
                }
            }

            Frame::NewToken(frame) => {
                if self.side == Side::Server {
                    return Err(QuicError::protocol_violation("NEW_TOKEN from client"));
                }
                self.events.push_back(ConnectionEvent::NewTokenReceived(frame.token));
            }

            Frame::ConnectionClose(close) => self.on_peer_close(&close, now),

            Frame::HandshakeDone => {
                if self.side == Side::Server {
                    return Err(QuicError::protocol_violation("HANDSHAKE_DONE from client"));
                }
                self.on_handshake_confirmed(now);
            }

            Frame::ImmediateAck => self.spaces[space.index()].acks.on_immediate_ack(),

            Frame::Datagram { data } => {
                if self.datagrams_rx.len() >= self.settings.datagram_queue_capacity {
                    self.datagrams_rx.pop_front();
                }
                let owned = Bytes::copy_from_slice(data);
                self.datagrams_rx.push_back(owned.clone());
                self.events.push_back(ConnectionEvent::DatagramReceived(owned));
            }

            Frame::AckFrequency(frame) => {
                self.spaces[PacketNumberSpace::AppData.index()]
                    .acks
                    .on_ack_frequency(&frame)?;
            }

            Frame::Knob(knob) => {
                self.observer.on_knob(knob.knob_space, knob.id, knob.blob);
                self.events.push_back(ConnectionEvent::KnobReceived {
                    knob_space: knob.knob_space,
                    id: knob.id,
                    blob: Bytes::copy_from_slice(knob.blob),
                });
            }
        }
        Ok(())
    }

    fn on_stream_frame(&mut self, frame: &crate::frames::StreamFrame<'_>) -> Result<()> {
        let end = frame.end_offset();
        let Some(stream) = self.streams.get_or_create(frame.stream_id)? else {
            return Ok(()); // stale frame for a reaped stream
        };
        if let Some(group) = frame.group_id {
            stream.group_id.get_or_insert(group);
        }
        stream.recv_window.on_data(end)?;
        let advance = stream.recv_half()?.on_data(frame.offset, frame.data, frame.fin)?;
        let readable = stream.recv_half()?.readable();
        self.conn_recv_window.on_data(
            self.conn_recv_window.highest_received() + advance,
        )?;
        if readable {
            self.streams.mark_readable(frame.stream_id);
            self.events.push_back(ConnectionEvent::StreamReadable(frame.stream_id));
        }
        Ok(())
    }

    fn on_reset_stream_frame(&mut self, reset: &ResetStreamFrame) -> Result<()> {
        let Some(stream) = self.streams.get_or_create(reset.stream_id)? else {
            return Ok(());
        };
        let advance = stream.recv_half()?.on_reset(
            reset.error_code,
            reset.final_size,
            reset.reliable_size,
        )?;
        let readable = stream.recv_half()?.readable();
        self.conn_recv_window
            .on_data(self.conn_recv_window.highest_received() + advance)?;
        if readable {
            self.streams.mark_readable(reset.stream_id);
            self.events.push_back(ConnectionEvent::StreamReadable(reset.stream_id));
        } else {
            self.events.push_back(ConnectionEvent::StreamReset {
                id: reset.stream_id,
                error_code: reset.error_code,
            });
        }
        Ok(())
    }

    // ========================================================================
    // ACK processing
    // ========================================================================

    fn on_ack_frame(
        &mut self,
        space: PacketNumberSpace,
        ack: &AckFrame,
        rx_phase: Option<KeyPhase>,
        now: Instant,
    ) -> Result<()> {
        if let Some(phase) = rx_phase {
            self.one_rtt.validate_ack_phase(phase, ack.largest_acked)?;
        }

        let prior_inflight = self.recovery.bytes_in_flight();
        let outcome = self.recovery.on_ack_received(space, ack, now)?;

        if !outcome.spurious.is_empty() {
            self.observer.on_spurious_loss(space, &outcome.spurious);
        }

        // Settle per-frame effects of delivered packets, once per clone
        // family.
        for packet in &outcome.newly_acked {
            if let Some(id) = packet.clone_id {
                if !self.recovery.register_clone_delivery(id) {
                    continue;
                }
            }
            for frame in packet.frames.clone() {
                self.settle_acked_frame(space, &frame);
            }
        }
        if !outcome.newly_acked.is_empty() {
            let pns: Vec<PacketNumber> =
                outcome.newly_acked.iter().map(|p| p.packet_number).collect();
            self.observer.on_packets_acked(space, &pns);
        }

        for packet in &outcome.newly_lost {
            let suppressed = packet
                .clone_id
                .is_some_and(|id| self.recovery.clone_already_delivered(&id));
            if suppressed {
                continue;
            }
            for frame in packet.frames.clone() {
                self.replay_lost_frame(space, &frame);
            }
        }
        if !outcome.newly_lost.is_empty() {
            let pns: Vec<PacketNumber> =
                outcome.newly_lost.iter().map(|p| p.packet_number).collect();
            self.observer.on_packets_lost(space, &pns);
        }

        // An increase in the peer's ECN-CE count is a congestion signal
        // even without packet loss.
        let mut ce_increased = false;
        if let Some(ecn) = &ack.ecn {
            if ecn.ce > self.peer_reported_ce {
                self.peer_reported_ce = ecn.ce;
                ce_increased = true;
            }
        }

        // Feed the controller.
        let persistent = self.recovery.is_persistent_congestion(&outcome.newly_lost);
        let signal = CongestionSignal {
            now,
            acked: &outcome.newly_acked,
            lost: &outcome.newly_lost,
            prior_inflight,
            inflight: self.recovery.bytes_in_flight(),
            delivered_bytes: self.recovery.delivered_bytes(),
            delivered_time: now,
            rtt: self.recovery.rtt(),
            has_loss: !outcome.newly_lost.is_empty() || ce_increased,
            persistent_congestion: persistent,
        };
        self.congestion.on_ack_or_loss(&signal);
        let quantum = 3 * self.settings.max_udp_payload_size as u64;
        self.pacer.on_rate_update(self.congestion.pacing_rate(), quantum);

        // Local key update when the configured interval elapses.
        if space == PacketNumberSpace::AppData
            && self.settings.initiate_key_update
            && self.one_rtt.update_due(self.settings.key_update_packet_count_interval)
        {
            self.one_rtt.initiate_update()?;
            self.observer.on_key_update(self.one_rtt.write_phase());
        }

        self.arm_loss_timer();
        Ok(())
    }

    fn settle_acked_frame(&mut self, space: PacketNumberSpace, frame: &SentFrame) {
        match frame {
            SentFrame::Stream { id, offset, len, fin } => {
                if let Some(stream) = self.streams.get(*id) {
                    if let Some(send) = stream.send_half_opt() {
                        if send.on_ack(*offset, *len, *fin) {
                            self.events.push_back(ConnectionEvent::StreamWritable(*id));
                        }
                    }
                }
            }
            SentFrame::Crypto { offset, len, .. } => {
                self.spaces[space.index()].crypto_send.on_ack(*offset, *len, false);
            }
            SentFrame::Ack { largest_acked } => {
                self.spaces[space.index()].acks.on_ack_of_ack(*largest_acked);
            }
            SentFrame::ResetStream { id } => {
                if let Some(stream) = self.streams.get(*id) {
                    if let Some(send) = stream.send_half_opt() {
                        send.on_reset_acked();
                    }
                }
            }
            _ => {}
        }
    }

    /// Re-queue the content of a lost frame; coverage comes from state,
    /// not from the stored bytes (later window values supersede earlier
    /// ones automatically).
    fn replay_lost_frame(&mut self, space: PacketNumberSpace, frame: &SentFrame) {
        match frame {
            SentFrame::Stream { id, offset, len, fin } => {
                if let Some(stream) = self.streams.get(*id) {
                    if let Some(send) = stream.send_half_opt() {
                        send.on_loss(*offset, *len, *fin);
                    }
                }
                self.streams.mark_writable(*id);
            }
            SentFrame::Crypto { offset, len, .. } => {
                self.spaces[space.index()].crypto_send.on_loss(*offset, *len, false);
            }
            SentFrame::ResetStream { id } => {
                if let Some(stream) = self.streams.get(*id) {
                    if let Some(send) = stream.send_half_opt() {
                        send.resend_reset();
                    }
                    self.streams.mark_writable(*id);
                }
            }
            SentFrame::StopSending { id, error_code } => {
                if let Some(stream) = self.streams.get(*id) {
                    stream.pending_stop_sending = Some(*error_code);
                    self.streams.mark_writable(*id);
                }
            }
            SentFrame::MaxData { .. } => self.conn_recv_window.resend_update(),
            SentFrame::MaxStreamData { id, .. } => {
                if let Some(stream) = self.streams.get(*id) {
                    stream.recv_window.resend_update();
                }
            }
            SentFrame::MaxStreamsBidi { .. } => {
                self.streams.resend_count_update(StreamDirection::Bidirectional)
            }
            SentFrame::MaxStreamsUni { .. } => {
                self.streams.resend_count_update(StreamDirection::Unidirectional)
            }
            SentFrame::NewConnectionId { sequence } => {
                if !self.pending_cid_reissues.contains(sequence) {
                    self.pending_cid_reissues.push(*sequence);
                }
            }
            SentFrame::RetireConnectionId { sequence } => {
                self.cids.requeue_retirement(*sequence);
            }
            SentFrame::PathChallenge { data } => self.path.requeue_challenge(*data),
            SentFrame::PathResponse { data } => self.path.on_path_challenge(*data),
            SentFrame::HandshakeDone => self.pending_handshake_done = true,
            SentFrame::AckFrequency { .. } => {
                // A fresh frame with a new sequence supersedes the lost one.
            }
            SentFrame::Ack { .. }
            | SentFrame::Ping
            | SentFrame::NewToken
            | SentFrame::Datagram { .. }
            | SentFrame::ImmediateAck
            | SentFrame::Knob { .. }
            | SentFrame::DataBlocked
            | SentFrame::StreamDataBlocked { .. }
            | SentFrame::StreamsBlockedBidi
            | SentFrame::StreamsBlockedUni => {}
        }
    }

    // ========================================================================
    // Handshake plumbing
    // ========================================================================

    pub(crate) fn pump_handshake(&mut self, now: Instant) -> Result<()> {
        for event in self.handshake.poll() {
            match event {
                HandshakeEvent::TransmitCryptoData { level, data } => {
                    let space = Self::space_for_level(level);
                    self.spaces[space.index()].crypto_send.write(data, false)?;
                }
                HandshakeEvent::KeysAvailable { level, direction, keys } => {
                    self.install_keys(level, direction, keys);
                }
                HandshakeEvent::PeerTransportParameters(params) => {
                    self.apply_peer_params(params)?;
                }
                HandshakeEvent::HandshakeDone => {
                    self.handshake_complete = true;
                    if self.side == Side::Server {
                        self.pending_handshake_done = true;
                        self.on_handshake_confirmed(now);
                    }
                }
                HandshakeEvent::Failed { alert } => {
                    return Err(QuicError::new(
                        TransportErrorCode::Crypto(alert),
                        "handshake failed",
                    ));
                }
            }
        }
        Ok(())
    }

    fn space_for_level(level: EncryptionLevel) -> PacketNumberSpace {
        match level {
            EncryptionLevel::Initial => PacketNumberSpace::Initial,
            EncryptionLevel::Handshake => PacketNumberSpace::Handshake,
            EncryptionLevel::ZeroRtt | EncryptionLevel::OneRtt => PacketNumberSpace::AppData,
        }
    }

    fn install_keys(&mut self, level: EncryptionLevel, direction: KeyDirection, keys: PacketKeys) {
        tracing::debug!(?level, ?direction, "keys installed");
        match level {
            EncryptionLevel::OneRtt => match direction {
                KeyDirection::Read => self.one_rtt.install_read(keys),
                KeyDirection::Write => self.one_rtt.install_write(keys),
            },
            _ => {
                let space = Self::space_for_level(level);
                let slot = match direction {
                    KeyDirection::Read => &mut self.spaces[space.index()].read_keys,
                    KeyDirection::Write => &mut self.spaces[space.index()].write_keys,
                };
                *slot = Some(keys);
            }
        }
    }

    fn apply_peer_params(&mut self, params: TransportParameters) -> Result<()> {
        if params.ack_delay_exponent > 20 {
            return Err(QuicError::new(
                TransportErrorCode::TransportParameterError,
                "ack_delay_exponent above 20",
            ));
        }
        self.decoder = FrameDecoder::new(params.ack_delay_exponent);
        self.conn_send_window.on_max(params.initial_max_data);
        self.streams.apply_peer_params(&params);
        self.cids.set_peer_limit(params.active_connection_id_limit);
        self.peer_params = Some(params);
        Ok(())
    }

    fn on_handshake_confirmed(&mut self, now: Instant) {
        if self.state != ConnectionState::Handshaking {
            return;
        }
        self.state = ConnectionState::Established;
        self.discard_space(PacketNumberSpace::Initial);
        self.discard_space(PacketNumberSpace::Handshake);
        // Handshake completion validates the peer's address, lifting the
        // amplification cap.
        self.path.validated = true;
        self.events.push_back(ConnectionEvent::HandshakeComplete);
        tracing::info!(side = ?self.side, "connection established");

        // Servers hand the peer spare connection IDs right away.
        let _ = self.cids.issue_self_cids(self.rng.as_mut());
        if self.settings.enable_keepalive {
            self.arm_keepalive_timer(now);
        }
    }

    fn discard_space(&mut self, space: PacketNumberSpace) {
        if space == PacketNumberSpace::AppData || self.spaces[space.index()].discarded {
            return;
        }
        self.spaces[space.index()].discarded = true;
        self.spaces[space.index()].read_keys = None;
        self.spaces[space.index()].write_keys = None;
        self.recovery.discard_space(space);
    }

    // ========================================================================
    // Migration
    // ========================================================================

    fn on_possible_migration(&mut self, datagram: &ReceivedDatagram, now: Instant) -> Result<()> {
        if self.side == Side::Client {
            // Servers do not migrate; a new source address is NAT churn
            // and handled by normal path maintenance.
            return Ok(());
        }
        if self.settings.disable_migration
            || self.peer_params.as_ref().is_some_and(|p| p.disable_active_migration)
        {
            return Err(QuicError::new(
                TransportErrorCode::NoViablePath,
                "migration disabled",
            ));
        }
        match self.probing_path.as_mut() {
            Some(probing) if probing.peer == datagram.peer => {
                probing.on_received(datagram.payload.len() as u64);
            }
            _ => {
                tracing::debug!(peer = %datagram.peer, "path probing started");
                let mut probing = PathState::new(
                    datagram.peer,
                    false,
                    self.settings.enable_writable_bytes_limit,
                );
                probing.on_received(datagram.payload.len() as u64);
                if probing.begin_validation(self.rng.as_mut(), now) {
                    self.timers.arm(
                        TimerKind::PathValidation,
                        probing.challenge_deadline.expect("armed by begin_validation"),
                    );
                }
                self.probing_path = Some(probing);
            }
        }
        Ok(())
    }

    /// The probing path validated: adopt it and reset congestion state,
    /// which belonged to the old path.
    fn commit_migration(&mut self, _now: Instant) {
        let Some(validated) = self.probing_path.take() else { return };
        tracing::info!(peer = %validated.peer, "migrated to validated path");
        self.path = validated;
        self.timers.cancel(TimerKind::PathValidation);
        if let Some(cid) = self.cids.rotate_peer_cid() {
            tracing::debug!(?cid, "rotated peer CID for new path");
        }
        self.recovery.mark_app_limited();
    }

    // ========================================================================
    // Close paths
    // ========================================================================

    fn on_peer_close(&mut self, close: &ConnectionCloseFrame, now: Instant) {
        tracing::info!(code = close.error_code, app = close.application_close, "peer closed");
        self.events.push_back(ConnectionEvent::ConnectionClosed {
            error_code: close.error_code,
            is_application: close.application_close,
            reason: String::from_utf8_lossy(&close.reason).into_owned(),
        });
        // Peer-initiated close goes straight to draining; we never send
        // in response.
        self.enter_draining(now);
    }

    fn close_on_error(&mut self, error: QuicError, now: Instant) {
        tracing::warn!(code = ?error.code, reason = error.reason, "closing on protocol error");
        self.events.push_back(ConnectionEvent::ConnectionClosed {
            error_code: error.code.to_wire(),
            is_application: false,
            reason: error.reason.to_string(),
        });
        self.begin_close(
            CloseState {
                error_code: error.code.to_wire(),
                is_application: false,
                frame_type: error.frame_type,
                reason: Bytes::copy_from_slice(error.reason.as_bytes()),
                needs_send: true,
            },
            now,
        );
    }

    fn begin_close(&mut self, close: CloseState, now: Instant) {
        self.close = Some(close);
        self.state = ConnectionState::Closing;
        // A close cancels every timer before the drain period begins.
        self.timers.cancel_all();
        self.arm_drain_timer(now);
    }

    pub(crate) fn enter_draining(&mut self, now: Instant) {
        self.state = ConnectionState::Draining;
        self.timers.cancel_all();
        self.arm_drain_timer(now);
    }

    fn enter_closed(&mut self, why: &'static str) {
        tracing::info!(why, "connection closed");
        self.state = ConnectionState::Closed;
        self.timers.cancel_all();
    }

    // ========================================================================
    // Timers
    // ========================================================================

    fn arm_idle_timer(&mut self, now: Instant) {
        self.timers.arm(TimerKind::Idle, now + self.settings.idle_timeout);
        if self.settings.enable_keepalive && self.state == ConnectionState::Established {
            self.arm_keepalive_timer(now);
        }
    }

    fn arm_keepalive_timer(&mut self, now: Instant) {
        self.timers
            .arm(TimerKind::Keepalive, now + self.settings.idle_timeout / 2);
    }

    pub(crate) fn arm_delayed_ack_timer(&mut self, space: PacketNumberSpace) {
        match self.spaces[space.index()].acks.ack_deadline() {
            Some(deadline) if deadline == Instant::ZERO => {
                // Immediate: leave it to the next write opportunity.
                self.timers.cancel(TimerKind::DelayedAck);
            }
            Some(deadline) => self.timers.arm(TimerKind::DelayedAck, deadline),
            None => {}
        }
    }

    pub(crate) fn arm_loss_timer(&mut self) {
        match self.recovery.timer_deadline() {
            Some(deadline) => self.timers.arm(TimerKind::LossDetection, deadline),
            None => self.timers.cancel(TimerKind::LossDetection),
        }
    }

    fn arm_drain_timer(&mut self, now: Instant) {
        let pto = self.recovery.rtt().pto_base(self.settings.max_ack_delay);
        self.timers.arm(TimerKind::Drain, now + pto * 3);
    }

    /// Drive expired timers. Every handler re-checks its condition, so a
    /// stale expiration is a no-op.
    pub fn on_timeout(&mut self, now: Instant) {
        for kind in self.timers.expired(now) {
            match kind {
                TimerKind::Idle => {
                    if now.saturating_duration_since(self.last_activity) >= self.settings.idle_timeout {
                        self.enter_closed("idle timeout");
                    } else {
                        self.arm_idle_timer(self.last_activity);
                    }
                }
                TimerKind::Keepalive => {
                    if self.state == ConnectionState::Established && self.settings.enable_keepalive {
                        self.pending_ping = true;
                        self.arm_keepalive_timer(now);
                    }
                }
                TimerKind::DelayedAck => {
                    // The tracker already knows; the write loop will emit
                    // the ACK. Nothing to recompute here.
                }
                TimerKind::LossDetection => match self.recovery.on_timer(now) {
                    TimerVerdict::None => {}
                    TimerVerdict::LossesDeclared => {
                        self.collect_timer_losses(now);
                        self.arm_loss_timer();
                    }
                    TimerVerdict::SendProbes { space, probes } => {
                        self.probes_due = Some((space, probes));
                        self.arm_loss_timer();
                    }
                },
                TimerKind::PathValidation => {
                    if let Some(probing) = self.probing_path.as_mut() {
                        if probing.on_validation_timeout(self.rng.as_mut(), now) {
                            if let Some(deadline) = probing.challenge_deadline {
                                self.timers.arm(TimerKind::PathValidation, deadline);
                            }
                        } else if !probing.validated {
                            tracing::debug!("abandoning path probe");
                            self.probing_path = None;
                        }
                    }
                }
                TimerKind::Pacing => {
                    // Wakes the write loop; budget recomputes there.
                }
                TimerKind::Drain => {
                    if matches!(self.state, ConnectionState::Closing | ConnectionState::Draining) {
                        self.enter_closed("drain complete");
                    }
                }
            }
        }
    }

    /// After a loss-timer pass, pull freshly declared losses out of every
    /// space and replay their frames.
    fn collect_timer_losses(&mut self, now: Instant) {
        for space in PacketNumberSpace::ALL {
            let lost = self.recovery.detect_lost_packets(space, now);
            if lost.is_empty() {
                continue;
            }
            let prior_inflight = self.recovery.bytes_in_flight();
            for packet in &lost {
                let suppressed = packet
                    .clone_id
                    .is_some_and(|id| self.recovery.clone_already_delivered(&id));
                if suppressed {
                    continue;
                }
                for frame in packet.frames.clone() {
                    self.replay_lost_frame(space, &frame);
                }
            }
            let pns: Vec<PacketNumber> = lost.iter().map(|p| p.packet_number).collect();
            self.observer.on_packets_lost(space, &pns);

            let persistent = self.recovery.is_persistent_congestion(&lost);
            let signal = CongestionSignal {
                now,
                acked: &[],
                lost: &lost,
                prior_inflight,
                inflight: self.recovery.bytes_in_flight(),
                delivered_bytes: self.recovery.delivered_bytes(),
                delivered_time: now,
                rtt: self.recovery.rtt(),
                has_loss: true,
                persistent_congestion: persistent,
            };
            self.congestion.on_ack_or_loss(&signal);
        }
    }
}
