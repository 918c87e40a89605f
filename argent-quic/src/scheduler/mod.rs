//! # Write scheduler (spec: frame packing, pacing, probing, batching)
//!
//! Each write round composes packets space by space: ACK first, then
//! crypto, stream control, window updates, simple frames, stream data,
//! keepalive, datagrams, and padding. Probe packets clone the frames of
//! an outstanding packet under a shared [`ClonedPacketIdentifier`] so an
//! ACK of either copy settles delivery exactly once.

#![forbid(unsafe_code)]

use crate::connection::{Connection, ConnectionState, TimerKind};
use crate::crypto::protect_header;
use crate::frames::{
    build::{encode_frame, encoded_size},
    ConnectionCloseFrame, CryptoFrame, Frame, KnobFrame, ResetStreamFrame, StopSendingFrame,
    StreamFrame,
};
use crate::packet::{
    header::{encode_long_header, encode_short_header},
    number::{encode_packet_number, packet_number_len, PacketNumberLen},
    LongHeaderType, PacketNumberSpace,
};
use crate::recovery::{ClonedPacketIdentifier, OutstandingPacket, SentFrame};
use crate::socket::{DatagramSocket, PacketBatch, SendOutcome};
use crate::stream::SendSegment;
use crate::types::{Instant, PacketNumber, StreamDirection, VarIntCodec, MIN_INITIAL_PACKET_SIZE, QUIC_V1};
use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;

/// Worst-case length-field estimate for long headers; payloads never
/// exceed the 14-bit varint form at UDP MTUs.
const LENGTH_FIELD_ESTIMATE: usize = 2;

/// Frames accumulated for one packet, bounded by the payload budget.
struct PacketBuilder {
    space: PacketNumberSpace,
    pn: PacketNumber,
    pn_len: PacketNumberLen,
    payload: BytesMut,
    max_payload: usize,
    frames: SmallVec<[SentFrame; 4]>,
    ack_eliciting: bool,
}

impl PacketBuilder {
    fn remaining(&self) -> usize {
        self.max_payload - self.payload.len()
    }

    /// Encode `frame` if it fits; `descriptor` lands in the outstanding
    /// ledger for retransmission bookkeeping.
    fn push(&mut self, frame: &Frame<'_>, descriptor: Option<SentFrame>) -> bool {
        let size = encoded_size(frame);
        if size > self.remaining() {
            return false;
        }
        encode_frame(frame, &mut self.payload);
        self.ack_eliciting |= frame.is_ack_eliciting();
        if let Some(d) = descriptor {
            self.frames.push(d);
        }
        true
    }

    fn pad_to_payload(&mut self, target: usize) {
        if self.payload.len() < target && target <= self.max_payload {
            let frame = Frame::Padding { len: target - self.payload.len() };
            encode_frame(&frame, &mut self.payload);
        }
    }
}

impl Connection {
    /// Compose up to a burst of datagrams. Returns how many were
    /// appended to `out`; timers (pacing, loss) re-arm as a side effect.
    pub fn poll_transmit(&mut self, now: Instant, out: &mut Vec<Bytes>) -> usize {
        let start = out.len();
        match self.state {
            ConnectionState::Closed | ConnectionState::Draining => return 0,
            ConnectionState::Closing => {
                if self.close.as_ref().is_some_and(|c| c.needs_send) {
                    if let Some(datagram) = self.build_close_packet(now) {
                        out.push(datagram);
                    }
                    if let Some(close) = self.close.as_mut() {
                        close.needs_send = false;
                    }
                    // Close is on the wire: begin draining.
                    self.enter_draining(now);
                }
                return out.len() - start;
            }
            _ => {}
        }

        // Probes bypass pacing and congestion: they must go out.
        if let Some((space, probes)) = self.probes_due.take() {
            for _ in 0..probes {
                if let Some(datagram) = self.build_probe(space, now) {
                    out.push(datagram);
                }
            }
        }

        let paced = self.pacer.packets_this_burst(now);
        let mut budget = self
            .settings
            .write_connection_data_packets_limit
            .min(self.settings.max_batch_size);
        if paced < budget as u64 {
            budget = paced as usize;
        }

        for space in PacketNumberSpace::ALL {
            while out.len() - start < budget && self.space_has_work(space, now) {
                match self.build_packet(space, now) {
                    Some(datagram) => out.push(datagram),
                    None => break,
                }
            }
        }

        // The sender drained its data with cwnd headroom: the bandwidth
        // samples from here on are app-limited.
        let inflight = self.recovery.bytes_in_flight();
        if !self.space_has_work(PacketNumberSpace::AppData, now)
            && self.congestion.writable_bytes(inflight) > 0
        {
            self.recovery.mark_app_limited();
            self.congestion.set_app_limited();
        }

        // If work remains but pacing stopped us, ask for a wakeup.
        if self.space_has_work(PacketNumberSpace::AppData, now) {
            if let Some(deadline) = self.pacer.next_send_time(now) {
                self.timers.arm(TimerKind::Pacing, deadline);
            }
        }
        self.arm_loss_timer();

        out.len() - start
    }

    /// Compose and hand a burst to the socket through the batch writer.
    /// WOULDBLOCK is surfaced for the embedder to retry on writability;
    /// sent state is never rolled back.
    pub fn flush(&mut self, socket: &mut dyn DatagramSocket, now: Instant) -> SendOutcome {
        let mut datagrams = Vec::new();
        self.poll_transmit(now, &mut datagrams);
        let mut batch = PacketBatch::new(self.settings.max_batch_size);
        let mut last = SendOutcome::Sent { bytes: 0 };
        for datagram in datagrams {
            if batch.push(datagram) {
                last = batch.flush(socket);
                if last == SendOutcome::Fatal {
                    return last;
                }
            }
        }
        if !batch.is_empty() {
            last = batch.flush(socket);
        }
        last
    }

    // ========================================================================
    // Work detection
    // ========================================================================

    fn space_keys_ready(&self, space: PacketNumberSpace) -> bool {
        match space {
            PacketNumberSpace::AppData => self.one_rtt.write_ready(),
            _ => self.spaces[space.index()].write_keys.is_some(),
        }
    }

    pub(crate) fn space_has_work(&mut self, space: PacketNumberSpace, now: Instant) -> bool {
        if self.spaces[space.index()].discarded || !self.space_keys_ready(space) {
            return false;
        }
        let ps = &self.spaces[space.index()];
        if ps.acks.should_ack_now(now) || ps.crypto_send.wants_to_send() {
            return true;
        }
        if space != PacketNumberSpace::AppData {
            return false;
        }
        self.pending_ping
            || self.pending_immediate_ack
            || self.pending_handshake_done
            || self.pending_ack_frequency.is_some()
            || !self.pending_knobs.is_empty()
            || !self.datagrams_tx.is_empty()
            || self.conn_recv_window.has_pending_update()
            || self.cids.has_pending()
            || !self.pending_cid_reissues.is_empty()
            || self.path.has_pending_responses()
            || self.path.has_pending_challenge()
            || self
                .probing_path
                .as_ref()
                .is_some_and(|p| p.has_pending_challenge())
            || self.streams.next_writable().is_some()
    }

    // ========================================================================
    // Packet composition
    // ========================================================================

    fn effective_mtu(&self) -> usize {
        let peer_cap = self
            .peer_params
            .as_ref()
            .map(|p| p.max_udp_payload_size)
            .unwrap_or(usize::MAX);
        self.settings.max_udp_payload_size.min(peer_cap)
    }

    fn begin_packet(&mut self, space: PacketNumberSpace) -> Option<PacketBuilder> {
        let path_budget = self.path.send_budget();
        if path_budget == 0 {
            return None;
        }

        let pn = self.spaces[space.index()].next_pn;
        let pn_len = packet_number_len(pn, self.recovery.largest_acked(space));

        let aead_overhead = match space {
            PacketNumberSpace::AppData => self.one_rtt.write_cipher().ok()?.0.overhead(),
            _ => self.spaces[space.index()].write_keys.as_ref()?.aead.overhead(),
        };

        let header_overhead = match space {
            PacketNumberSpace::AppData => 1 + self.cids.active_peer_cid().len(),
            _ => {
                let token_len = if space == PacketNumberSpace::Initial && self.side.is_client() {
                    let t = self.token.as_ref().map(|t| t.len()).unwrap_or(0);
                    VarIntCodec::size(t as u64) + t
                } else {
                    1 // zero-length token varint
                };
                1 + 4
                    + 1
                    + self.cids.active_peer_cid().len()
                    + 1
                    + self.cids.active_self_cid().len()
                    + token_len
                    + LENGTH_FIELD_ESTIMATE
            }
        };

        let max_datagram = self.effective_mtu().min(path_budget.min(usize::MAX as u64) as usize);
        let fixed = header_overhead + pn_len.bytes() + aead_overhead;
        if max_datagram <= fixed {
            return None;
        }

        Some(PacketBuilder {
            space,
            pn,
            pn_len,
            payload: BytesMut::with_capacity(max_datagram - fixed),
            max_payload: max_datagram - fixed,
            frames: SmallVec::new(),
            ack_eliciting: false,
        })
    }

    fn build_packet(&mut self, space: PacketNumberSpace, now: Instant) -> Option<Bytes> {
        let mut builder = self.begin_packet(space)?;

        self.schedule_ack(&mut builder, now);
        self.schedule_crypto(&mut builder);

        // Data frames obey the congestion window at packet granularity;
        // an ACK-only packet goes out regardless.
        let inflight = self.recovery.bytes_in_flight();
        let data_allowed =
            self.congestion.writable_bytes(inflight) >= self.effective_mtu() as u64;

        if space == PacketNumberSpace::AppData && data_allowed {
            self.schedule_stream_control(&mut builder);
            self.schedule_window_updates(&mut builder);
            self.schedule_simple_frames(&mut builder);
            self.schedule_stream_data(&mut builder);
            self.schedule_keepalive(&mut builder);
            self.schedule_datagrams(&mut builder);
        }

        if builder.payload.is_empty() {
            return None;
        }

        self.apply_padding(&mut builder);
        self.seal_and_record(builder, now, None)
    }

    fn build_close_packet(&mut self, now: Instant) -> Option<Bytes> {
        let space = if self.one_rtt.write_ready() {
            PacketNumberSpace::AppData
        } else if self.space_keys_ready(PacketNumberSpace::Handshake) {
            PacketNumberSpace::Handshake
        } else {
            PacketNumberSpace::Initial
        };
        let mut builder = self.begin_packet(space)?;
        let close = self.close.as_ref()?;
        let frame = Frame::ConnectionClose(ConnectionCloseFrame {
            error_code: close.error_code,
            frame_type: close.frame_type,
            reason: close.reason.clone(),
            application_close: close.is_application,
        });
        builder.push(&frame, None);
        self.seal_and_record(builder, now, None)
    }

    /// PTO probe: clone an outstanding packet's frames under a shared
    /// identifier, or fall back to a bare PING.
    fn build_probe(&mut self, space: PacketNumberSpace, now: Instant) -> Option<Bytes> {
        if self.spaces[space.index()].discarded || !self.space_keys_ready(space) {
            return None;
        }
        let mut builder = self.begin_packet(space)?;

        let candidate = self.recovery.clone_candidates(space, 1).into_iter().next();
        let clone_id = match candidate {
            Some(original) => {
                let id = original.clone_id.expect("tagged by clone_candidates");
                let mut cloned_any = false;
                for frame in &original.frames {
                    cloned_any |= self.clone_frame_into(&mut builder, space, frame);
                }
                if cloned_any {
                    Some(id)
                } else {
                    None
                }
            }
            None => None,
        };

        if builder.payload.is_empty() {
            // Nothing to clone: an ack-eliciting probe still goes out.
            if self.pending_immediate_ack {
                self.pending_immediate_ack = false;
                builder.push(&Frame::ImmediateAck, Some(SentFrame::ImmediateAck));
            } else {
                builder.push(&Frame::Ping, Some(SentFrame::Ping));
            }
        }

        self.apply_padding(&mut builder);
        self.seal_and_record(builder, now, clone_id)
    }

    /// Re-materialize one frame of a cloned packet from current state.
    fn clone_frame_into(
        &mut self,
        builder: &mut PacketBuilder,
        space: PacketNumberSpace,
        frame: &SentFrame,
    ) -> bool {
        match frame {
            SentFrame::Stream { id, offset, len, fin } => {
                let Some(stream) = self.streams.get(*id) else { return false };
                let Some(send) = stream.send_half_opt() else { return false };
                let Some(seg) = send.peek_range(*offset, *len, *fin) else { return false };
                let frame = Frame::Stream(StreamFrame {
                    stream_id: *id,
                    group_id: None,
                    offset: seg.offset,
                    data: &seg.data,
                    fin: seg.fin,
                });
                builder.push(
                    &frame,
                    Some(SentFrame::Stream {
                        id: *id,
                        offset: seg.offset,
                        len: seg.data.len() as u64,
                        fin: seg.fin,
                    }),
                )
            }
            SentFrame::Crypto { level, offset, len } => {
                let Some(seg) =
                    self.spaces[space.index()].crypto_send.peek_range(*offset, *len, false)
                else {
                    return false;
                };
                let frame = Frame::Crypto(CryptoFrame { offset: seg.offset, data: &seg.data });
                builder.push(
                    &frame,
                    Some(SentFrame::Crypto {
                        level: *level,
                        offset: seg.offset,
                        len: seg.data.len() as u64,
                    }),
                )
            }
            SentFrame::Ping => builder.push(&Frame::Ping, Some(SentFrame::Ping)),
            SentFrame::HandshakeDone => {
                builder.push(&Frame::HandshakeDone, Some(SentFrame::HandshakeDone))
            }
            SentFrame::PathChallenge { data } => builder.push(
                &Frame::PathChallenge { data: *data },
                Some(SentFrame::PathChallenge { data: *data }),
            ),
            SentFrame::MaxData { .. } => {
                let current = self.conn_recv_window.advertised_max();
                builder.push(
                    &Frame::MaxData { maximum: current },
                    Some(SentFrame::MaxData { maximum: current }),
                )
            }
            _ => false,
        }
    }

    // ========================================================================
    // Frame schedulers, in spec order
    // ========================================================================

    fn schedule_ack(&mut self, builder: &mut PacketBuilder, now: Instant) {
        let space = builder.space;
        let ps = &mut self.spaces[space.index()];
        let want = ps.acks.should_ack_now(now)
            || (self.settings.opportunistic_acking && ps.acks.can_build_ack());
        if !want || !ps.acks.can_build_ack() {
            return;
        }
        let Some(mut ack) = ps.acks.build_ack(now, true) else { return };
        // Shed the smallest ranges if the frame cannot fit.
        while ack.blocks.len() > 1 && encoded_size(&Frame::Ack(ack.clone())) > builder.remaining() {
            ack.blocks.pop();
        }
        let largest = ack.largest_acked;
        builder.push(&Frame::Ack(ack), Some(SentFrame::Ack { largest_acked: largest }));
        self.timers.cancel(TimerKind::DelayedAck);
    }

    fn schedule_crypto(&mut self, builder: &mut PacketBuilder) {
        let space = builder.space;
        let level = match space {
            PacketNumberSpace::Initial => crate::crypto::EncryptionLevel::Initial,
            PacketNumberSpace::Handshake => crate::crypto::EncryptionLevel::Handshake,
            PacketNumberSpace::AppData => crate::crypto::EncryptionLevel::OneRtt,
        };
        loop {
            let crypto = &mut self.spaces[space.index()].crypto_send;
            if !crypto.wants_to_send() {
                break;
            }
            let overhead = 1 + 8 + 2; // type + worst-case offset + length
            if builder.remaining() <= overhead {
                break;
            }
            let max_data = builder.remaining() - overhead;
            let Some(seg) = crypto.dequeue_segment(max_data, u64::MAX) else { break };
            let frame = Frame::Crypto(CryptoFrame { offset: seg.offset, data: &seg.data });
            if !builder.push(
                &frame,
                Some(SentFrame::Crypto { level, offset: seg.offset, len: seg.data.len() as u64 }),
            ) {
                break;
            }
        }
    }

    /// RESET_STREAM / STOP_SENDING owed on any stream.
    fn schedule_stream_control(&mut self, builder: &mut PacketBuilder) {
        let mut resets: Vec<(crate::types::StreamId, crate::stream::PendingReset)> = Vec::new();
        let mut stops: Vec<(crate::types::StreamId, u64)> = Vec::new();
        for (&id, stream) in self.streams.iter_mut() {
            if let Some(send) = stream.send_half_opt() {
                if let Some(reset) = send.take_pending_reset() {
                    resets.push((id, reset));
                }
            }
            if let Some(code) = stream.pending_stop_sending.take() {
                stops.push((id, code));
            }
        }
        for (id, reset) in resets {
            let frame = Frame::ResetStream(ResetStreamFrame {
                stream_id: id,
                error_code: reset.error_code,
                final_size: reset.final_size,
                reliable_size: reset.reliable_size,
            });
            if !builder.push(&frame, Some(SentFrame::ResetStream { id })) {
                // Re-latch for the next packet.
                if let Some(stream) = self.streams.get(id) {
                    if let Some(send) = stream.send_half_opt() {
                        send.resend_reset();
                    }
                }
            }
        }
        for (id, code) in stops {
            let frame = Frame::StopSending(StopSendingFrame { stream_id: id, error_code: code });
            if !builder.push(&frame, Some(SentFrame::StopSending { id, error_code: code })) {
                if let Some(stream) = self.streams.get(id) {
                    stream.pending_stop_sending = Some(code);
                }
            }
        }
    }

    fn schedule_window_updates(&mut self, builder: &mut PacketBuilder) {
        if let Some(maximum) = self.conn_recv_window.take_pending_update() {
            if !builder.push(
                &Frame::MaxData { maximum },
                Some(SentFrame::MaxData { maximum }),
            ) {
                self.conn_recv_window.resend_update();
            }
        }

        let mut stream_updates: Vec<(crate::types::StreamId, u64)> = Vec::new();
        for (&id, stream) in self.streams.iter_mut() {
            if let Some(maximum) = stream.recv_window.take_pending_update() {
                stream_updates.push((id, maximum));
            }
        }
        for (id, maximum) in stream_updates {
            let frame = Frame::MaxStreamData { stream_id: id, maximum };
            if !builder.push(&frame, Some(SentFrame::MaxStreamData { id, maximum })) {
                if let Some(stream) = self.streams.get(id) {
                    stream.recv_window.resend_update();
                }
            }
        }

        if let Some(maximum) = self.streams.count_update_due(StreamDirection::Bidirectional) {
            if !builder.push(
                &Frame::MaxStreamsBidi { maximum },
                Some(SentFrame::MaxStreamsBidi { maximum }),
            ) {
                self.streams.resend_count_update(StreamDirection::Bidirectional);
            }
        }
        if let Some(maximum) = self.streams.count_update_due(StreamDirection::Unidirectional) {
            if !builder.push(
                &Frame::MaxStreamsUni { maximum },
                Some(SentFrame::MaxStreamsUni { maximum }),
            ) {
                self.streams.resend_count_update(StreamDirection::Unidirectional);
            }
        }
    }

    fn schedule_simple_frames(&mut self, builder: &mut PacketBuilder) {
        if self.pending_handshake_done {
            if builder.push(&Frame::HandshakeDone, Some(SentFrame::HandshakeDone)) {
                self.pending_handshake_done = false;
            }
        }

        // Connection ID maintenance.
        for sequence in self.cids.take_pending_issues() {
            self.pending_cid_reissues.push(sequence);
        }
        let reissues = core::mem::take(&mut self.pending_cid_reissues);
        for sequence in reissues {
            let Some(frame) = self.cids.reissue_frame(sequence) else { continue };
            if !builder.push(
                &Frame::NewConnectionId(frame),
                Some(SentFrame::NewConnectionId { sequence }),
            ) {
                self.pending_cid_reissues.push(sequence);
            }
        }
        for sequence in self.cids.take_pending_retirements() {
            if !builder.push(
                &Frame::RetireConnectionId { sequence },
                Some(SentFrame::RetireConnectionId { sequence }),
            ) {
                self.cids.requeue_retirement(sequence);
            }
        }

        // Path maintenance: echoes first, then our own probes.
        for data in self.path.take_pending_responses() {
            if !builder.push(
                &Frame::PathResponse { data },
                Some(SentFrame::PathResponse { data }),
            ) {
                self.path.on_path_challenge(data);
            }
        }
        if let Some(data) = self.path.take_pending_challenge() {
            if !builder.push(
                &Frame::PathChallenge { data },
                Some(SentFrame::PathChallenge { data }),
            ) {
                self.path.requeue_challenge(data);
            }
        }
        if let Some(probing) = self.probing_path.as_mut() {
            if let Some(data) = probing.take_pending_challenge() {
                if !builder.push(
                    &Frame::PathChallenge { data },
                    Some(SentFrame::PathChallenge { data }),
                ) {
                    probing.requeue_challenge(data);
                }
            }
        }

        if let Some(frame) = self.pending_ack_frequency.take() {
            if !builder.push(
                &Frame::AckFrequency(frame),
                Some(SentFrame::AckFrequency { sequence: frame.sequence }),
            ) {
                self.pending_ack_frequency = Some(frame);
            }
        }

        while let Some((knob_space, id, blob)) = self.pending_knobs.pop_front() {
            let frame = Frame::Knob(KnobFrame { knob_space, id, blob: &blob });
            if !builder.push(&frame, Some(SentFrame::Knob { knob_space, id })) {
                self.pending_knobs.push_front((knob_space, id, blob));
                break;
            }
        }

        // Blocked signals, once per limit.
        if let Some(limit) = self.conn_send_window.blocked_frame_due() {
            builder.push(&Frame::DataBlocked { limit }, Some(SentFrame::DataBlocked));
        }
        if let Some(limit) = self.streams.blocked_frame_due(StreamDirection::Bidirectional) {
            builder.push(
                &Frame::StreamsBlockedBidi { limit },
                Some(SentFrame::StreamsBlockedBidi),
            );
        }
        if let Some(limit) = self.streams.blocked_frame_due(StreamDirection::Unidirectional) {
            builder.push(
                &Frame::StreamsBlockedUni { limit },
                Some(SentFrame::StreamsBlockedUni),
            );
        }
    }

    fn schedule_stream_data(&mut self, builder: &mut PacketBuilder) {
        // Per-frame overhead: type, group id, stream id, offset, length.
        const STREAM_FRAME_OVERHEAD: usize = 1 + 8 + 8 + 8 + 4;

        enum Pull {
            Segment { seg: SendSegment, group_id: Option<u64>, fresh: bool },
            Blocked { limit: u64 },
            Nothing,
        }

        let mut served = 0usize;
        while builder.remaining() > STREAM_FRAME_OVERHEAD {
            let Some(id) = self.streams.next_writable() else { break };
            served += 1;
            if served > self.streams.stream_count().max(1) * 2 {
                break; // round-robin safety valve
            }

            let conn_available = self.conn_send_window.available();
            let max_data = builder.remaining() - STREAM_FRAME_OVERHEAD;

            let pull = match self.streams.get(id) {
                None => Pull::Nothing,
                Some(stream) => {
                    let group_id = stream.group_id;
                    let stream_available = stream.send_window.available();
                    match stream.send_half_opt() {
                        None => Pull::Nothing,
                        Some(send) if send.has_lost_data() => {
                            // Retransmissions re-use credit already spent.
                            match send.dequeue_segment(max_data, u64::MAX) {
                                Some(seg) => Pull::Segment { seg, group_id, fresh: false },
                                None => Pull::Nothing,
                            }
                        }
                        Some(send) => {
                            let flow = stream_available.min(conn_available);
                            if flow == 0 && send.has_fresh_data() {
                                match stream.send_window.blocked_frame_due() {
                                    Some(limit) => Pull::Blocked { limit },
                                    None => Pull::Nothing,
                                }
                            } else {
                                match send.dequeue_segment(max_data, flow) {
                                    Some(seg) => Pull::Segment { seg, group_id, fresh: true },
                                    None => Pull::Nothing,
                                }
                            }
                        }
                    }
                }
            };

            match pull {
                Pull::Segment { seg, group_id, fresh } => {
                    if fresh {
                        let len = seg.data.len() as u64;
                        if let Some(stream) = self.streams.get(id) {
                            let _ = stream.send_window.consume(len);
                        }
                        let _ = self.conn_send_window.consume(len);
                    }
                    let frame = Frame::Stream(StreamFrame {
                        stream_id: id,
                        group_id,
                        offset: seg.offset,
                        data: &seg.data,
                        fin: seg.fin,
                    });
                    let pushed = builder.push(
                        &frame,
                        Some(SentFrame::Stream {
                            id,
                            offset: seg.offset,
                            len: seg.data.len() as u64,
                            fin: seg.fin,
                        }),
                    );
                    if !pushed {
                        // Give the bytes back through the loss path so a
                        // later packet retransmits them.
                        if let Some(stream) = self.streams.get(id) {
                            if let Some(send) = stream.send_half_opt() {
                                send.on_loss(seg.offset, seg.data.len() as u64, seg.fin);
                            }
                        }
                    }
                }
                Pull::Blocked { limit } => {
                    let frame = Frame::StreamDataBlocked { stream_id: id, limit };
                    builder.push(&frame, Some(SentFrame::StreamDataBlocked { id }));
                }
                Pull::Nothing => {}
            }
            self.streams.on_stream_serviced(id);
        }
    }

    fn schedule_keepalive(&mut self, builder: &mut PacketBuilder) {
        if self.pending_immediate_ack && builder.push(&Frame::ImmediateAck, Some(SentFrame::ImmediateAck)) {
            self.pending_immediate_ack = false;
        }
        if self.pending_ping && builder.push(&Frame::Ping, Some(SentFrame::Ping)) {
            self.pending_ping = false;
        }
    }

    fn schedule_datagrams(&mut self, builder: &mut PacketBuilder) {
        while let Some(data) = self.datagrams_tx.front() {
            let frame = Frame::Datagram { data: &data[..] };
            if encoded_size(&frame) > builder.remaining() {
                break;
            }
            let data = self.datagrams_tx.pop_front().expect("front just observed");
            let frame = Frame::Datagram { data: &data[..] };
            builder.push(&frame, Some(SentFrame::Datagram { len: data.len() as u64 }));
        }
    }

    // ========================================================================
    // Padding, sealing, recording
    // ========================================================================

    fn apply_padding(&mut self, builder: &mut PacketBuilder) {
        // Header protection samples 4 bytes past the packet number.
        let hp_floor = 4usize.saturating_sub(builder.pn_len.bytes());
        if builder.payload.len() < hp_floor {
            builder.pad_to_payload(hp_floor);
        }

        // Client Initial datagrams are padded to 1200 bytes.
        if builder.space == PacketNumberSpace::Initial && self.side.is_client() {
            let target = MIN_INITIAL_PACKET_SIZE
                .saturating_sub(self.begin_overhead_estimate(builder));
            builder.pad_to_payload(target.min(builder.max_payload));
        }

        // Short-header packets optionally pad to a modulo to frustrate
        // traffic analysis.
        if builder.space == PacketNumberSpace::AppData && self.settings.padding_modulo > 1 {
            let modulo = self.settings.padding_modulo as usize;
            let total = builder.payload.len();
            let padded = total.div_ceil(modulo) * modulo;
            builder.pad_to_payload(padded.min(builder.max_payload));
        }
    }

    fn begin_overhead_estimate(&self, builder: &PacketBuilder) -> usize {
        // Mirrors begin_packet's fixed-cost computation.
        builder.pn_len.bytes()
            + 16
            + match builder.space {
                PacketNumberSpace::AppData => 1 + self.cids.active_peer_cid().len(),
                _ => {
                    1 + 4
                        + 2
                        + self.cids.active_peer_cid().len()
                        + self.cids.active_self_cid().len()
                        + 1
                        + LENGTH_FIELD_ESTIMATE
                }
            }
    }

    fn seal_and_record(
        &mut self,
        builder: PacketBuilder,
        now: Instant,
        clone_id: Option<ClonedPacketIdentifier>,
    ) -> Option<Bytes> {
        let space = builder.space;
        let payload = builder.payload;
        let pn = builder.pn;
        let pn_len = builder.pn_len;

        let mut datagram = BytesMut::with_capacity(payload.len() + 64);
        let key_phase = self.one_rtt.write_phase().bit();

        match space {
            PacketNumberSpace::AppData => {
                encode_short_header(self.cids.active_peer_cid(), key_phase, pn_len, &mut datagram);
            }
            _ => {
                let ty = if space == PacketNumberSpace::Initial {
                    LongHeaderType::Initial
                } else {
                    LongHeaderType::Handshake
                };
                let token = if ty == LongHeaderType::Initial && self.side.is_client() {
                    self.token.clone().unwrap_or_default()
                } else {
                    Bytes::new()
                };
                let overhead = match self.spaces[space.index()].write_keys.as_ref() {
                    Some(keys) => keys.aead.overhead(),
                    None => return None,
                };
                let length = (pn_len.bytes() + payload.len() + overhead) as u64;
                encode_long_header(
                    ty,
                    QUIC_V1,
                    self.cids.active_peer_cid(),
                    self.cids.active_self_cid(),
                    &token,
                    pn_len,
                    length,
                    &mut datagram,
                );
            }
        }

        let pn_offset = datagram.len();
        encode_packet_number(pn, pn_len, &mut datagram);

        let ciphertext = match space {
            PacketNumberSpace::AppData => {
                let (aead, _) = self.one_rtt.write_cipher().ok()?;
                aead.seal(pn, &datagram, &payload).ok()?
            }
            _ => {
                let keys = self.spaces[space.index()].write_keys.as_ref()?;
                keys.aead.seal(pn, &datagram, &payload).ok()?
            }
        };
        datagram.extend_from_slice(&ciphertext);

        {
            let hp = match space {
                PacketNumberSpace::AppData => self.one_rtt.write_cipher().ok()?.1,
                _ => self.spaces[space.index()].write_keys.as_ref()?.header.as_ref(),
            };
            protect_header(datagram.as_mut(), pn_offset, pn_len.bytes(), hp).ok()?;
        }

        // Bookkeeping: counters, ledger, controller, pacer, observers.
        self.spaces[space.index()].next_pn += 1;
        let size = datagram.len() as u64;
        let mut packet =
            OutstandingPacket::new(pn, space, now, size, builder.ack_eliciting, builder.frames);
        packet.clone_id = clone_id;

        if builder.ack_eliciting && space == PacketNumberSpace::AppData {
            self.one_rtt.on_packet_sent(pn);
        }

        self.observer.on_packet_sent(space, pn, size, builder.ack_eliciting);
        let inflight = self.recovery.bytes_in_flight();
        self.congestion.on_packet_sent(&packet, inflight, now);
        self.recovery.on_packet_sent(packet, false);
        self.pacer.on_sent(size);
        self.path.on_sent(size);

        tracing::trace!(?space, pn, size, "packet sent");
        Some(datagram.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_frame_overhead_covers_worst_case() {
        // type byte + 8-byte stream id + 8-byte offset + 4-byte length.
        let frame = Frame::Stream(StreamFrame {
            stream_id: crate::types::StreamId::new((1 << 60) + 1),
            group_id: None,
            offset: (1 << 60) + 1,
            data: &[],
            fin: false,
        });
        assert!(encoded_size(&frame) <= 1 + 8 + 8 + 4);
    }
}
