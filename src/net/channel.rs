//! Reliable channel tracking: the send side with retransmission and ack
//! frontier, and the receive side with out-of-order reassembly and message
//! framing.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::trace;

use super::codec::{self, VarintError, VAR_U32_MAX_LEN};
use super::packet::{ChannelId, MAX_FRAME_LEN};
use super::seq::Seq;


/// The timeout after which an unacknowledged in-flight packet is resent.
pub const RESEND_TIMEOUT: Duration = Duration::from_millis(500);


/// Error returned when queuing a message whose encoded frame cannot fit in a
/// single datagram.
#[derive(Debug, Clone, thiserror::Error)]
#[error("message frame too large: {len} > {max}")]
pub struct MessageTooLarge {
    pub len: usize,
    pub max: usize,
}


/// The send side of a reliable channel: queues encoded message frames, emits
/// them as sequenced packets, retransmits unacknowledged payloads on timeout
/// and tracks the contiguously confirmed frontier.
#[derive(Debug)]
pub struct SendChannel {
    /// The channel this send side belongs to.
    channel: ChannelId,
    /// Sequence number assigned to the next fresh packet.
    next_index: Seq,
    /// All bytes with a sequence number before this one are acknowledged.
    fully_confirmed: Seq,
    /// Fully-encoded message frames waiting to be sent for the first time.
    pending_messages: VecDeque<Vec<u8>>,
    /// Packets sent but not yet acknowledged, kept in emission order so that
    /// the retransmit scan picks the oldest due packet first.
    in_flight: VecDeque<InFlightPacket>,
    /// Acknowledgments received ahead of the frontier, keyed by sequence
    /// start. A zero length records an ack whose payload length is unknown,
    /// typically a duplicate whose in-flight record is already gone.
    acked: HashMap<Seq, u32>,
}

/// A packet that has been sent at a given time and waits for an ack.
#[derive(Debug)]
struct InFlightPacket {
    start: Seq,
    payload: Vec<u8>,
    time: Instant,
    retries: u32,
}

/// A packet ready to be put on the wire, borrowed from the send channel.
#[derive(Debug, Clone, Copy)]
pub struct SendPacket<'a> {
    pub start: Seq,
    pub payload: &'a [u8],
    pub resend: bool,
}

impl SendChannel {

    pub fn new(channel: ChannelId, initial_seq: Seq) -> Self {
        Self {
            channel,
            next_index: initial_seq,
            fully_confirmed: initial_seq,
            pending_messages: VecDeque::new(),
            in_flight: VecDeque::new(),
            acked: HashMap::new(),
        }
    }

    /// The channel this send side belongs to.
    #[inline]
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Sequence number the next fresh packet will start at.
    #[inline]
    pub fn next_index(&self) -> Seq {
        self.next_index
    }

    /// Lower bound under which every byte has been acknowledged.
    #[inline]
    pub fn fully_confirmed(&self) -> Seq {
        self.fully_confirmed
    }

    /// Number of packets sent and not yet acknowledged.
    #[inline]
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of frames queued and not yet sent a first time.
    #[inline]
    pub fn pending_len(&self) -> usize {
        self.pending_messages.len()
    }

    /// Encode the given message as a frame and append it to the queue of
    /// pending messages. No sequence number is assigned until the frame is
    /// first emitted by [`Self::get_packet`], so queuing never interleaves
    /// with retransmissions of previous frames. The queue is unbounded,
    /// upstream callers are responsible for its depth.
    pub fn queue(&mut self, protocol_id: u8, body: &[u8]) -> Result<(), MessageTooLarge> {

        let size = codec::write_var_u32(body.len() as u32);
        let len = 1 + size.len() + body.len();
        if len > MAX_FRAME_LEN {
            return Err(MessageTooLarge { len, max: MAX_FRAME_LEN });
        }

        let mut frame = Vec::with_capacity(len);
        frame.push(protocol_id);
        frame.extend_from_slice(&size);
        frame.extend_from_slice(body);

        trace!(channel = %self.channel, protocol_id, len, "queue frame");
        self.pending_messages.push_back(frame);
        Ok(())

    }

    /// Return true if this channel has anything to emit now or in the future.
    /// Used by the tick loop to skip idle channels cheaply.
    #[inline]
    pub fn has_work(&self) -> bool {
        !self.pending_messages.is_empty() || !self.in_flight.is_empty()
    }

    /// The single emission point, returning at most one packet per call.
    /// Retransmission strictly precedes fresh emission so that a stalled peer
    /// cannot starve recovery: the first in-flight packet due for resend is
    /// returned before any queued frame gets a sequence number.
    pub fn get_packet(&mut self, now: Instant) -> Option<SendPacket<'_>> {

        let due = self.in_flight.iter()
            .position(|packet| now.duration_since(packet.time) >= RESEND_TIMEOUT);

        if let Some(index) = due {
            let packet = &mut self.in_flight[index];
            packet.time = now;
            packet.retries += 1;
            trace!(channel = %self.channel, start = %packet.start, retries = packet.retries, "resend packet");
            let packet = &self.in_flight[index];
            return Some(SendPacket {
                start: packet.start,
                payload: &packet.payload,
                resend: true,
            });
        }

        let frame = self.pending_messages.pop_front()?;
        let start = self.next_index;
        self.next_index += frame.len() as u32;

        trace!(channel = %self.channel, %start, len = frame.len(), "fresh packet");
        self.in_flight.push_back(InFlightPacket {
            start,
            payload: frame,
            time: now,
            retries: 0,
        });

        let packet = self.in_flight.back()?;
        Some(SendPacket {
            start: packet.start,
            payload: &packet.payload,
            resend: false,
        })

    }

    /// Handle an acknowledgment for the given sequence start. If the start
    /// matches an in-flight packet, the packet is dropped and its length
    /// recorded; otherwise the start is recorded with an unknown length so
    /// that a lost in-flight record cannot silently collapse the frontier.
    /// The frontier then advances over every contiguously recorded length,
    /// stopping on unknown-length entries; a later ack that still finds the
    /// start in flight upgrades the recorded length and resumes advancement.
    pub fn handle_ack(&mut self, start: Seq) {

        if let Some(index) = self.in_flight.iter().position(|packet| packet.start == start) {
            if let Some(packet) = self.in_flight.remove(index) {
                trace!(channel = %self.channel, %start, retries = packet.retries, "acked packet");
                self.acked.insert(start, packet.payload.len() as u32);
            }
        } else if !self.acked.contains_key(&start) {
            trace!(channel = %self.channel, %start, "acked unknown start");
            self.acked.insert(start, 0);
        }

        while let Some(&len) = self.acked.get(&self.fully_confirmed) {
            if len == 0 {
                // Unknown length, cannot advance past this start yet.
                break;
            }
            self.acked.remove(&self.fully_confirmed);
            self.fully_confirmed += len;
        }

        // Entries the frontier moved past are stale duplicates.
        let frontier = self.fully_confirmed;
        self.acked.retain(|&start, _| !start.is_before(frontier));

    }

}


/// The receive side of a reliable channel: admits packets in any order,
/// reassembles the contiguous byte stream and drains length-prefixed message
/// frames out of it.
#[derive(Debug)]
pub struct ReceiveChannel {
    /// The channel this receive side belongs to.
    channel: ChannelId,
    /// The next contiguous sequence number awaited.
    expected: Seq,
    /// Packets admitted ahead of the contiguous stream, keyed by their start.
    pending: HashMap<Seq, Vec<u8>>,
    /// Contiguous reassembled stream not yet consumed by message decoding,
    /// kept as borrowless fragments walked front to back.
    chunks: VecDeque<Chunk>,
    /// Total unread bytes across chunks.
    buffered_len: usize,
    /// Message header decoded while its body was not yet fully buffered,
    /// remembered across drain passes.
    partial_header: Option<FrameHeader>,
}

/// A contiguous fragment of the reassembled stream, partially consumed.
#[derive(Debug)]
struct Chunk {
    data: Vec<u8>,
    offset: usize,
}

/// A decoded frame header: protocol id and body size.
#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    protocol_id: u8,
    size: usize,
}

/// A message decoded from a channel's byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub protocol_id: u8,
    pub data: Vec<u8>,
}

impl ReceiveChannel {

    /// Create the receive side of a channel, starting at the sequence origin
    /// announced by the peer.
    pub fn new(channel: ChannelId, initial_seq: Seq) -> Self {
        Self {
            channel,
            expected: initial_seq,
            pending: HashMap::new(),
            chunks: VecDeque::new(),
            buffered_len: 0,
            partial_header: None,
        }
    }

    /// The channel this receive side belongs to.
    #[inline]
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// The next contiguous sequence number awaited.
    #[inline]
    pub fn expected(&self) -> Seq {
        self.expected
    }

    /// Total reassembled bytes not yet consumed by message decoding.
    #[inline]
    pub fn buffered_len(&self) -> usize {
        self.buffered_len
    }

    /// Number of packets admitted ahead of the contiguous stream.
    #[inline]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Handle a sequenced packet observed on this channel, returning the
    /// messages that became complete. Stale and duplicate packets yield no
    /// message but are still observed: the caller must acknowledge the start
    /// of every packet given here, so that the peer stops retransmitting it.
    ///
    /// A varint error is fatal to the decoding of the stream and the caller
    /// should drop the offending datagram.
    pub fn handle_packet(&mut self, start: Seq, payload: Vec<u8>) -> Result<Vec<Message>, VarintError> {

        if start.is_before(self.expected) || self.pending.contains_key(&start) {
            trace!(channel = %self.channel, %start, "duplicate packet");
            return Ok(Vec::new());
        }

        self.pending.insert(start, payload);

        // The new packet may have filled the gap right at the expected
        // sequence, pull every contiguous packet into the stream.
        let mut progress = false;
        while let Some(data) = self.pending.remove(&self.expected) {
            trace!(channel = %self.channel, start = %self.expected, len = data.len(), "contiguous packet");
            self.expected += data.len() as u32;
            if !data.is_empty() {
                self.buffered_len += data.len();
                self.chunks.push_back(Chunk { data, offset: 0 });
            }
            progress = true;
        }

        if progress {
            self.drain_messages()
        } else {
            Ok(Vec::new())
        }

    }

    /// Decode as many complete messages as the buffered stream allows,
    /// leaving a partially received header or body untouched for the next
    /// pass.
    fn drain_messages(&mut self) -> Result<Vec<Message>, VarintError> {

        let mut messages = Vec::new();

        loop {

            let header = match self.partial_header {
                Some(header) => header,
                None => {
                    // Peek the frame header, protocol id then varint size,
                    // which may straddle chunk boundaries.
                    let mut raw = [0u8; 1 + VAR_U32_MAX_LEN];
                    let available = self.peek(&mut raw);
                    if available < 2 {
                        break;
                    }
                    let Some((size, size_len)) = codec::read_var_u32(&raw[1..available])? else {
                        break;
                    };
                    let header = FrameHeader { protocol_id: raw[0], size: size as usize };
                    self.consume(1 + size_len);
                    self.partial_header = Some(header);
                    header
                }
            };

            if self.buffered_len < header.size {
                break;
            }

            let data = self.take(header.size);
            self.partial_header = None;
            trace!(channel = %self.channel, protocol_id = header.protocol_id, len = data.len(), "message");
            messages.push(Message { protocol_id: header.protocol_id, data });

        }

        Ok(messages)

    }

    /// Copy up to `buf.len()` bytes from the front of the stream without
    /// consuming them, returning how many were available.
    fn peek(&self, buf: &mut [u8]) -> usize {
        let mut len = 0;
        for chunk in &self.chunks {
            for &byte in &chunk.data[chunk.offset..] {
                if len == buf.len() {
                    return len;
                }
                buf[len] = byte;
                len += 1;
            }
        }
        len
    }

    /// Discard the given number of bytes from the front of the stream. The
    /// caller must not consume more than `buffered_len`.
    fn consume(&mut self, mut count: usize) {
        debug_assert!(count <= self.buffered_len);
        self.buffered_len -= count;
        while count != 0 {
            let Some(chunk) = self.chunks.front_mut() else { return };
            let available = chunk.data.len() - chunk.offset;
            if count < available {
                chunk.offset += count;
                return;
            }
            count -= available;
            self.chunks.pop_front();
        }
    }

    /// Consume the given number of bytes from the front of the stream into a
    /// fresh contiguous buffer. The caller must not take more than
    /// `buffered_len`.
    fn take(&mut self, count: usize) -> Vec<u8> {
        debug_assert!(count <= self.buffered_len);
        self.buffered_len -= count;
        let mut data = Vec::with_capacity(count);
        let mut remaining = count;
        while remaining != 0 {
            let Some(chunk) = self.chunks.front_mut() else { break };
            let available = chunk.data.len() - chunk.offset;
            if remaining < available {
                data.extend_from_slice(&chunk.data[chunk.offset..chunk.offset + remaining]);
                chunk.offset += remaining;
                break;
            }
            data.extend_from_slice(&chunk.data[chunk.offset..]);
            remaining -= available;
            self.chunks.pop_front();
        }
        data
    }

}
