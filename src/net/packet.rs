//! Datagram layout: channel identities, size constants, parsing of sequenced
//! datagrams and codecs for the control datagrams.

use std::fmt;

use byteorder::{ByteOrder, BE};

use super::seq::Seq;


/// Maximum size of a datagram the protocol guarantees deliverable, chosen to
/// fit the IPv4 minimum reassembly buffer. Must match the peer.
pub const MTU: usize = 548;
/// Length of the sequenced datagram header: channel id plus sequence start.
pub const PACKET_HEADER_LEN: usize = 5;
/// Maximum length of the message frame carried by a single sequenced datagram.
pub const MAX_FRAME_LEN: usize = MTU - PACKET_HEADER_LEN;
/// Length of one confirmation datagram entry: channel id, delay and start.
pub const CONFIRMATION_ENTRY_LEN: usize = 7;
/// Length of the long init datagram: control byte, connection id and the
/// three channel sequence origins.
pub const INIT_LONG_LEN: usize = 21;
/// Length of the short init datagram echoing the remote connection id.
pub const INIT_ACK_LEN: usize = 9;

/// This module defines the control bytes leading every datagram that is not
/// carried by a sequenced channel.
pub mod id {
    pub const CONFIRMATION: u8  = 3;
    pub const INIT: u8          = 4;
    pub const KEEP_ALIVE: u8    = 5;
    pub const DISCONNECT: u8    = 6;
}


/// Identity of one of the three sequenced channels. The names reflect the
/// transport intent of the upper layers, the three channels themselves behave
/// as identical reliable byte streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelId {
    Lossy = 0,
    Fast = 1,
    Slow = 2,
}

impl ChannelId {

    /// All three channels, in [`Self::index`] order.
    pub const ALL: [ChannelId; 3] = [Self::Lossy, Self::Fast, Self::Slow];

    /// Create a channel identity from the leading byte of a datagram,
    /// returning none for control bytes and unknown values.
    #[inline]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Lossy),
            1 => Some(Self::Fast),
            2 => Some(Self::Slow),
            _ => None,
        }
    }

    /// The raw byte leading datagrams of this channel.
    #[inline]
    pub fn raw(self) -> u8 {
        self as u8
    }

    /// Index of this channel in per-channel arrays.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lossy => f.write_str("lossy"),
            Self::Fast => f.write_str("fast"),
            Self::Slow => f.write_str("slow"),
        }
    }
}


/// Kind of error that caused a datagram to be rejected at parse time.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PacketError {
    /// The datagram is too short for its expected layout.
    #[error("datagram too short: {len} bytes")]
    TooShort { len: usize },
    /// The leading byte is not a sequenced channel id.
    #[error("unexpected control byte: {raw}")]
    UnexpectedControl { raw: u8 },
    /// A confirmation entry names a channel that does not exist.
    #[error("invalid channel byte: {raw}")]
    InvalidChannel { raw: u8 },
}


/// A sequenced datagram as parsed from the wire, borrowing its payload.
#[derive(Debug, Clone, Copy)]
pub struct ChannelPacket<'a> {
    pub channel: ChannelId,
    pub start: Seq,
    pub payload: &'a [u8],
}

/// Parse a raw datagram whose leading byte is expected to be a sequenced
/// channel id, rejecting control bytes and truncated buffers. The sequence
/// start is read big-endian right after the channel byte.
pub fn parse_channel_packet(data: &[u8]) -> Result<ChannelPacket<'_>, PacketError> {

    if data.len() < PACKET_HEADER_LEN {
        return Err(PacketError::TooShort { len: data.len() });
    }

    let channel = ChannelId::from_raw(data[0])
        .ok_or(PacketError::UnexpectedControl { raw: data[0] })?;

    Ok(ChannelPacket {
        channel,
        start: Seq::new(BE::read_i32(&data[1..5])),
        payload: &data[PACKET_HEADER_LEN..],
    })

}

/// Build a sequenced datagram for the given channel, sequence start and frame
/// payload.
pub fn write_channel_packet(channel: ChannelId, start: Seq, payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(PACKET_HEADER_LEN + payload.len());
    data.push(channel.raw());
    data.extend_from_slice(&start.get().to_be_bytes());
    data.extend_from_slice(payload);
    data
}


/// The long init datagram advertising a connection id and the sequence
/// origins of the three channels, in channel index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitPacket {
    pub connection_id: i64,
    pub initial_seqs: [Seq; 3],
}

impl InitPacket {

    /// Encode this init datagram, control byte included.
    pub fn write(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(INIT_LONG_LEN);
        data.push(id::INIT);
        data.extend_from_slice(&self.connection_id.to_be_bytes());
        for seq in self.initial_seqs {
            data.extend_from_slice(&seq.get().to_be_bytes());
        }
        data
    }

    /// Decode a long init datagram, control byte included.
    pub fn read(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < INIT_LONG_LEN {
            return Err(PacketError::TooShort { len: data.len() });
        }
        Ok(Self {
            connection_id: BE::read_i64(&data[1..9]),
            initial_seqs: [
                Seq::new(BE::read_i32(&data[9..13])),
                Seq::new(BE::read_i32(&data[13..17])),
                Seq::new(BE::read_i32(&data[17..21])),
            ],
        })
    }

}

/// Build the short init datagram echoing the remote connection id back.
pub fn write_init_ack(remote_id: i64) -> Vec<u8> {
    let mut data = Vec::with_capacity(INIT_ACK_LEN);
    data.push(id::INIT);
    data.extend_from_slice(&remote_id.to_be_bytes());
    data
}


/// One entry of a confirmation datagram: the channel and sequence start of an
/// observed sequenced datagram, with the half-RTT delay echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationEntry {
    pub channel: ChannelId,
    pub delay: u16,
    pub start: Seq,
}

/// Parse the entries of a confirmation datagram, the leading control byte
/// excluded. Entries are packed back to back until the buffer ends, trailing
/// bytes that do not form a full entry make the datagram invalid.
pub fn parse_confirmation_entries(data: &[u8]) -> Result<Vec<ConfirmationEntry>, PacketError> {

    if data.len() % CONFIRMATION_ENTRY_LEN != 0 {
        return Err(PacketError::TooShort { len: data.len() });
    }

    let mut entries = Vec::with_capacity(data.len() / CONFIRMATION_ENTRY_LEN);
    for entry in data.chunks_exact(CONFIRMATION_ENTRY_LEN) {
        entries.push(ConfirmationEntry {
            channel: ChannelId::from_raw(entry[0])
                .ok_or(PacketError::InvalidChannel { raw: entry[0] })?,
            delay: BE::read_u16(&entry[1..3]),
            start: Seq::new(BE::read_i32(&entry[3..7])),
        });
    }

    Ok(entries)

}

/// Build a confirmation datagram from the given entries, control byte
/// included.
pub fn write_confirmation(entries: &[ConfirmationEntry]) -> Vec<u8> {
    let mut data = Vec::with_capacity(1 + entries.len() * CONFIRMATION_ENTRY_LEN);
    data.push(id::CONFIRMATION);
    for entry in entries {
        data.push(entry.channel.raw());
        data.extend_from_slice(&entry.delay.to_be_bytes());
        data.extend_from_slice(&entry.start.get().to_be_bytes());
    }
    data
}
