//! The client connection: the protocol state machine driven over a real UDP
//! socket by a periodic tick.

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use tracing::{trace, warn};

use super::channel::MessageTooLarge;
use super::packet::{ChannelId, MTU};
use super::proto::{ConnectionPhase, Event, Protocol, TICK_INTERVAL};
use super::socket::ClientSocket;
use crate::util::BytesFmt;


/// A connection to a voxel game server over a single UDP flow. It owns the
/// socket and the [`Protocol`] state machine, flushing its datagrams and
/// draining its events from a 20 ms periodic tick driven by the socket poll.
///
/// All entry points run on the caller's thread; the structure is not meant
/// to be shared and a caller spanning threads must wrap it in a mutex.
pub struct Connection {
    /// Internal socket for this connection.
    socket: ClientSocket,
    /// The state machine driven over the socket.
    proto: Protocol,
    /// Deadline of the next periodic tick.
    next_tick: Instant,
}

impl Connection {

    /// Bind an ephemeral port toward the given server address. The handshake
    /// message is queued on the fast channel once the init exchange
    /// completes. No datagram is sent before [`Self::start`].
    pub fn new(addr: SocketAddr, handshake_protocol_id: u8, handshake_body: Vec<u8>) -> io::Result<Self> {
        let now = Instant::now();
        Ok(Self {
            socket: ClientSocket::connect(addr)?,
            proto: Protocol::new(now, handshake_protocol_id, handshake_body),
            next_tick: now,
        })
    }

    /// Local address the connection is bound to.
    #[inline]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Current transport phase of the connection.
    #[inline]
    pub fn phase(&self) -> ConnectionPhase {
        self.proto.phase()
    }

    /// Begin the handshake, sending the first init datagram.
    pub fn start(&mut self) {
        let now = Instant::now();
        self.proto.tick(now);
        self.next_tick = now + TICK_INTERVAL;
        self.flush();
    }

    /// Queue a message on one of the three channels, to be emitted by an
    /// upcoming tick.
    pub fn queue_outgoing(&mut self, channel: ChannelId, protocol_id: u8, body: &[u8]) -> Result<(), MessageTooLarge> {
        self.proto.queue_outgoing(channel, protocol_id, body)
    }

    /// Wait until the next tick deadline, handling any datagram received in
    /// the meantime, then run the due tick work and drain the produced
    /// events into the given vector.
    ///
    /// *Note that* the list of events is cleared internally prior to polling.
    pub fn poll(&mut self, events: &mut Vec<Event>) -> io::Result<()> {

        events.clear();

        let now = Instant::now();
        if now < self.next_tick {
            self.socket.poll(Some(self.next_tick - now))?;
        }

        let mut buf = [0u8; MTU];
        let now = Instant::now();
        while let Some(len) = self.socket.recv(&mut buf)? {
            trace!("received {:X}", BytesFmt(&buf[..len]));
            self.proto.handle_datagram(&buf[..len], now);
        }

        let now = Instant::now();
        while now >= self.next_tick {
            self.proto.tick(now);
            self.next_tick += TICK_INTERVAL;
        }
        self.flush();

        while let Some(event) = self.proto.poll_event() {
            events.push(event);
        }

        Ok(())

    }

    /// Close the connection, sending a disconnect datagram to the server
    /// unless `notify` is false. Idempotent.
    pub fn close(&mut self, notify: bool) {
        self.proto.close(notify);
        self.flush();
        self.proto.finalize();
    }

    /// Send every datagram the protocol produced. Transient send errors are
    /// logged and otherwise ignored, the retransmit timer covers the loss.
    fn flush(&mut self) {
        while let Some(datagram) = self.proto.pop_outgoing() {
            trace!("sending {:X}", BytesFmt(&datagram));
            if let Err(error) = self.socket.send(&datagram) {
                warn!("failed to send datagram: {error}");
            }
        }
    }

}
