//! Connection state machine, socket-free: it consumes inbound datagrams and
//! clock ticks, and produces outbound datagrams and events.

use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime};

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, trace, warn};

use super::channel::{MessageTooLarge, ReceiveChannel, SendChannel};
use super::packet::{self, id, ChannelId, ConfirmationEntry, InitPacket};
use super::seq::Seq;


/// Period of the tick driving emission, confirmation flushing and timeout
/// detection.
pub const TICK_INTERVAL: Duration = Duration::from_millis(20);
/// Interval between resends of the init datagram while the server has not
/// answered.
pub const INIT_RESEND_INTERVAL: Duration = Duration::from_millis(100);
/// Maximum number of confirmation entries flushed into a single datagram.
pub const CONFIRMATION_BATCH_SIZE: usize = 16;
/// Interval between keep-alive datagrams.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(2000);
/// Duration of inbound silence after which the connection times out, four
/// keep-alive intervals.
pub const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_millis(8000);


/// Transport phase of the connection. This is distinct from the
/// handshake-complete flag: the phase tracks the transport lifecycle while
/// the flag remembers that the init exchange completed at some point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// The init datagram is being sent, the server has not answered yet.
    AwaitingServer,
    /// Init exchange completed, the channels are operational.
    Connected,
    /// Shutdown initiated, the final datagrams may still be in flight.
    Closing,
    /// Fully terminated.
    Closed,
}

/// An event produced by the connection for the application.
#[derive(Debug)]
pub enum Event {
    /// The init exchange completed and the three channels are operational.
    Connected,
    /// A message was received on one of the sequenced channels.
    Protocol(ProtocolEvent),
    /// The connection terminated, fired at most once per connection.
    Disconnect(DisconnectEvent),
}

/// A message received on one of the sequenced channels.
#[derive(Debug)]
pub struct ProtocolEvent {
    /// The channel the message arrived on.
    pub channel: ChannelId,
    /// Application protocol id of the message.
    pub protocol_id: u8,
    /// The message body.
    pub data: Vec<u8>,
}

/// The connection terminated.
#[derive(Debug)]
pub struct DisconnectEvent {
    pub reason: DisconnectReason,
}

/// Why the connection terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server sent a disconnect datagram.
    Server,
    /// Nothing was received from the server within the keep-alive window.
    Timeout,
}

/// A confirmation waiting to be flushed, with the time the confirmed packet
/// was observed, later echoed as the half-RTT delay.
#[derive(Debug)]
struct PendingConfirmation {
    channel: ChannelId,
    start: Seq,
    time: Instant,
}


/// The connection state machine over the three reliable channel pairs:
/// handshake, confirmation batching, keep-alive and shutdown. It is driven
/// by [`handle_datagram`](Self::handle_datagram) and [`tick`](Self::tick),
/// and produces outbound datagrams and events retrieved with
/// [`pop_outgoing`](Self::pop_outgoing) and [`poll_event`](Self::poll_event).
/// The [`Connection`](super::app::Connection) runs it over a real socket.
#[derive(Debug)]
pub struct Protocol {
    /// Our connection id, advertised in the init datagram.
    local_id: i64,
    /// The server's connection id, learned during the handshake.
    remote_id: Option<i64>,
    phase: ConnectionPhase,
    /// Set once the init exchange completed, stays set while closing.
    handshake_complete: bool,
    /// Sequence origins of our three send channels, advertised in the init.
    initial_seqs: [Seq; 3],
    send_channels: [SendChannel; 3],
    /// Instantiated only once the server's init announced its own origins.
    recv_channels: Option<[ReceiveChannel; 3]>,
    /// Confirmations waiting to be flushed, oldest first.
    pending_confirmations: VecDeque<PendingConfirmation>,
    /// Message queued on the fast channel once the handshake completes.
    handshake_message: Option<(u8, Vec<u8>)>,
    last_inbound: Instant,
    last_keepalive_sent: Instant,
    last_init_sent: Option<Instant>,
    disconnect_sent: bool,
    disconnect_emitted: bool,
    /// Datagrams ready to be put on the wire, oldest first.
    outgoing: VecDeque<Vec<u8>>,
    /// Events ready to be observed by the application, oldest first.
    events: VecDeque<Event>,
}

impl Protocol {

    /// Create the state machine in the awaiting-server phase. The handshake
    /// message is queued on the fast channel as soon as the init exchange
    /// completes. The first init datagram is produced by the first tick.
    pub fn new(now: Instant, handshake_protocol_id: u8, handshake_body: Vec<u8>) -> Self {

        let initial_seqs = [Seq::random(), Seq::random(), Seq::random()];

        Self {
            local_id: new_connection_id(),
            remote_id: None,
            phase: ConnectionPhase::AwaitingServer,
            handshake_complete: false,
            initial_seqs,
            send_channels: ChannelId::ALL
                .map(|channel| SendChannel::new(channel, initial_seqs[channel.index()])),
            recv_channels: None,
            pending_confirmations: VecDeque::new(),
            handshake_message: Some((handshake_protocol_id, handshake_body)),
            last_inbound: now,
            last_keepalive_sent: now,
            last_init_sent: None,
            disconnect_sent: false,
            disconnect_emitted: false,
            outgoing: VecDeque::new(),
            events: VecDeque::new(),
        }

    }

    /// Our connection id, advertised in the init datagram.
    #[inline]
    pub fn local_id(&self) -> i64 {
        self.local_id
    }

    /// The server's connection id, if the handshake completed.
    #[inline]
    pub fn remote_id(&self) -> Option<i64> {
        self.remote_id
    }

    #[inline]
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Return true if the init exchange completed at some point, even if the
    /// connection has been closing since.
    #[inline]
    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    /// The send side of the given channel.
    #[inline]
    pub fn send_channel(&self, channel: ChannelId) -> &SendChannel {
        &self.send_channels[channel.index()]
    }

    /// The receive side of the given channel, present once connected.
    #[inline]
    pub fn recv_channel(&self, channel: ChannelId) -> Option<&ReceiveChannel> {
        self.recv_channels.as_ref().map(|channels| &channels[channel.index()])
    }

    /// Queue a message on one of the three channels, to be emitted by an
    /// upcoming tick.
    pub fn queue_outgoing(&mut self, channel: ChannelId, protocol_id: u8, body: &[u8]) -> Result<(), MessageTooLarge> {
        self.send_channels[channel.index()].queue(protocol_id, body)
    }

    /// Pop the next datagram to put on the wire, if any.
    #[inline]
    pub fn pop_outgoing(&mut self) -> Option<Vec<u8>> {
        self.outgoing.pop_front()
    }

    /// Pop the next pending event, if any.
    #[inline]
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Advance the periodic tick: resend the init while awaiting the server,
    /// detect inbound silence, emit keep-alives, flush one batch of pending
    /// confirmations and emit one due packet per channel.
    pub fn tick(&mut self, now: Instant) {

        if matches!(self.phase, ConnectionPhase::Closing | ConnectionPhase::Closed) {
            return;
        }

        if self.phase == ConnectionPhase::AwaitingServer {
            let due = self.last_init_sent
                .map_or(true, |time| now.duration_since(time) >= INIT_RESEND_INTERVAL);
            if due {
                self.send_init(now);
            }
        }

        if self.phase == ConnectionPhase::Connected
            && now.duration_since(self.last_inbound) >= KEEP_ALIVE_TIMEOUT
        {
            warn!("server timed out");
            self.emit_disconnect(DisconnectReason::Timeout);
            self.close(false);
            return;
        }

        if now.duration_since(self.last_keepalive_sent) >= KEEP_ALIVE_INTERVAL {
            self.last_keepalive_sent = now;
            self.outgoing.push_back(vec![id::KEEP_ALIVE]);
        }

        self.flush_confirmations(now);

        for channel in &mut self.send_channels {
            if !channel.has_work() {
                continue;
            }
            let channel_id = channel.channel();
            if let Some(sent) = channel.get_packet(now) {
                self.outgoing.push_back(packet::write_channel_packet(channel_id, sent.start, sent.payload));
            }
        }

    }

    /// Handle a datagram received from the server.
    pub fn handle_datagram(&mut self, data: &[u8], now: Instant) {

        if matches!(self.phase, ConnectionPhase::Closing | ConnectionPhase::Closed) {
            return;
        }

        self.last_inbound = now;

        let Some(&control) = data.first() else {
            debug!("ignoring empty datagram");
            return;
        };

        match control {
            id::CONFIRMATION => self.handle_confirmation(&data[1..]),
            id::INIT => self.handle_init(data),
            id::KEEP_ALIVE => {}
            id::DISCONNECT => {
                debug!("server requested disconnect");
                self.emit_disconnect(DisconnectReason::Server);
                self.close(false);
            }
            _ => self.handle_channel_packet(data, now),
        }

    }

    /// Initiate the connection shutdown, sending a disconnect datagram to the
    /// server unless `notify` is false. Idempotent, closing an already
    /// closing or closed connection does nothing.
    pub fn close(&mut self, notify: bool) {

        if matches!(self.phase, ConnectionPhase::Closing | ConnectionPhase::Closed) {
            return;
        }

        if notify && !self.disconnect_sent {
            self.disconnect_sent = true;
            self.outgoing.push_back(vec![id::DISCONNECT]);
        }

        debug!("closing");
        self.phase = ConnectionPhase::Closing;

    }

    /// Terminate the shutdown once the final datagrams got a chance to be
    /// sent. Idempotent, and only meaningful after [`Self::close`].
    pub fn finalize(&mut self) {
        if self.phase == ConnectionPhase::Closing {
            self.phase = ConnectionPhase::Closed;
        }
    }

    fn send_init(&mut self, now: Instant) {
        self.last_init_sent = Some(now);
        trace!(local_id = self.local_id, "send init");
        self.outgoing.push_back(InitPacket {
            connection_id: self.local_id,
            initial_seqs: self.initial_seqs,
        }.write());
    }

    /// Handle an inbound init datagram. The long form carries the server's
    /// connection id and sequence origins and completes the handshake; the
    /// short form merely echoes a connection id and is ignored.
    fn handle_init(&mut self, data: &[u8]) {

        if self.phase != ConnectionPhase::AwaitingServer {
            trace!("ignoring init, already connected");
            return;
        }

        let init = match InitPacket::read(data) {
            Ok(init) => init,
            Err(_) if data.len() == packet::INIT_ACK_LEN => {
                debug!("ignoring short init echo");
                return;
            }
            Err(error) => {
                warn!("invalid init datagram: {error}");
                return;
            }
        };

        self.remote_id = Some(init.connection_id);
        self.recv_channels = Some(ChannelId::ALL
            .map(|channel| ReceiveChannel::new(channel, init.initial_seqs[channel.index()])));

        self.outgoing.push_back(packet::write_init_ack(init.connection_id));

        if let Some((protocol_id, body)) = self.handshake_message.take() {
            if let Err(error) = self.send_channels[ChannelId::Fast.index()].queue(protocol_id, &body) {
                warn!("handshake message rejected: {error}");
            }
        }

        self.phase = ConnectionPhase::Connected;
        self.handshake_complete = true;
        debug!(remote_id = init.connection_id, "connected");
        self.events.push_back(Event::Connected);

    }

    /// Route every entry of a confirmation datagram to its send channel. The
    /// delay field echoes the peer's half-RTT estimate and is not used.
    fn handle_confirmation(&mut self, data: &[u8]) {
        match packet::parse_confirmation_entries(data) {
            Ok(entries) => {
                for entry in entries {
                    self.send_channels[entry.channel.index()].handle_ack(entry.start);
                }
            }
            Err(error) => warn!("invalid confirmation datagram: {error}"),
        }
    }

    /// Route a sequenced datagram to its receive channel, enqueue the
    /// confirmation of its observed start and forward the decoded messages.
    fn handle_channel_packet(&mut self, data: &[u8], now: Instant) {

        let Some(recv_channels) = &mut self.recv_channels else {
            // Sequence origins are not known before the server's init.
            trace!("dropping sequenced datagram before handshake");
            return;
        };

        let sequenced = match packet::parse_channel_packet(data) {
            Ok(sequenced) => sequenced,
            Err(error) => {
                warn!("invalid sequenced datagram: {error}");
                return;
            }
        };

        let channel = sequenced.channel;
        match recv_channels[channel.index()].handle_packet(sequenced.start, sequenced.payload.to_vec()) {
            Ok(messages) => {
                self.pending_confirmations.push_back(PendingConfirmation {
                    channel,
                    start: sequenced.start,
                    time: now,
                });
                for message in messages {
                    self.events.push_back(Event::Protocol(ProtocolEvent {
                        channel,
                        protocol_id: message.protocol_id,
                        data: message.data,
                    }));
                }
            }
            Err(error) => warn!(channel = %channel, "dropping sequenced datagram: {error}"),
        }

    }

    /// Flush up to one batch of pending confirmations into a single datagram.
    fn flush_confirmations(&mut self, now: Instant) {

        if self.pending_confirmations.is_empty() {
            return;
        }

        let count = self.pending_confirmations.len().min(CONFIRMATION_BATCH_SIZE);
        let entries = self.pending_confirmations.drain(..count)
            .map(|confirmation| ConfirmationEntry {
                channel: confirmation.channel,
                // Echo half of the time the packet spent waiting for this
                // flush, saturated to the field's range.
                delay: (now.duration_since(confirmation.time).as_millis() / 2).min(0xFFFF) as u16,
                start: confirmation.start,
            })
            .collect::<Vec<_>>();

        trace!(count, "flush confirmations");
        self.outgoing.push_back(packet::write_confirmation(&entries));

    }

    /// Push the disconnect event, at most once per connection.
    fn emit_disconnect(&mut self, reason: DisconnectReason) {
        if !self.disconnect_emitted {
            self.disconnect_emitted = true;
            self.events.push_back(Event::Disconnect(DisconnectEvent { reason }));
        }
    }

}

/// Derive a connection id from the wall clock in milliseconds shifted left by
/// 20 bits, or-ed with 20 random bits, truncated to 64-bit signed.
fn new_connection_id() -> i64 {
    let millis = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64;
    millis.wrapping_shl(20) | (OsRng.next_u32() & 0xF_FFFF) as i64
}


#[cfg(test)]
mod tests {

    use super::*;

    const SERVER_ID: i64 = 0x1122_3344_5566_7788;

    fn server_init() -> InitPacket {
        InitPacket {
            connection_id: SERVER_ID,
            initial_seqs: [Seq::new(1000), Seq::new(2000), Seq::new(3000)],
        }
    }

    /// Create a protocol and complete its handshake, returning it with the
    /// base instant and our advertised init. The handshake frame queued on
    /// the fast channel is emitted and acknowledged so that every channel
    /// starts idle.
    fn connected() -> (Protocol, Instant, InitPacket) {

        let t0 = Instant::now();
        let mut proto = Protocol::new(t0, 0x10, vec![0xCA, 0xFE]);
        proto.tick(t0);
        let init = InitPacket::read(&proto.pop_outgoing().unwrap()).unwrap();
        proto.handle_datagram(&server_init().write(), t0);

        proto.tick(t0);
        proto.handle_datagram(&packet::write_confirmation(&[ConfirmationEntry {
            channel: ChannelId::Fast,
            delay: 0,
            start: init.initial_seqs[ChannelId::Fast.index()],
        }]), t0);
        drain_outgoing(&mut proto);
        assert!(!proto.send_channel(ChannelId::Fast).has_work());

        (proto, t0, init)

    }

    fn drain_outgoing(proto: &mut Protocol) -> Vec<Vec<u8>> {
        let mut datagrams = Vec::new();
        while let Some(datagram) = proto.pop_outgoing() {
            datagrams.push(datagram);
        }
        datagrams
    }

    #[test]
    fn handshake() {

        let t0 = Instant::now();
        let mut proto = Protocol::new(t0, 0x10, vec![0xCA, 0xFE]);
        assert_eq!(proto.phase(), ConnectionPhase::AwaitingServer);
        assert!(!proto.is_handshake_complete());

        // The first tick emits the long init with our id and origins.
        proto.tick(t0);
        let init_out = proto.pop_outgoing().unwrap();
        assert_eq!(init_out.len(), packet::INIT_LONG_LEN);
        assert_eq!(init_out[0], id::INIT);
        let init = InitPacket::read(&init_out).unwrap();
        assert_eq!(init.connection_id, proto.local_id());
        for channel in ChannelId::ALL {
            assert_eq!(init.initial_seqs[channel.index()], proto.send_channel(channel).next_index());
        }

        // The server's init completes the handshake.
        proto.handle_datagram(&server_init().write(), t0);
        assert_eq!(proto.phase(), ConnectionPhase::Connected);
        assert!(proto.is_handshake_complete());
        assert_eq!(proto.remote_id(), Some(SERVER_ID));
        assert!(matches!(proto.poll_event(), Some(Event::Connected)));
        assert!(proto.poll_event().is_none());

        // Receive channels start at the server's advertised origins.
        assert_eq!(proto.recv_channel(ChannelId::Lossy).unwrap().expected(), Seq::new(1000));
        assert_eq!(proto.recv_channel(ChannelId::Fast).unwrap().expected(), Seq::new(2000));
        assert_eq!(proto.recv_channel(ChannelId::Slow).unwrap().expected(), Seq::new(3000));

        // The short init ack echoes the server id, and the handshake message
        // waits on the fast channel.
        let ack = proto.pop_outgoing().unwrap();
        assert_eq!(ack, packet::write_init_ack(SERVER_ID));
        assert_eq!(proto.send_channel(ChannelId::Fast).pending_len(), 1);

        // Late init resends are ignored once connected.
        proto.handle_datagram(&server_init().write(), t0);
        assert!(proto.poll_event().is_none());

    }

    #[test]
    fn init_resend_interval() {

        let t0 = Instant::now();
        let mut proto = Protocol::new(t0, 0, Vec::new());

        proto.tick(t0);
        assert_eq!(drain_outgoing(&mut proto).len(), 1);

        // Not due yet at 50 ms, due again at 100 ms.
        proto.tick(t0 + Duration::from_millis(50));
        assert_eq!(drain_outgoing(&mut proto).len(), 0);
        proto.tick(t0 + Duration::from_millis(100));
        let datagrams = drain_outgoing(&mut proto);
        assert_eq!(datagrams.len(), 1);
        assert_eq!(datagrams[0][0], id::INIT);

        // A short init echo does not complete the handshake.
        proto.handle_datagram(&packet::write_init_ack(proto.local_id()), t0 + Duration::from_millis(110));
        assert_eq!(proto.phase(), ConnectionPhase::AwaitingServer);
        proto.tick(t0 + Duration::from_millis(200));
        assert_eq!(drain_outgoing(&mut proto).len(), 1);

    }

    #[test]
    fn keep_alive_emission() {

        let (mut proto, t0, _init) = connected();
        drain_outgoing(&mut proto);

        proto.tick(t0 + Duration::from_millis(1999));
        assert!(drain_outgoing(&mut proto).is_empty());

        proto.tick(t0 + Duration::from_millis(2000));
        assert_eq!(drain_outgoing(&mut proto), [vec![id::KEEP_ALIVE]]);

        // Rearmed after each emission.
        proto.tick(t0 + Duration::from_millis(3999));
        assert!(drain_outgoing(&mut proto).is_empty());
        proto.tick(t0 + Duration::from_millis(4000));
        assert_eq!(drain_outgoing(&mut proto), [vec![id::KEEP_ALIVE]]);

    }

    #[test]
    fn keep_alive_timeout() {

        let (mut proto, t0, _init) = connected();
        drain_outgoing(&mut proto);
        assert!(proto.poll_event().is_some());

        // Inbound traffic pushes the deadline.
        proto.handle_datagram(&[id::KEEP_ALIVE], t0 + Duration::from_millis(5000));
        proto.tick(t0 + Duration::from_millis(8001));
        assert_eq!(proto.phase(), ConnectionPhase::Connected);

        proto.tick(t0 + Duration::from_millis(13001));
        assert_eq!(proto.phase(), ConnectionPhase::Closing);
        let Some(Event::Disconnect(event)) = proto.poll_event() else {
            panic!("expected disconnect event");
        };
        assert_eq!(event.reason, DisconnectReason::Timeout);

        // Silent close: no disconnect datagram is sent, and later ticks are
        // inert.
        let datagrams = drain_outgoing(&mut proto);
        assert!(datagrams.iter().all(|data| data[0] != id::DISCONNECT), "{datagrams:?}");
        proto.tick(t0 + Duration::from_millis(20000));
        assert!(drain_outgoing(&mut proto).is_empty());
        assert!(proto.poll_event().is_none());

    }

    #[test]
    fn server_disconnect() {

        let (mut proto, t0, _init) = connected();
        drain_outgoing(&mut proto);

        proto.handle_datagram(&[id::DISCONNECT], t0 + Duration::from_millis(100));
        assert_eq!(proto.phase(), ConnectionPhase::Closing);
        assert!(matches!(proto.poll_event(), Some(Event::Connected)));
        let Some(Event::Disconnect(event)) = proto.poll_event() else {
            panic!("expected disconnect event");
        };
        assert_eq!(event.reason, DisconnectReason::Server);

        assert!(drain_outgoing(&mut proto).iter().all(|data| data[0] != id::DISCONNECT));

    }

    #[test]
    fn local_close() {

        let (mut proto, _t0, _init) = connected();
        drain_outgoing(&mut proto);

        proto.close(true);
        assert_eq!(proto.phase(), ConnectionPhase::Closing);
        assert_eq!(drain_outgoing(&mut proto), [vec![id::DISCONNECT]]);

        // Idempotent, and closing locally is not a disconnect event.
        proto.close(true);
        assert!(drain_outgoing(&mut proto).is_empty());
        assert!(matches!(proto.poll_event(), Some(Event::Connected)));
        assert!(proto.poll_event().is_none());

        proto.finalize();
        assert_eq!(proto.phase(), ConnectionPhase::Closed);
        proto.finalize();
        assert_eq!(proto.phase(), ConnectionPhase::Closed);

    }

    #[test]
    fn close_without_notify() {
        let (mut proto, _t0, _init) = connected();
        drain_outgoing(&mut proto);
        proto.close(false);
        assert!(drain_outgoing(&mut proto).is_empty());
    }

    #[test]
    fn sequenced_emission() {

        let (mut proto, t0, init) = connected();
        drain_outgoing(&mut proto);

        proto.queue_outgoing(ChannelId::Lossy, 7, &[0xAA, 0xBB, 0xCC]).unwrap();
        proto.tick(t0 + Duration::from_millis(20));

        let datagrams = drain_outgoing(&mut proto);
        let start = init.initial_seqs[ChannelId::Lossy.index()];
        assert_eq!(datagrams, [packet::write_channel_packet(
            ChannelId::Lossy, start, &[0x07, 0x03, 0xAA, 0xBB, 0xCC])]);

    }

    #[test]
    fn inbound_message_and_confirmation() {

        let (mut proto, t0, _init) = connected();
        drain_outgoing(&mut proto);

        // One complete message on the slow channel, starting at its origin.
        let data = packet::write_channel_packet(ChannelId::Slow, Seq::new(3000), &[0x09, 0x02, 0x12, 0x34]);
        proto.handle_datagram(&data, t0 + Duration::from_millis(10));

        assert!(matches!(proto.poll_event(), Some(Event::Connected)));
        let Some(Event::Protocol(event)) = proto.poll_event() else {
            panic!("expected protocol event");
        };
        assert_eq!(event.channel, ChannelId::Slow);
        assert_eq!(event.protocol_id, 0x09);
        assert_eq!(event.data, [0x12, 0x34]);

        // The next tick flushes the confirmation of the observed start, with
        // the half-RTT delay echo.
        proto.tick(t0 + Duration::from_millis(20));
        let datagrams = drain_outgoing(&mut proto);
        assert_eq!(datagrams.len(), 1);
        assert_eq!(datagrams[0][0], id::CONFIRMATION);
        let entries = packet::parse_confirmation_entries(&datagrams[0][1..]).unwrap();
        assert_eq!(entries, [ConfirmationEntry {
            channel: ChannelId::Slow,
            delay: 5,
            start: Seq::new(3000),
        }]);

    }

    #[test]
    fn confirmation_batching() {

        let (mut proto, t0, _init) = connected();
        drain_outgoing(&mut proto);

        // Twenty one-frame packets received before the next tick.
        let mut start = Seq::new(1000);
        for _ in 0..20 {
            let data = packet::write_channel_packet(ChannelId::Lossy, start, &[0x01, 0x01, 0xAB]);
            proto.handle_datagram(&data, t0 + Duration::from_millis(1));
            start += 3;
        }

        // First flush carries a full batch, 113 bytes, the next one carries
        // the remaining four entries.
        proto.tick(t0 + Duration::from_millis(20));
        let datagrams = drain_outgoing(&mut proto);
        assert_eq!(datagrams[0].len(), 1 + 16 * packet::CONFIRMATION_ENTRY_LEN);
        assert_eq!(datagrams[0][0], id::CONFIRMATION);
        assert_eq!(packet::parse_confirmation_entries(&datagrams[0][1..]).unwrap().len(), 16);

        proto.tick(t0 + Duration::from_millis(40));
        let datagrams = drain_outgoing(&mut proto);
        assert_eq!(datagrams[0].len(), 1 + 4 * packet::CONFIRMATION_ENTRY_LEN);

    }

    #[test]
    fn inbound_acks_route_to_channels() {

        let (mut proto, t0, init) = connected();
        drain_outgoing(&mut proto);

        proto.queue_outgoing(ChannelId::Slow, 2, &[0; 10]).unwrap();
        proto.tick(t0 + Duration::from_millis(20));
        drain_outgoing(&mut proto);

        let start = init.initial_seqs[ChannelId::Slow.index()];
        assert_eq!(proto.send_channel(ChannelId::Slow).in_flight_len(), 1);

        let confirmation = packet::write_confirmation(&[ConfirmationEntry {
            channel: ChannelId::Slow,
            delay: 3,
            start,
        }]);
        proto.handle_datagram(&confirmation, t0 + Duration::from_millis(30));

        assert_eq!(proto.send_channel(ChannelId::Slow).in_flight_len(), 0);
        assert_eq!(proto.send_channel(ChannelId::Slow).fully_confirmed(), start + 12);

    }

    #[test]
    fn early_sequenced_datagram_dropped() {

        let t0 = Instant::now();
        let mut proto = Protocol::new(t0, 0, Vec::new());
        proto.tick(t0);
        drain_outgoing(&mut proto);

        // Sequenced data before the server's init is silently dropped, and
        // in particular produces no confirmation.
        let data = packet::write_channel_packet(ChannelId::Lossy, Seq::ZERO, &[0x01, 0x01, 0xAB]);
        proto.handle_datagram(&data, t0 + Duration::from_millis(5));
        assert!(proto.poll_event().is_none());
        proto.tick(t0 + Duration::from_millis(100));
        assert!(drain_outgoing(&mut proto).iter().all(|data| data[0] == id::INIT));

    }

    #[test]
    fn malformed_datagrams_are_dropped() {

        let (mut proto, t0, _init) = connected();
        drain_outgoing(&mut proto);

        // Unknown leading byte, truncated sequenced datagram, truncated
        // confirmation: all logged and dropped without closing.
        proto.handle_datagram(&[0xFF, 0x00], t0);
        proto.handle_datagram(&[ChannelId::Lossy.raw(), 0x00], t0);
        proto.handle_datagram(&[id::CONFIRMATION, 0x00, 0x00], t0);
        proto.handle_datagram(&[], t0);

        assert_eq!(proto.phase(), ConnectionPhase::Connected);
        assert!(matches!(proto.poll_event(), Some(Event::Connected)));
        assert!(proto.poll_event().is_none());

    }

}
