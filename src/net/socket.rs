//! Mio-backed UDP endpoint bound to an ephemeral port and connected to a
//! single server address.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};


const SOCKET_EVENT: Token = Token(0);


/// A UDP socket connected to the server, with a readiness poll used to wait
/// for inbound datagrams up to a timeout. All datagrams from other sources
/// are filtered out by the connect.
pub struct ClientSocket {
    /// The socket used for sending and receiving UDP datagrams.
    socket: UdpSocket,
    /// Socket poll.
    poll: Poll,
    /// Socket events.
    events: Events,
}

impl ClientSocket {

    /// Bind an ephemeral local port of the matching family and connect the
    /// socket to the given server address.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {

        let bind_addr = match addr {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };

        let mut socket = UdpSocket::bind(bind_addr)?;
        socket.connect(addr)?;

        let poll = Poll::new()?;
        poll.registry().register(&mut socket, SOCKET_EVENT, Interest::READABLE)?;

        Ok(Self {
            socket,
            poll,
            events: Events::with_capacity(128),
        })

    }

    /// Local address the socket is bound to.
    #[inline]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send a single datagram to the connected server.
    #[inline]
    pub fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.socket.send(data)
    }

    /// Wait for the socket to become readable, up to the given timeout.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.poll.poll(&mut self.events, timeout)
    }

    /// Receive a single datagram from the server, returning none when the
    /// socket has nothing more to yield for now.
    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.socket.recv(buf) {
            Ok(len) => Ok(Some(len)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

}
