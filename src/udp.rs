//! UDP side channel, an extension point only.
//!
//! The socket is bound and registered so inbound datagrams can be matched to
//! the TCP connection that registered their source address. No datagram
//! framing is defined, so matched or not, every datagram is dropped after
//! being attributed.

use std::{io, net::SocketAddr};

use mio::{net::UdpSocket, Interest, Registry};

use crate::poll::UDP_TOKEN;

#[derive(Debug)]
pub struct UdpChannel {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpChannel {
    pub fn bind(registry: &Registry, addr: SocketAddr) -> io::Result<Self> {
        let mut socket = UdpSocket::bind(addr)?;
        registry.register(&mut socket, UDP_TOKEN, Interest::READABLE)?;
        let local_addr = socket.local_addr()?;
        Ok(Self { socket, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receives one datagram into `scratch`, returning its source and length,
    /// or `None` when nothing is waiting.
    pub fn read_from_address(&self, scratch: &mut [u8]) -> io::Result<Option<(SocketAddr, usize)>> {
        loop {
            match self.socket.recv_from(scratch) {
                Ok((len, from)) => return Ok(Some((from, len))),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    pub fn close(mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.socket)
    }
}
