use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::rc::Rc;
use rustc_hash::FxHashMap;
use crate::packet_socket::PacketSocket;

/// convenience method for unit test code: create a [SocketAddr] based on a number, the same
///  number generating the same address and different numbers different addresses
pub fn test_addr(number: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, number))
}

type Datagrams = VecDeque<(SocketAddr, Vec<u8>)>;

/// An in-process 'network' delivering datagrams between [MemorySocket]s in send order. Datagrams
///  to addresses without a socket are lost, like they would be with UDP.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    queues: Rc<RefCell<FxHashMap<SocketAddr, Datagrams>>>,
}

impl MemoryNetwork {
    pub fn new() -> MemoryNetwork {
        MemoryNetwork::default()
    }

    pub fn socket(&self, addr: SocketAddr) -> MemorySocket {
        self.queues.borrow_mut().entry(addr).or_default();
        MemorySocket {
            addr,
            network: self.clone(),
        }
    }

    /// number of datagrams waiting to be received at `addr`
    pub fn in_flight(&self, addr: SocketAddr) -> usize {
        self.queues.borrow()
            .get(&addr)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// loses all datagrams waiting to be received at `addr`
    pub fn drop_in_flight(&self, addr: SocketAddr) {
        if let Some(q) = self.queues.borrow_mut().get_mut(&addr) {
            q.clear();
        }
    }

    /// Injects a datagram, bypassing all sockets
    pub fn inject(&self, from: SocketAddr, to: SocketAddr, datagram: &[u8]) {
        if let Some(q) = self.queues.borrow_mut().get_mut(&to) {
            q.push_back((from, datagram.to_vec()));
        }
    }
}

pub struct MemorySocket {
    addr: SocketAddr,
    network: MemoryNetwork,
}

impl PacketSocket for MemorySocket {
    fn send_to(&self, to: SocketAddr, packet_buf: &[u8]) -> io::Result<usize> {
        self.network.inject(self.addr, to, packet_buf);
        Ok(packet_buf.len())
    }

    fn receive_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let next = self.network.queues.borrow_mut()
            .get_mut(&self.addr)
            .and_then(|q| q.pop_front());

        Ok(next.map(|(from, datagram)| {
            // NB: like UDP, the datagram is truncated if the buffer is too small
            let len = datagram.len().min(buf.len());
            buf[..len].copy_from_slice(&datagram[..len]);
            (len, from)
        }))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}
