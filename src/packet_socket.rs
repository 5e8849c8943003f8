#[cfg(test)] use mockall::automock;
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::trace;

/// This is an abstraction for sending and receiving datagrams without blocking, introduced to
///  facilitate mocking the I/O part away for testing
#[cfg_attr(test, automock)]
pub trait PacketSocket {
    fn send_to(&self, to: SocketAddr, packet_buf: &[u8]) -> io::Result<usize>;

    /// Returns `None` if no datagram is available right now
    fn receive_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl PacketSocket for UdpSocket {
    fn send_to(&self, to: SocketAddr, packet_buf: &[u8]) -> io::Result<usize> {
        trace!("UDP socket: sending packet of {} bytes to {:?}", packet_buf.len(), to);
        self.try_send_to(packet_buf, to)
    }

    fn receive_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.try_recv_from(buf) {
            Ok(x) => Ok(Some(x)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_socket() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_addr = PacketSocket::local_addr(&b).unwrap();

        let mut buf = [0u8; 16];
        assert!(b.receive_from(&mut buf).unwrap().is_none());

        a.writable().await.unwrap();
        assert_eq!(PacketSocket::send_to(&a, b_addr, b"hello").unwrap(), 5);

        b.readable().await.unwrap();
        let (len, from) = b.receive_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, PacketSocket::local_addr(&a).unwrap());
    }
}
