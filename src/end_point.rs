use std::future::Future;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, span, trace, warn, Level};
use crate::config::TransportConfig;
use crate::connection::{Connection, ConnectionStatus};
use crate::packet_socket::PacketSocket;
use crate::protocol::{Magic, CONNECT_REQUEST, HEADER_SIZE};

enum Role {
    /// accepts connections from any peer that asks
    Server,
    /// talks to a single server, from which it receives the connection's magic number
    Client { server_addr: SocketAddr },
}

struct Peer {
    connection: Connection,
    last_heard: Instant,
}

/// EndPoint is the place where the other parts come together: It owns a socket and the
///  connections to all peers, and drives them in ticks. Each tick drains all datagrams that
///  are available on the socket, handing them to their peer's connection, and then lets every
///  connection send what is pending.
///
/// A server creates a connection for every new peer address it receives a datagram from, and
///  replies with the connection's magic number. A client asks for a connection by sending
///  [CONNECT_REQUEST] until it receives the magic number from its server.
pub struct EndPoint<S: PacketSocket> {
    socket: S,
    config: Arc<TransportConfig>,
    role: Role,
    peers: FxHashMap<SocketAddr, Peer>,
    receive_buf: Vec<u8>,
}

impl EndPoint<UdpSocket> {
    pub async fn bind_server(addr: SocketAddr, config: Arc<TransportConfig>) -> anyhow::Result<EndPoint<UdpSocket>> {
        let socket = UdpSocket::bind(addr).await?;
        info!("bound server socket to {:?}", socket.local_addr()?);
        EndPoint::server(socket, config)
    }

    pub async fn bind_client(server_addr: SocketAddr, config: Arc<TransportConfig>) -> anyhow::Result<EndPoint<UdpSocket>> {
        let local_addr: SocketAddr = if server_addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        }
        else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local_addr).await?;
        info!("bound client socket to {:?}", socket.local_addr()?);
        EndPoint::client(socket, server_addr, config)
    }
}

impl<S: PacketSocket> EndPoint<S> {
    pub fn server(socket: S, config: Arc<TransportConfig>) -> anyhow::Result<EndPoint<S>> {
        Self::new(socket, config, Role::Server)
    }

    pub fn client(socket: S, server_addr: SocketAddr, config: Arc<TransportConfig>) -> anyhow::Result<EndPoint<S>> {
        let result = Self::new(socket, config, Role::Client { server_addr })?;
        result.send_connect_request(server_addr);
        Ok(result)
    }

    fn new(socket: S, config: Arc<TransportConfig>, role: Role) -> anyhow::Result<EndPoint<S>> {
        config.validate()?;
        Ok(EndPoint {
            socket,
            role,
            peers: FxHashMap::default(),
            // NB: one extra byte to detect oversized datagrams
            receive_buf: vec![0; config.max_packet_size + 1],
            config,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// A client is connected once it received the magic number from its server. A server is
    ///  always connected.
    pub fn is_connected(&self) -> bool {
        match self.role {
            Role::Server => true,
            Role::Client { server_addr } => self.peers.contains_key(&server_addr),
        }
    }

    pub fn connection(&self, peer_addr: &SocketAddr) -> Option<&Connection> {
        self.peers.get(peer_addr)
            .map(|p| &p.connection)
    }

    pub fn connection_mut(&mut self, peer_addr: &SocketAddr) -> Option<&mut Connection> {
        self.peers.get_mut(peer_addr)
            .map(|p| &mut p.connection)
    }

    /// For a client, this is the connection to the server
    pub fn connections_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.peers.values_mut()
            .map(|p| &mut p.connection)
    }

    pub fn status(&self) -> Vec<ConnectionStatus> {
        self.peers.values()
            .map(|p| p.connection.status())
            .collect()
    }

    fn send_connect_request(&self, server_addr: SocketAddr) {
        debug!("requesting connection from {:?}", server_addr);
        if let Err(e) = self.socket.send_to(server_addr, &CONNECT_REQUEST) {
            error!("error sending connect request to {:?}: {}", server_addr, e);
        }
    }

    fn send_magic(&self, peer_addr: SocketAddr, magic: Magic) {
        if let Err(e) = self.socket.send_to(peer_addr, &magic.to_le_bytes()) {
            error!("error sending magic number to {:?}: {}", peer_addr, e);
        }
    }

    /// One round of receiving and sending, see [EndPoint]
    pub fn tick(&mut self) {
        self.drain_socket();

        if let Role::Client { server_addr } = self.role {
            if !self.is_connected() {
                self.send_connect_request(server_addr);
            }
        }

        for peer in self.peers.values_mut() {
            if let Err(e) = peer.connection.send_outgoing(&self.socket) {
                warn!("error sending to {:?}: {}", peer.connection.peer_addr(), e);
            }
        }

        self.expire_idle(Instant::now());
    }

    fn drain_socket(&mut self) {
        let mut buf = mem::take(&mut self.receive_buf);
        loop {
            let (len, from) = match self.socket.receive_from(&mut buf) {
                Ok(Some(x)) => x,
                Ok(None) => break,
                Err(e) => {
                    error!("socket error: {}", e);
                    break;
                }
            };

            let span = span!(Level::TRACE, "packet_received", ?from);
            let _entered = span.enter();

            if len > self.config.max_packet_size {
                debug!("datagram exceeds the maximum packet size - dropping");
                continue;
            }
            trace!("received datagram of {} bytes", len);

            match self.role {
                Role::Server => self.on_server_datagram(from, &buf[..len]),
                Role::Client { server_addr } => self.on_client_datagram(server_addr, from, &buf[..len]),
            }
        }
        self.receive_buf = buf;
    }

    fn on_server_datagram(&mut self, from: SocketAddr, datagram: &[u8]) {
        let Some(peer) = self.peers.get_mut(&from) else {
            info!("new connection from {:?}", from);
            let connection = Connection::new(from, self.config.magic, self.config.clone());
            self.peers.insert(from, Peer {
                connection,
                last_heard: Instant::now(),
            });
            self.send_magic(from, self.config.magic);

            if datagram != CONNECT_REQUEST {
                self.process(from, datagram);
            }
            return;
        };

        if datagram == CONNECT_REQUEST {
            // the client did not receive the magic number
            peer.last_heard = Instant::now();
            let magic = peer.connection.magic();
            self.send_magic(from, magic);
            return;
        }
        self.process(from, datagram);
    }

    fn on_client_datagram(&mut self, server_addr: SocketAddr, from: SocketAddr, datagram: &[u8]) {
        if from != server_addr {
            debug!("datagram not from the server - dropping");
            return;
        }

        if !self.peers.contains_key(&server_addr) {
            let Some(magic_bytes) = datagram.first_chunk::<4>() else {
                debug!("datagram too short for a magic number - dropping");
                return;
            };
            let magic = Magic::from_le_bytes(*magic_bytes);
            info!("connected to {:?} with magic {:08x}", server_addr, magic);
            self.peers.insert(server_addr, Peer {
                connection: Connection::new(server_addr, magic, self.config.clone()),
                last_heard: Instant::now(),
            });

            if datagram.len() < HEADER_SIZE {
                return;
            }
        }
        self.process(from, datagram);
    }

    fn process(&mut self, from: SocketAddr, datagram: &[u8]) {
        let Some(peer) = self.peers.get_mut(&from) else {
            return;
        };

        match peer.connection.process_packet(datagram) {
            Ok(()) => peer.last_heard = Instant::now(),
            Err(e) => debug!("dropping packet: {}", e),
        }
    }

    fn expire_idle(&mut self, now: Instant) {
        let Some(timeout) = self.config.connection_timeout else {
            return;
        };

        self.peers.retain(|addr, peer| {
            let keep = now.duration_since(peer.last_heard) <= timeout;
            if !keep {
                info!("connection to {:?} was idle for more than {:?} - dropping", addr, timeout);
            }
            keep
        });
    }

    /// Calls [EndPoint::tick] in the configured interval until `shutdown` completes
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) {
        info!("starting tick loop");

        let mut ticks = time::interval(self.config.tick_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("shutting down tick loop");
                    return;
                }
                _ = ticks.tick() => self.tick(),
            }
        }
    }
}
