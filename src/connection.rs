use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::{anyhow, bail};
use bytes::Buf;
use rand::Rng;
use tracing::{debug, error, trace, warn};
use crate::ack_window::{acknowledged_sequences, AckWindow};
use crate::buffers::buffer_pool::PacketPool;
use crate::buffers::packet_view::PacketView;
use crate::channel::{ChannelIn, ChannelMode, ChannelOut};
use crate::config::TransportConfig;
use crate::message_header::MessageHeader;
use crate::packet_header::PacketHeader;
use crate::packet_socket::PacketSocket;
use crate::packing::{MessagePart, PacketPlan, PackingScheduler, ReliableItem};
use crate::protocol::{AckBits, ChannelId, Magic, Seq, CONTROL_CHANNEL, HEADER_SIZE};
use crate::safe_converter::SafeCast;

/// A packet that was sent and not acknowledged yet
pub struct SentRecord {
    pub buffer: PacketView,
    /// sent again if the packet is not acknowledged in time
    pub reliable_parts: Vec<MessagePart>,
}

/// A message record parsed from a received packet. The payload is a view into the packet.
struct ReceivedRecord {
    header: MessageHeader,
    payload: PacketView,
}

/// All protocol state for one peer: its channels, packet sequence numbers and acknowledgements,
///  the packets awaiting acknowledgement, and the packet pool that all of the connection's
///  buffers live in.
///
/// A connection does no I/O on its own. It is driven from the outside by feeding it received
///  datagrams ([Connection::process_packet]) and by periodically letting it send whatever is
///  pending ([Connection::send_outgoing]).
pub struct Connection {
    magic: Magic,
    peer_addr: SocketAddr,
    config: Arc<TransportConfig>,
    channels_in: BTreeMap<ChannelId, ChannelIn>,
    channels_out: BTreeMap<ChannelId, ChannelOut>,
    local_sequence: Seq,
    remote_acks: AckWindow,
    sent: BTreeMap<Seq, SentRecord>,
    resend_queue: Vec<MessagePart>,
    pool: PacketPool,
    scheduler: PackingScheduler,
}

impl Connection {
    pub fn new(peer_addr: SocketAddr, magic: Magic, config: Arc<TransportConfig>) -> Connection {
        let mut result = Connection {
            magic,
            peer_addr,
            channels_in: BTreeMap::new(),
            channels_out: BTreeMap::new(),
            local_sequence: 0,
            remote_acks: AckWindow::new(),
            sent: BTreeMap::new(),
            resend_queue: Vec::new(),
            pool: PacketPool::new(config.max_packet_size, config.max_pool_pages),
            scheduler: PackingScheduler::new(&config),
            config,
        };

        result.insert_channel(CONTROL_CHANNEL, ChannelMode::Sequential);
        let configured = result.config.channel_modes.iter()
            .map(|(&id, &mode)| (id, mode))
            .collect::<Vec<_>>();
        for (channel_id, mode) in configured {
            result.insert_channel(channel_id, mode);
        }
        result
    }

    pub fn magic(&self) -> Magic {
        self.magic
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_sequence(&self) -> Seq {
        self.local_sequence
    }

    pub fn remote_acks(&self) -> &AckWindow {
        &self.remote_acks
    }

    pub fn pool(&self) -> &PacketPool {
        &self.pool
    }

    /// sequence numbers of sent packets that are not acknowledged yet
    pub fn unacknowledged(&self) -> impl Iterator<Item = Seq> + '_ {
        self.sent.keys().copied()
    }

    /// Opens a channel in both directions. The peer must open it with the same mode.
    pub fn open_channel(&mut self, channel_id: ChannelId, mode: ChannelMode) -> anyhow::Result<()> {
        if let Some(existing) = self.channels_out.get(&channel_id) {
            bail!("channel {} is already open with mode {:?}", channel_id, existing.mode());
        }
        self.insert_channel(channel_id, mode);
        Ok(())
    }

    fn insert_channel(&mut self, channel_id: ChannelId, mode: ChannelMode) {
        debug!("{:?}: opening channel {} as {:?}", self.peer_addr, channel_id, mode);
        self.channels_in.insert(channel_id, ChannelIn::new(mode, self.config.raw_channel_capacity));
        self.channels_out.insert(channel_id, ChannelOut::new(channel_id, mode));
    }

    /// Queues a message for sending with the next call to [Connection::send_outgoing], returning
    ///  its sequence number in the channel. The message is copied.
    pub fn send(&mut self, channel_id: ChannelId, message: &[u8]) -> anyhow::Result<Seq> {
        if message.is_empty() {
            bail!("empty messages can not be sent");
        }
        if message.len() > self.config.max_message_size() {
            bail!("message has {} bytes, the maximum is {}", message.len(), self.config.max_message_size());
        }
        if !self.channels_out.contains_key(&channel_id) {
            bail!("channel {} is not open", channel_id);
        }

        let payload = self.pool.allocate_from(message)?;
        let channel = self.channels_out.get_mut(&channel_id)
            .ok_or_else(|| anyhow!("channel {} is not open", channel_id))?;
        Ok(channel.send(payload))
    }

    /// The next message the channel's mode allows to hand out, if any
    pub fn receive(&mut self, channel_id: ChannelId) -> Option<PacketView> {
        self.channels_in.get_mut(&channel_id)?
            .take_next()
    }

    fn simulate_loss(&self) -> bool {
        self.config.simulated_packet_loss > 0.0
            && rand::thread_rng().gen_bool(self.config.simulated_packet_loss)
    }

    /// Handles a datagram received from the peer. A packet that can not be parsed, or that has
    ///  the wrong magic number, is rejected as a whole without changing any state.
    ///
    /// Once a packet is parsed, its records are handed to their channels one by one. A record
    ///  that the channel does not accept (e.g. a fragment that does not fit its message) is
    ///  skipped without affecting the others.
    pub fn process_packet(&mut self, raw: &[u8]) -> anyhow::Result<()> {
        if self.simulate_loss() {
            debug!("simulated packet loss - dropping received packet");
            return Ok(());
        }

        let header = PacketHeader::deser(&mut &raw[..])?;
        trace!("received {:?}", header);
        if header.magic != self.magic {
            bail!("packet has magic {:08x}, expected {:08x}", header.magic, self.magic);
        }

        for record in self.parse_records(raw)? {
            self.dispatch(record);
        }

        self.retire_acknowledged(header.ack, header.ack_bits);
        self.remote_acks.observe(header.sequence);
        Ok(())
    }

    /// Copies the packet into the pool and slices its message records out of the copy
    fn parse_records(&mut self, raw: &[u8]) -> anyhow::Result<Vec<ReceivedRecord>> {
        if raw.len() == HEADER_SIZE {
            return Ok(Vec::new());
        }

        let packet = self.pool.allocate_from(raw)?;
        let mut headers = Vec::new();
        {
            let bytes = packet.bytes();
            let mut buf: &[u8] = &bytes[HEADER_SIZE..];
            while buf.has_remaining() {
                let header = MessageHeader::deser(&mut buf)?;
                let offset = bytes.len() - buf.len();
                buf.advance(header.message_size.safe_cast());
                headers.push((header, offset));
            }
        }

        headers.into_iter()
            .map(|(header, offset)| Ok(ReceivedRecord {
                payload: packet.subpacket(offset, header.message_size.safe_cast())?,
                header,
            }))
            .collect()
    }

    fn dispatch(&mut self, record: ReceivedRecord) {
        let header = record.header;
        let Some(channel) = self.channels_in.get_mut(&header.channel_id) else {
            debug!("{:?} for channel that is not open - skipping", header);
            return;
        };
        if header.message_size == 0 {
            debug!("{:?} without payload - skipping", header);
            return;
        }

        let Some(fragment) = header.fragment else {
            channel.admit(header.sequence, record.payload, 0);
            return;
        };

        // NB: all fragments but the last have the same length, so the offset follows from it
        let id: usize = fragment.id.safe_cast();
        let count: usize = fragment.count.safe_cast();
        let total_size: usize = fragment.total_size.safe_cast();
        let len = record.payload.len();
        let offset = if id + 1 == count {
            total_size.saturating_sub(len)
        }
        else {
            id * len
        };

        if let Err(e) = channel.admit_fragment(header.sequence, &record.payload, fragment.id, fragment.count, offset, total_size, &self.pool) {
            warn!("{:?}: {} - skipping", header, e);
        }
    }

    fn retire_acknowledged(&mut self, ack: Seq, ack_bits: AckBits) {
        for sequence in acknowledged_sequences(ack, ack_bits) {
            if self.sent.remove(&sequence).is_some() {
                trace!("packet #{} was acknowledged", sequence);
            }
        }
    }

    /// Drops sent packets that fell out of the acknowledgement window, queueing their reliable
    ///  messages for sending again
    fn prune_sent(&mut self) {
        let local_sequence = self.local_sequence;
        let window = self.config.sent_window;
        let expired = self.sent.keys()
            .copied()
            .filter(|&sequence| local_sequence.wrapping_sub(sequence) >= window)
            .collect::<Vec<_>>();

        for sequence in expired {
            if let Some(record) = self.sent.remove(&sequence) {
                if !record.reliable_parts.is_empty() {
                    debug!("packet #{} was not acknowledged - resending {} reliable messages", sequence, record.reliable_parts.len());
                }
                self.resend_queue.extend(record.reliable_parts);
            }
        }
    }

    fn is_reliable_channel(&self, channel_id: ChannelId) -> bool {
        self.channels_out.get(&channel_id)
            .map(|c| c.is_reliable())
            .unwrap_or(false)
    }

    /// Packs everything that is pending into packets and sends them to the peer. At least one
    ///  packet is sent per call to carry acknowledgements.
    ///
    /// Socket errors are logged but not returned: the packet counts as sent and lost. If the
    ///  pool has no room for a packet, its reliable messages (and those of all following packets)
    ///  are kept for the next call, and the error is returned.
    ///
    /// Afterwards, only the newest `sent_window` packets are kept for acknowledgement.
    pub fn send_outgoing(&mut self, socket: &impl PacketSocket) -> anyhow::Result<()> {
        let mut reliable = self.resend_queue.drain(..)
            .map(ReliableItem::Resend)
            .collect::<Vec<_>>();
        let mut unreliable = Vec::new();
        for channel in self.channels_out.values_mut() {
            if channel.is_reliable() {
                reliable.extend(channel.take_outgoing().map(ReliableItem::Message));
            }
            else {
                unreliable.extend(channel.take_outgoing());
            }
        }

        let mut plans = self.scheduler.pack(reliable, unreliable)?.into_iter();
        while let Some(plan) = plans.next() {
            if let Err(e) = self.send_packet(socket, &plan) {
                for plan in std::iter::once(plan).chain(plans) {
                    let reliable_parts = plan.parts.into_iter()
                        .filter(|p| self.is_reliable_channel(p.channel_id))
                        .collect::<Vec<_>>();
                    self.resend_queue.extend(reliable_parts);
                }
                return Err(e);
            }
        }

        self.prune_sent();
        Ok(())
    }

    fn send_packet(&mut self, socket: &impl PacketSocket, plan: &PacketPlan) -> anyhow::Result<()> {
        let sequence = self.local_sequence.wrapping_add(1);
        let (ack, ack_bits) = self.remote_acks.header_values();
        let header = PacketHeader {
            magic: self.magic,
            sequence,
            ack,
            ack_bits,
        };

        let buffer = self.pool.allocate_with(|buf| {
            header.ser(buf)?;
            for part in &plan.parts {
                part.header().ser(buf)?;
                buf.try_put_view(&part.payload)?;
            }
            Ok(())
        })?;
        self.local_sequence = sequence;

        if self.simulate_loss() {
            debug!("simulated packet loss - not sending {:?}", header);
        }
        else {
            trace!("sending {:?} with {} messages to {:?}", header, plan.parts.len(), self.peer_addr);
            let bytes = buffer.bytes();
            if let Err(e) = socket.send_to(self.peer_addr, &bytes) {
                error!("error sending packet to {:?}: {}", self.peer_addr, e);
            }
        }

        let reliable_parts = plan.parts.iter()
            .filter(|p| self.is_reliable_channel(p.channel_id))
            .cloned()
            .collect();
        self.sent.insert(sequence, SentRecord {
            buffer,
            reliable_parts,
        });
        Ok(())
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            peer_addr: self.peer_addr,
            pool_pages: self.pool.num_pages(),
            unacknowledged: self.sent.len(),
            local_sequence: self.local_sequence,
            remote_ack: self.remote_acks.latest(),
            remote_ack_bits: self.remote_acks.bits(),
        }
    }
}

/// A snapshot of a connection's state for diagnostics
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionStatus {
    pub peer_addr: SocketAddr,
    pub pool_pages: usize,
    pub unacknowledged: usize,
    pub local_sequence: Seq,
    pub remote_ack: Option<Seq>,
    pub remote_ack_bits: AckBits,
}

impl Display for ConnectionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let remote_ack = self.remote_ack
            .map(|a| a.to_string())
            .unwrap_or("-".to_string());
        let bitmap = (0..AckBits::BITS)
            .map(|j| if self.remote_ack_bits & (1 << j) != 0 { '#' } else { ' ' })
            .collect::<String>();

        write!(f, "{}: pages={} unacked={} seq={} ack={} [{}]", self.peer_addr, self.pool_pages, self.unacknowledged, self.local_sequence, remote_ack, bitmap)
    }
}
