use std::time::Duration;
use anyhow::bail;
use rustc_hash::FxHashMap;
use crate::channel::ChannelMode;
use crate::protocol::{ChannelId, Magic, MessageSize, CONTROL_CHANNEL, FRAGMENTS_PER_BITFIELD, FRAG_MSG_HEADER_SIZE, HEADER_SIZE};

pub struct TransportConfig {
    /// This is the maximum size of a datagram that the transport sends, including the packet
    ///  header. Messages that do not fit into a single packet are fragmented (if they are sent
    ///  on a reliable channel) or dropped (otherwise).
    ///
    /// The transport does not attempt to discover the path MTU, so this must be chosen small
    ///  enough for all routes between peers. Since both `message_size` and `total_size` are
    ///  u16 on the wire, and a message can have at most 32 fragments, the upper limit is
    ///  2075 bytes.
    ///
    /// NB: Both peers must use the same value - fragment sizes are derived from it
    pub max_packet_size: usize,

    /// Upper bound for the number of pages in each connection's packet pool. Every page holds
    ///  room for ten maximum-size packets. Pages are recycled once all views into them are
    ///  dropped; if all pages are live and another one would be needed, allocation fails.
    pub max_pool_pages: usize,

    /// Number of recently sent packets that are kept for acknowledgement. A packet that falls
    ///  out of this window without being acknowledged is considered lost, and the reliable
    ///  messages it carried are sent again.
    ///
    /// This must not exceed the width of the ack bitfield, since older packets can never be
    ///  acknowledged.
    pub sent_window: u32,

    /// Number of pending messages a RAW channel buffers before it starts evicting the oldest
    pub raw_channel_capacity: usize,

    /// The magic number a server assigns to connections it accepts
    pub magic: Magic,

    pub tick_interval: Duration,

    /// Connections that did not receive a valid packet for this long are dropped by the
    ///  end point. `None` keeps them forever.
    pub connection_timeout: Option<Duration>,

    /// For debugging: fraction of incoming and outgoing packets to drop deliberately
    pub simulated_packet_loss: f64,

    /// Channels that are opened on every new connection, in addition to the control channel
    pub channel_modes: FxHashMap<ChannelId, ChannelMode>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            max_packet_size: 512,
            max_pool_pages: 256,
            sent_window: 30,
            raw_channel_capacity: 32,
            magic: 0xDEAD_BEEF,
            tick_interval: Duration::from_millis(33),
            connection_timeout: Some(Duration::from_secs(10)),
            simulated_packet_loss: 0.0,
            channel_modes: FxHashMap::default(),
        }
    }
}

impl TransportConfig {
    pub const MIN_PACKET_SIZE: usize = 64;

    pub fn with_channel(mut self, channel_id: ChannelId, mode: ChannelMode) -> Self {
        self.channel_modes.insert(channel_id, mode);
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_packet_size < Self::MIN_PACKET_SIZE {
            bail!("maximum packet size {} is below the minimum of {}", self.max_packet_size, Self::MIN_PACKET_SIZE);
        }
        if self.max_message_size() > MessageSize::MAX as usize {
            bail!("maximum packet size {} implies a maximum message size of {}, which does not fit the wire format", self.max_packet_size, self.max_message_size());
        }
        if self.max_pool_pages == 0 {
            bail!("the packet pool needs at least one page");
        }
        if self.sent_window == 0 || self.sent_window > crate::protocol::ACKS_PER_BITFIELD {
            bail!("sent window {} must be between 1 and {}", self.sent_window, crate::protocol::ACKS_PER_BITFIELD);
        }
        if self.raw_channel_capacity == 0 {
            bail!("RAW channels need a capacity of at least one message");
        }
        if !(0.0..=1.0).contains(&self.simulated_packet_loss) {
            bail!("simulated packet loss {} is not a fraction", self.simulated_packet_loss);
        }
        if self.channel_modes.contains_key(&CONTROL_CHANNEL) {
            bail!("channel {} is reserved for control messages", CONTROL_CHANNEL);
        }
        Ok(())
    }

    /// space for message records after the packet header
    pub fn packet_body_capacity(&self) -> usize {
        self.max_packet_size - HEADER_SIZE
    }

    /// Messages up to this size are sent in a single record. This is also the payload size of
    ///  every fragment except the last one.
    pub fn max_unfragmented_message_size(&self) -> usize {
        self.max_packet_size - HEADER_SIZE - FRAG_MSG_HEADER_SIZE
    }

    pub fn max_message_size(&self) -> usize {
        self.max_unfragmented_message_size() * FRAGMENTS_PER_BITFIELD
    }
}
