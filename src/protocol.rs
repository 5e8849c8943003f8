//! Wire-level constants and the integer types of the individual header fields.

/// Magic number at the start of every packet header, assigned by the server per connection
pub type Magic = u32;

/// Packet sequence numbers as well as per-channel message sequence numbers
pub type Seq = u32;

/// One ack per bit, relative to the ack sequence number in the same header
pub type AckBits = u32;

pub type ChannelId = u16;

pub type FragmentId = u8;

/// bit *i* set <=> fragment *i* is still missing
pub type FragmentMask = u32;

/// Size of a single message record's payload or of a whole (reassembled) message
pub type MessageSize = u16;

/// Channel 0 exists on every connection and is reserved for protocol-internal messages
pub const CONTROL_CHANNEL: ChannelId = 0;

/// `magic`, `sequence`, `ack`, `ack_bits`
pub const HEADER_SIZE: usize = size_of::<Magic>() + 2 * size_of::<Seq>() + size_of::<AckBits>();

/// `channel_id`, `sequence`, `message_size`, `fragment_id`
pub const MSG_HEADER_SIZE: usize = size_of::<ChannelId>() + size_of::<Seq>() + size_of::<MessageSize>() + size_of::<FragmentId>();

/// the message header, extended by `fragment_count` and `total_size`
pub const FRAG_MSG_HEADER_SIZE: usize = MSG_HEADER_SIZE + size_of::<FragmentId>() + size_of::<MessageSize>();

pub const ACKS_PER_BITFIELD: u32 = AckBits::BITS;

pub const FRAGMENTS_PER_BITFIELD: usize = FragmentMask::BITS as usize;

/// `fragment_id` value of a message record that carries a complete message
pub const NOT_FRAGMENTED: FragmentId = 0xff;

/// Payload of the datagram a client sends to ask a server for a connection
pub const CONNECT_REQUEST: [u8; 4] = *b"CONN";

/// Sequence number comparison that survives wrap-around: `a` is newer than `b` if it is
///  less than half the number space ahead of it
pub fn is_newer(a: Seq, b: Seq) -> bool {
    a != b && a.wrapping_sub(b) < (1 << 31)
}
