//! Packing decides which message records go into which outgoing packet.
//!
//! Reliable messages are placed first, largest first. A message that does not fit a single
//!  record is split into fragments of exactly [TransportConfig::max_unfragmented_message_size]
//!  bytes plus a shorter final fragment. Every fragment but the last fills a packet on its own,
//!  so only the final fragment competes for space with other messages.
//!
//! After a message is placed, the rest of the packet is filled greedily with the largest
//!  remaining messages that fit whole. If none fits, but the final fragment of some other
//!  message that needs fragmenting does, that message is started in this packet's trailing
//!  space instead of in a packet of its own.
//!
//! Unreliable messages are never fragmented: they go into the trailing space of the current
//!  packet, or into a new one, and are dropped if they can not fit into a packet at all.

use std::mem;
use tracing::{debug, trace, warn};
use crate::buffers::packet_view::PacketView;
use crate::channel::OutgoingMessage;
use crate::config::TransportConfig;
use crate::message_header::{FragmentInfo, MessageHeader};
use crate::protocol::{ChannelId, Seq, FRAGMENTS_PER_BITFIELD};
use crate::safe_converter::PrecheckedCast;

/// A message, or a fragment of a message, as it is placed in a packet
#[derive(Clone, Debug)]
pub struct MessagePart {
    pub channel_id: ChannelId,
    pub sequence: Seq,
    pub payload: PacketView,
    pub fragment: Option<FragmentInfo>,
}

impl MessagePart {
    fn whole(message: OutgoingMessage) -> MessagePart {
        MessagePart {
            channel_id: message.channel_id,
            sequence: message.sequence,
            payload: message.payload,
            fragment: None,
        }
    }

    /// number of bytes this part takes in a packet, including its header
    pub fn wire_len(&self) -> usize {
        MessageHeader::serialized_len(self.fragment.is_some()) + self.payload.len()
    }

    pub fn header(&self) -> MessageHeader {
        MessageHeader {
            channel_id: self.channel_id,
            sequence: self.sequence,
            message_size: self.payload.len().prechecked_cast(),
            fragment: self.fragment,
        }
    }
}

/// A reliable item waiting to be placed: either a message that was never sent, or a part of
///  a message that is sent again. Parts are never split further.
#[derive(Debug)]
pub enum ReliableItem {
    Message(OutgoingMessage),
    Resend(MessagePart),
}

impl ReliableItem {
    fn size(&self) -> usize {
        match self {
            ReliableItem::Message(m) => m.payload.len(),
            ReliableItem::Resend(p) => p.payload.len(),
        }
    }
}

/// The records of one outgoing packet
#[derive(Debug, Default)]
pub struct PacketPlan {
    pub parts: Vec<MessagePart>,
    /// bytes after the packet header
    pub body_len: usize,
}

impl PacketPlan {
    fn single(part: MessagePart) -> PacketPlan {
        let mut result = PacketPlan::default();
        result.push(part);
        result
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    fn push(&mut self, part: MessagePart) {
        self.body_len += part.wire_len();
        self.parts.push(part);
    }
}

pub struct PackingScheduler {
    body_capacity: usize,
    fragment_size: usize,
}

impl PackingScheduler {
    pub fn new(config: &TransportConfig) -> PackingScheduler {
        PackingScheduler {
            body_capacity: config.packet_body_capacity(),
            fragment_size: config.max_unfragmented_message_size(),
        }
    }

    /// Distributes the messages over as few packets as possible. The result contains at least
    ///  one (possibly empty) packet.
    pub fn pack(&self, reliable: Vec<ReliableItem>, unreliable: Vec<OutgoingMessage>) -> anyhow::Result<Vec<PacketPlan>> {
        let mut reliable = reliable;
        // NB: stable, so messages of equal size keep their send order
        reliable.sort_by_key(|item| std::cmp::Reverse(item.size()));
        let mut remaining = reliable.into_iter()
            .map(Some)
            .collect::<Vec<_>>();

        let mut packets = Vec::new();
        let mut current = PacketPlan::default();

        while let Some(item) = remaining.iter_mut().find_map(Option::take) {
            if !current.is_empty() {
                packets.push(mem::take(&mut current));
            }
            self.place(item, &mut current, &mut packets)?;
            self.fill(&mut remaining, &mut current, &mut packets)?;
        }

        for message in unreliable {
            let part = MessagePart::whole(message);
            if part.wire_len() > self.body_capacity {
                debug!("unreliable message #{} on channel {} has {} bytes, which exceeds the packet size - dropping", part.sequence, part.channel_id, part.payload.len());
                continue;
            }
            if current.body_len + part.wire_len() > self.body_capacity {
                packets.push(mem::take(&mut current));
            }
            current.push(part);
        }

        if !current.is_empty() || packets.is_empty() {
            packets.push(current);
        }
        trace!("packed {} packets", packets.len());
        Ok(packets)
    }

    fn remaining_space(&self, packet: &PacketPlan) -> usize {
        self.body_capacity - packet.body_len
    }

    fn needs_fragmentation(&self, item: &ReliableItem) -> bool {
        match item {
            ReliableItem::Message(m) => m.payload.len() > self.fragment_size,
            ReliableItem::Resend(_) => false,
        }
    }

    /// wire length of the record that goes into a shared packet: the whole item, or the
    ///  final fragment for messages that need fragmenting
    fn shared_wire_len(&self, item: &ReliableItem) -> usize {
        match item {
            ReliableItem::Resend(p) => p.wire_len(),
            ReliableItem::Message(m) if m.payload.len() <= self.fragment_size => MessageHeader::serialized_len(false) + m.payload.len(),
            ReliableItem::Message(m) => {
                let last_len = m.payload.len() - (m.payload.len() - 1) / self.fragment_size * self.fragment_size;
                MessageHeader::serialized_len(true) + last_len
            }
        }
    }

    /// Places an item into `current`, sending leading fragments in packets of their own
    fn place(&self, item: ReliableItem, current: &mut PacketPlan, packets: &mut Vec<PacketPlan>) -> anyhow::Result<()> {
        match item {
            ReliableItem::Resend(part) => current.push(part),
            ReliableItem::Message(m) if m.payload.len() <= self.fragment_size => current.push(MessagePart::whole(m)),
            ReliableItem::Message(m) => {
                let Some(mut fragments) = self.split(m)? else {
                    return Ok(());
                };
                if let Some(last) = fragments.pop() {
                    packets.extend(fragments.into_iter().map(PacketPlan::single));
                    current.push(last);
                }
            }
        }
        Ok(())
    }

    fn fill(&self, remaining: &mut [Option<ReliableItem>], current: &mut PacketPlan, packets: &mut Vec<PacketPlan>) -> anyhow::Result<()> {
        loop {
            let space = self.remaining_space(current);

            let whole = take_first(remaining, |item| !self.needs_fragmentation(item) && self.shared_wire_len(item) <= space);
            if let Some(item) = whole {
                self.place(item, current, packets)?;
                continue;
            }

            let switch = take_first(remaining, |item| self.needs_fragmentation(item) && self.shared_wire_len(item) <= space);
            if let Some(item) = switch {
                trace!("starting fragmented message in trailing space of {} bytes", space);
                self.place(item, current, packets)?;
                continue;
            }

            return Ok(());
        }
    }

    /// Splits a message into fragments, or returns `None` if it has too many
    fn split(&self, message: OutgoingMessage) -> anyhow::Result<Option<Vec<MessagePart>>> {
        let total_size = message.payload.len();
        let count = total_size.div_ceil(self.fragment_size);
        if count > FRAGMENTS_PER_BITFIELD {
            warn!("message #{} on channel {} has {} bytes and would need {} fragments - dropping", message.sequence, message.channel_id, total_size, count);
            return Ok(None);
        }

        let mut result = Vec::with_capacity(count);
        for id in 0..count {
            let offset = id * self.fragment_size;
            let len = self.fragment_size.min(total_size - offset);
            result.push(MessagePart {
                channel_id: message.channel_id,
                sequence: message.sequence,
                payload: message.payload.subpacket(offset, len)?,
                fragment: Some(FragmentInfo {
                    id: id.prechecked_cast(),
                    count: count.prechecked_cast(),
                    total_size: total_size.prechecked_cast(),
                }),
            });
        }
        Ok(Some(result))
    }
}

/// takes the first (i.e. largest) remaining item matching `pred`
fn take_first(remaining: &mut [Option<ReliableItem>], pred: impl Fn(&ReliableItem) -> bool) -> Option<ReliableItem> {
    remaining.iter_mut()
        .find(|slot| matches!(slot, Some(item) if pred(item)))
        .and_then(Option::take)
}
