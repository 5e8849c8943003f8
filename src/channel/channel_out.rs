use std::collections::VecDeque;
use tracing::trace;
use crate::buffers::packet_view::PacketView;
use crate::channel::{Channel, ChannelMode};
use crate::protocol::{ChannelId, Seq};

/// A message that was handed to a channel for sending, numbered but not necessarily sent yet
#[derive(Clone, Debug)]
pub struct OutgoingMessage {
    pub channel_id: ChannelId,
    pub sequence: Seq,
    pub payload: PacketView,
}

/// The sending half of a channel: it numbers messages and keeps them until the connection
///  collects them for the next round of packets.
pub struct ChannelOut {
    channel: Channel,
    channel_id: ChannelId,
    next_sequence: Seq,
    queue: VecDeque<OutgoingMessage>,
}

impl ChannelOut {
    pub fn new(channel_id: ChannelId, mode: ChannelMode) -> ChannelOut {
        ChannelOut {
            channel: Channel::new(mode),
            channel_id,
            // NB: the receiver starts with last_read == 0, so 0 is never a valid message number
            next_sequence: 1,
            queue: VecDeque::new(),
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn mode(&self) -> ChannelMode {
        self.channel.mode()
    }

    pub fn is_reliable(&self) -> bool {
        self.channel.is_reliable()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Queues a message, returning the sequence number assigned to it
    pub fn send(&mut self, payload: PacketView) -> Seq {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        trace!("channel {}: queueing message #{} ({} bytes)", self.channel_id, sequence, payload.len());
        self.queue.push_back(OutgoingMessage {
            channel_id: self.channel_id,
            sequence,
            payload,
        });
        sequence
    }

    /// Removes all queued messages, oldest first
    pub fn take_outgoing(&mut self) -> impl Iterator<Item = OutgoingMessage> + '_ {
        self.queue.drain(..)
    }
}
