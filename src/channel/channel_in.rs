use std::collections::VecDeque;
use std::mem;
use anyhow::bail;
use tracing::{debug, trace};
use crate::buffers::buffer_pool::PacketPool;
use crate::buffers::packet_view::PacketView;
use crate::channel::{Channel, ChannelMode};
use crate::protocol::{FragmentId, FragmentMask, Seq, FRAGMENTS_PER_BITFIELD};
use crate::safe_converter::SafeCast;

/// A received message, or the parts of a fragmented message that arrived so far
#[derive(Debug)]
pub struct PendingPacket {
    pub sequence: Seq,
    /// bit *i* set <=> fragment *i* was not received yet
    pub fragment_need: FragmentMask,
    /// the (re)assembly buffer - empty once the message was handed out
    pub buffer: PacketView,
}

impl PendingPacket {
    fn is_complete(&self) -> bool {
        self.fragment_need == 0
    }

    fn is_consumed(&self) -> bool {
        self.buffer.is_empty()
    }

    fn is_deliverable(&self) -> bool {
        self.is_complete() && !self.is_consumed()
    }
}

/// The receiving half of a channel.
///
/// Received messages are kept in `pending`, ordered by sequence number and without duplicates.
///  Nothing at or below `last_read` is ever admitted, so re-sent or delayed duplicates are
///  dropped here. How messages leave `pending` depends on the channel's mode, see
///  [ChannelIn::take_next].
pub struct ChannelIn {
    channel: Channel,
    last_read: Seq,
    pending: VecDeque<PendingPacket>,
    raw_capacity: usize,
}

impl ChannelIn {
    pub fn new(mode: ChannelMode, raw_capacity: usize) -> ChannelIn {
        ChannelIn {
            channel: Channel::new(mode),
            last_read: 0,
            pending: VecDeque::new(),
            raw_capacity,
        }
    }

    pub fn mode(&self) -> ChannelMode {
        self.channel.mode()
    }

    pub fn last_read(&self) -> Seq {
        self.last_read
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingPacket> {
        self.pending.iter()
    }

    /// Adds a message (or the assembly buffer for a fragmented message) to the pending queue.
    ///  Returns `false` if the message was dropped as a duplicate or because it is too old.
    pub fn admit(&mut self, sequence: Seq, buffer: PacketView, fragment_need: FragmentMask) -> bool {
        self.insert(sequence, buffer, fragment_need).is_some()
    }

    /// returns the position of the new entry
    fn insert(&mut self, sequence: Seq, buffer: PacketView, fragment_need: FragmentMask) -> Option<usize> {
        if sequence <= self.last_read {
            trace!("message #{} was read already - dropping", sequence);
            return None;
        }

        let idx = self.pending.partition_point(|p| p.sequence < sequence);
        if self.pending.get(idx).is_some_and(|p| p.sequence == sequence) {
            trace!("message #{} is a duplicate - dropping", sequence);
            return None;
        }
        self.pending.insert(idx, PendingPacket {
            sequence,
            fragment_need,
            buffer,
        });

        let mut idx = Some(idx);
        if self.channel.mode() == ChannelMode::Raw {
            // NB: this advances last_read past messages that may never have been handed out
            while self.pending.len() > self.raw_capacity {
                if let Some(evicted) = self.pending.pop_front() {
                    debug!("RAW channel full - evicting message #{}", evicted.sequence);
                    self.last_read = evicted.sequence;
                    idx = idx.and_then(|i| i.checked_sub(1));
                }
            }
        }
        idx
    }

    /// Copies one fragment of a fragmented message into the message's assembly buffer, creating
    ///  the buffer from `pool` when the first fragment arrives. Fragments that arrive again,
    ///  or after the message was handed out, are ignored.
    ///
    /// A fragment that does not fit its message (bad id or count, a range outside the message,
    ///  or a total size that differs from earlier fragments) is rejected with an error, and
    ///  nothing changes. The assembly buffer is exclusive to this channel until the message is
    ///  complete, so copying into it can not fail otherwise.
    #[allow(clippy::too_many_arguments)]
    pub fn admit_fragment(
        &mut self,
        sequence: Seq,
        fragment: &PacketView,
        fragment_id: FragmentId,
        fragment_count: FragmentId,
        byte_offset: usize,
        total_size: usize,
        pool: &PacketPool,
    ) -> anyhow::Result<()> {
        let fragment_count: usize = fragment_count.safe_cast();
        let fragment_index: usize = fragment_id.safe_cast();
        if fragment_count == 0 || fragment_count > FRAGMENTS_PER_BITFIELD || fragment_index >= fragment_count {
            bail!("message #{}: invalid fragment {} of {}", sequence, fragment_id, fragment_count);
        }
        if total_size == 0 || byte_offset + fragment.len() > total_size {
            bail!("message #{}: fragment {} at {}..{} exceeds the message size of {}", sequence, fragment_id, byte_offset, byte_offset + fragment.len(), total_size);
        }

        let bit: FragmentMask = 1 << fragment_id;

        let idx = match self.pending.binary_search_by_key(&sequence, |p| p.sequence) {
            Ok(idx) => idx,
            Err(_) => {
                if sequence <= self.last_read {
                    trace!("fragment of message #{} which was read already - dropping", sequence);
                    return Ok(());
                }

                let all_fragments = FragmentMask::MAX >> (FRAGMENTS_PER_BITFIELD - fragment_count);
                let buffer = pool.allocate_exclusive(total_size);
                buffer.copy_from(byte_offset, fragment)?;
                self.insert(sequence, buffer, all_fragments & !bit);
                return Ok(());
            }
        };

        let pending = &mut self.pending[idx];
        if pending.is_consumed() || pending.fragment_need & bit == 0 {
            trace!("fragment {} of message #{} is a duplicate - dropping", fragment_id, sequence);
            return Ok(());
        }
        if pending.buffer.len() != total_size {
            bail!("message #{}: fragment {} declares a total size of {}, previous fragments declared {}", sequence, fragment_id, total_size, pending.buffer.len());
        }

        pending.buffer.copy_from(byte_offset, fragment)?;
        pending.fragment_need &= !bit;
        Ok(())
    }

    /// Hands out the next message according to the channel's mode:
    ///
    /// * RAW: the oldest complete message. Entries stay in the queue until they are evicted.
    /// * NEWEST: the newest complete message; everything up to it is discarded.
    /// * RELIABLE: the oldest complete message, regardless of gaps before it
    /// * SEQUENTIAL: the message following the last one handed out, if it is complete
    pub fn take_next(&mut self) -> Option<PacketView> {
        if self.pending.is_empty() {
            return None;
        }

        match self.channel.mode() {
            ChannelMode::Raw => self.take_first_complete(),
            ChannelMode::Newest => self.take_newest(),
            ChannelMode::Reliable => {
                let result = self.take_first_complete();
                self.reclaim_consumed_prefix();
                result
            }
            ChannelMode::Sequential => self.take_in_sequence(),
        }
    }

    fn take_first_complete(&mut self) -> Option<PacketView> {
        self.pending.iter_mut()
            .find(|p| p.is_deliverable())
            .map(|p| mem::take(&mut p.buffer))
    }

    fn take_newest(&mut self) -> Option<PacketView> {
        let last_read = self.last_read;
        let idx = self.pending.iter()
            .rposition(|p| p.is_deliverable() && p.sequence > last_read)?;

        let newest = &mut self.pending[idx];
        self.last_read = newest.sequence;
        let result = mem::take(&mut newest.buffer);

        self.pending.drain(..=idx);
        Some(result)
    }

    /// drop consumed entries from the front as long as they continue `last_read`
    fn reclaim_consumed_prefix(&mut self) {
        while let Some(front) = self.pending.front() {
            if !front.is_consumed() || front.sequence != self.last_read.wrapping_add(1) {
                break;
            }
            self.last_read = front.sequence;
            self.pending.pop_front();
        }
    }

    fn take_in_sequence(&mut self) -> Option<PacketView> {
        let front = self.pending.front()?;
        if !front.is_complete() || front.sequence != self.last_read.wrapping_add(1) {
            return None;
        }

        let front = self.pending.pop_front()?;
        self.last_read = front.sequence;
        Some(front.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn msg(data: &[u8]) -> PacketView {
        PacketView::standalone(data)
    }

    fn sequences(channel: &ChannelIn) -> Vec<Seq> {
        channel.pending().map(|p| p.sequence).collect()
    }

    fn take_all(channel: &mut ChannelIn) -> Vec<Vec<u8>> {
        let mut result = Vec::new();
        while let Some(m) = channel.take_next() {
            result.push(m.to_vec());
        }
        result
    }

    #[rstest]
    #[case::in_order(vec![1,2,3,4], vec![1,2,3,4])]
    #[case::reversed(vec![4,3,2,1], vec![1,2,3,4])]
    #[case::mixed(vec![3,1,4,2], vec![1,2,3,4])]
    #[case::duplicates(vec![2,2,1,2,1], vec![1,2])]
    #[case::gaps(vec![10,5,7], vec![5,7,10])]
    fn test_admit_keeps_order(#[case] admitted: Vec<Seq>, #[case] expected: Vec<Seq>) {
        let mut channel = ChannelIn::new(ChannelMode::Reliable, 32);
        for seq in admitted {
            channel.admit(seq, msg(b"x"), 0);
        }
        assert_eq!(sequences(&channel), expected);
    }

    #[rstest]
    #[case::raw(ChannelMode::Raw)]
    #[case::newest(ChannelMode::Newest)]
    #[case::reliable(ChannelMode::Reliable)]
    #[case::sequential(ChannelMode::Sequential)]
    fn test_take_from_empty(#[case] mode: ChannelMode) {
        let mut channel = ChannelIn::new(mode, 32);
        assert!(channel.take_next().is_none());
    }

    #[rstest]
    #[case::raw(ChannelMode::Raw)]
    #[case::newest(ChannelMode::Newest)]
    #[case::reliable(ChannelMode::Reliable)]
    #[case::sequential(ChannelMode::Sequential)]
    fn test_no_duplicate_delivery(#[case] mode: ChannelMode) {
        let mut channel = ChannelIn::new(mode, 32);
        assert!(channel.admit(1, msg(b"a"), 0));
        assert_eq!(take_all(&mut channel), vec![b"a".to_vec()]);

        channel.admit(1, msg(b"a"), 0);
        assert!(channel.take_next().is_none());
    }

    #[test]
    fn test_admit_rejects_stale() {
        let mut channel = ChannelIn::new(ChannelMode::Sequential, 32);
        channel.admit(1, msg(b"a"), 0);
        channel.take_next().unwrap();
        assert_eq!(channel.last_read(), 1);

        assert!(!channel.admit(1, msg(b"b"), 0));
        assert!(!channel.admit(0, msg(b"b"), 0));
        assert!(channel.admit(2, msg(b"b"), 0));
    }

    #[test]
    fn test_raw_delivers_in_arrival_order_of_sequence() {
        let mut channel = ChannelIn::new(ChannelMode::Raw, 32);
        channel.admit(3, msg(b"c"), 0);
        channel.admit(1, msg(b"a"), 0);
        assert_eq!(take_all(&mut channel), vec![b"a".to_vec(), b"c".to_vec()]);

        // consumed entries are only removed by eviction
        assert_eq!(sequences(&channel), vec![1, 3]);
        assert_eq!(channel.last_read(), 0);
    }

    #[test]
    fn test_raw_eviction() {
        let mut channel = ChannelIn::new(ChannelMode::Raw, 3);
        for seq in 1..=3 {
            channel.admit(seq, msg(&[seq as u8]), 0);
        }
        assert_eq!(channel.last_read(), 0);

        channel.admit(4, msg(&[4]), 0);
        assert_eq!(sequences(&channel), vec![2, 3, 4]);
        assert_eq!(channel.last_read(), 1);

        // message 1 was never handed out, but it is gone
        assert!(!channel.admit(1, msg(&[1]), 0));
        assert_eq!(take_all(&mut channel), vec![vec![2], vec![3], vec![4]]);
    }

    #[test]
    fn test_raw_eviction_of_old_arrival() {
        let mut channel = ChannelIn::new(ChannelMode::Raw, 2);
        channel.admit(5, msg(b"e"), 0);
        channel.admit(6, msg(b"f"), 0);
        // message 4 is older than everything in the queue, so it is evicted right away
        assert!(!channel.admit(4, msg(b"d"), 0));
        assert_eq!(sequences(&channel), vec![5, 6]);
        assert_eq!(channel.last_read(), 4);
    }

    #[test]
    fn test_newest_wins() {
        let mut channel = ChannelIn::new(ChannelMode::Newest, 32);
        channel.admit(5, msg(b"5"), 0);
        channel.admit(7, msg(b"7"), 0);
        channel.admit(6, msg(b"6"), 0);

        assert_eq!(channel.take_next().unwrap().to_vec(), b"7".to_vec());
        assert_eq!(sequences(&channel), Vec::<Seq>::new());
        assert_eq!(channel.last_read(), 7);
        assert!(channel.take_next().is_none());

        assert!(!channel.admit(6, msg(b"6"), 0));
    }

    #[test]
    fn test_newest_skips_incomplete() {
        let pool = PacketPool::new(64, 4);
        let mut channel = ChannelIn::new(ChannelMode::Newest, 32);
        channel.admit(1, msg(b"1"), 0);
        channel.admit_fragment(3, &msg(b"ab"), 0, 2, 0, 4, &pool).unwrap();
        channel.admit(2, msg(b"2"), 0);

        assert_eq!(channel.take_next().unwrap().to_vec(), b"2".to_vec());
        assert_eq!(sequences(&channel), vec![3]);

        channel.admit_fragment(3, &msg(b"cd"), 1, 2, 2, 4, &pool).unwrap();
        assert_eq!(channel.take_next().unwrap().to_vec(), b"abcd".to_vec());
    }

    #[test]
    fn test_reliable_out_of_order() {
        let mut channel = ChannelIn::new(ChannelMode::Reliable, 32);
        channel.admit(2, msg(b"b"), 0);
        channel.admit(3, msg(b"c"), 0);

        assert_eq!(take_all(&mut channel), vec![b"b".to_vec(), b"c".to_vec()]);
        // not reclaimed because message 1 is still missing
        assert_eq!(sequences(&channel), vec![2, 3]);
        assert_eq!(channel.last_read(), 0);

        channel.admit(1, msg(b"a"), 0);
        assert_eq!(take_all(&mut channel), vec![b"a".to_vec()]);
        assert_eq!(sequences(&channel), Vec::<Seq>::new());
        assert_eq!(channel.last_read(), 3);

        // duplicates of consumed messages are rejected, reclaimed or not
        assert!(!channel.admit(2, msg(b"b"), 0));
    }

    #[test]
    fn test_reliable_rejects_duplicate_of_unreclaimed() {
        let mut channel = ChannelIn::new(ChannelMode::Reliable, 32);
        channel.admit(2, msg(b"b"), 0);
        channel.take_next().unwrap();
        assert!(!channel.admit(2, msg(b"b"), 0));
        assert!(channel.take_next().is_none());
    }

    #[test]
    fn test_sequential_waits_for_gap() {
        let mut channel = ChannelIn::new(ChannelMode::Sequential, 32);
        channel.admit(2, msg(b"b"), 0);
        assert!(channel.take_next().is_none());

        channel.admit(1, msg(b"a"), 0);
        assert_eq!(take_all(&mut channel), vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(channel.last_read(), 2);
    }

    #[test]
    fn test_sequential_blocked_by_incomplete_message() {
        let pool = PacketPool::new(64, 4);
        let mut channel = ChannelIn::new(ChannelMode::Sequential, 32);
        channel.admit_fragment(1, &msg(b"ab"), 1, 2, 2, 4, &pool).unwrap();
        channel.admit(2, msg(b"next"), 0);
        assert!(channel.take_next().is_none());

        channel.admit_fragment(1, &msg(b"xy"), 0, 2, 0, 4, &pool).unwrap();
        assert_eq!(take_all(&mut channel), vec![b"xyab".to_vec(), b"next".to_vec()]);
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2])]
    #[case::reversed(vec![2, 1, 0])]
    #[case::last_first(vec![2, 0, 1])]
    #[case::middle_first(vec![1, 2, 0])]
    #[case::with_duplicates(vec![1, 1, 2, 1, 0])]
    fn test_reassembly(#[case] order: Vec<u8>, #[values(ChannelMode::Raw, ChannelMode::Newest, ChannelMode::Reliable, ChannelMode::Sequential)] mode: ChannelMode) {
        let complete = b"0123456789";
        let fragments = [(0usize, 4usize), (4, 4), (8, 2)];

        let pool = PacketPool::new(64, 4);
        let mut channel = ChannelIn::new(mode, 32);

        // the last fragment in each order is the one completing the message
        for id in order {
            assert!(channel.take_next().is_none());

            let (offs, len) = fragments[id as usize];
            let fragment = msg(&complete[offs..offs + len]);
            channel.admit_fragment(1, &fragment, id, 3, offs, complete.len(), &pool).unwrap();
        }
        assert_eq!(channel.take_next().unwrap().to_vec(), complete.to_vec());
        assert!(channel.take_next().is_none());
    }

    #[test]
    fn test_fragment_after_delivery_is_ignored() {
        let pool = PacketPool::new(64, 4);
        let mut channel = ChannelIn::new(ChannelMode::Raw, 32);
        channel.admit_fragment(1, &msg(b"a"), 0, 2, 0, 2, &pool).unwrap();
        channel.admit_fragment(1, &msg(b"b"), 1, 2, 1, 2, &pool).unwrap();
        assert_eq!(channel.take_next().unwrap().to_vec(), b"ab".to_vec());

        channel.admit_fragment(1, &msg(b"b"), 1, 2, 1, 2, &pool).unwrap();
        assert!(channel.take_next().is_none());
    }

    #[test]
    fn test_fragment_of_read_message_allocates_nothing() {
        let pool = PacketPool::new(64, 4);
        let mut channel = ChannelIn::new(ChannelMode::Sequential, 32);
        channel.admit(1, msg(b"a"), 0);
        channel.take_next().unwrap();

        channel.admit_fragment(1, &msg(b"a"), 0, 2, 0, 2, &pool).unwrap();
        assert_eq!(pool.live_refs(0), 0);
        assert!(channel.pending().next().is_none());
    }

    #[rstest]
    #[case::zero_count(0, 0, 0, 4)]
    #[case::too_many_fragments(0, 33, 0, 4)]
    #[case::id_out_of_range(2, 2, 0, 4)]
    #[case::beyond_total(1, 2, 3, 4)]
    fn test_invalid_fragment(#[case] id: u8, #[case] count: u8, #[case] offset: usize, #[case] total: usize) {
        let pool = PacketPool::new(64, 4);
        let mut channel = ChannelIn::new(ChannelMode::Reliable, 32);
        assert!(channel.admit_fragment(1, &msg(b"ab"), id, count, offset, total, &pool).is_err());
        assert!(channel.pending().next().is_none());
    }

    #[test]
    fn test_inconsistent_total_size() {
        let pool = PacketPool::new(64, 4);
        let mut channel = ChannelIn::new(ChannelMode::Reliable, 32);
        channel.admit_fragment(1, &msg(b"ab"), 0, 2, 0, 4, &pool).unwrap();
        assert!(channel.admit_fragment(1, &msg(b"cd"), 1, 2, 2, 5, &pool).is_err());
        assert!(channel.take_next().is_none());

        // the rejected fragment left no trace
        channel.admit_fragment(1, &msg(b"cd"), 1, 2, 2, 4, &pool).unwrap();
        assert_eq!(channel.take_next().unwrap().to_vec(), b"abcd".to_vec());
    }

    #[test]
    fn test_reassembly_while_other_message_is_read() {
        let mut pool = PacketPool::new(64, 4);
        let mut channel = ChannelIn::new(ChannelMode::Reliable, 32);
        let packet = pool.allocate_from(b"xxabcd").unwrap();

        channel.admit(1, packet.subpacket(0, 2).unwrap(), 0);
        channel.admit_fragment(2, &packet.subpacket(2, 2).unwrap(), 0, 2, 0, 4, &pool).unwrap();
        let first = channel.take_next().unwrap();

        let bytes = first.bytes();
        channel.admit_fragment(2, &packet.subpacket(4, 2).unwrap(), 1, 2, 2, 4, &pool).unwrap();
        assert_eq!(&*bytes, b"xx");
        drop(bytes);

        assert_eq!(channel.take_next().unwrap().to_vec(), b"abcd".to_vec());
    }

    #[test]
    fn test_full_fragment_mask() {
        let pool = PacketPool::new(64, 4);
        let mut channel = ChannelIn::new(ChannelMode::Reliable, 32);
        for id in 0..32u8 {
            assert!(channel.take_next().is_none());
            channel.admit_fragment(1, &msg(&[id]), id, 32, id as usize, 32, &pool).unwrap();
        }
        assert_eq!(channel.take_next().unwrap().to_vec(), (0..32u8).collect::<Vec<_>>());
    }
}
