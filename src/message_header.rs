use std::fmt::Debug;
use bytes::{Buf, BufMut};
use crate::buf_ext::BufMutExt;
use crate::protocol::{ChannelId, FragmentId, MessageSize, Seq, FRAG_MSG_HEADER_SIZE, MSG_HEADER_SIZE, NOT_FRAGMENTED};
use crate::safe_converter::SafeCast;

/// Position of a fragment within its message
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FragmentInfo {
    pub id: FragmentId,
    pub count: FragmentId,
    /// size of the complete message
    pub total_size: MessageSize,
}

/// Header of a message record inside a packet. The record's payload of `message_size` bytes
///  follows immediately.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct MessageHeader {
    pub channel_id: ChannelId,
    pub sequence: Seq,
    pub message_size: MessageSize,
    pub fragment: Option<FragmentInfo>,
}
impl Debug for MessageHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.fragment {
            None => write!(f, "MSG{{{}#{}:{}}}", self.channel_id, self.sequence, self.message_size),
            Some(fragment) => write!(f, "MSG{{{}#{}:{}[{}/{} of {}]}}", self.channel_id, self.sequence, self.message_size, fragment.id, fragment.count, fragment.total_size),
        }
    }
}

impl MessageHeader {
    pub fn serialized_len(fragmented: bool) -> usize {
        if fragmented {
            FRAG_MSG_HEADER_SIZE
        }
        else {
            MSG_HEADER_SIZE
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) -> anyhow::Result<()> {
        if buf.remaining_mut() < Self::serialized_len(self.fragment.is_some()) {
            anyhow::bail!("no room for message header: {} bytes remaining", buf.remaining_mut());
        }

        buf.try_put_u16_le(self.channel_id)?;
        buf.try_put_u32_le(self.sequence)?;
        buf.try_put_u16_le(self.message_size)?;
        match &self.fragment {
            None => buf.try_put_u8(NOT_FRAGMENTED),
            Some(fragment) => {
                buf.try_put_u8(fragment.id)?;
                buf.try_put_u8(fragment.count)?;
                buf.try_put_u16_le(fragment.total_size)
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<MessageHeader> {
        let channel_id = buf.try_get_u16_le()?;
        let sequence = buf.try_get_u32_le()?;
        let message_size = buf.try_get_u16_le()?;
        let fragment = match buf.try_get_u8()? {
            NOT_FRAGMENTED => None,
            id => Some(FragmentInfo {
                id,
                count: buf.try_get_u8()?,
                total_size: buf.try_get_u16_le()?,
            }),
        };

        let result = MessageHeader {
            channel_id,
            sequence,
            message_size,
            fragment,
        };
        if buf.remaining() < result.message_size.safe_cast() {
            anyhow::bail!("{:?}: payload exceeds the packet, only {} bytes remaining", result, buf.remaining());
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn unfragmented(channel_id: ChannelId, sequence: Seq, message_size: MessageSize) -> MessageHeader {
        MessageHeader { channel_id, sequence, message_size, fragment: None }
    }

    fn fragmented(channel_id: ChannelId, sequence: Seq, message_size: MessageSize, id: FragmentId, count: FragmentId, total_size: MessageSize) -> MessageHeader {
        MessageHeader { channel_id, sequence, message_size, fragment: Some(FragmentInfo { id, count, total_size }) }
    }

    #[rstest]
    #[case::simple(unfragmented(1, 1, 3))]
    #[case::control(unfragmented(0, 99, 0))]
    #[case::max(unfragmented(u16::MAX, u32::MAX, 5))]
    #[case::first_fragment(fragmented(2, 7, 4, 0, 3, 10))]
    #[case::last_fragment(fragmented(2, 7, 2, 2, 3, 10))]
    #[case::fragment_31(fragmented(2, 7, 1, 31, 32, 32))]
    fn test_ser(#[case] header: MessageHeader) {
        let mut buf = Vec::new();
        header.ser(&mut buf).unwrap();
        assert_eq!(buf.len(), MessageHeader::serialized_len(header.fragment.is_some()));
        buf.extend(std::iter::repeat(0xaa).take(header.message_size as usize));

        let mut b: &[u8] = &buf;
        let deser = MessageHeader::deser(&mut b).unwrap();
        assert_eq!(b.len(), header.message_size as usize);
        assert_eq!(deser, header);
    }

    #[test]
    fn test_wire_layout() {
        let mut buf = Vec::new();
        unfragmented(0x0201, 0x0605_0403, 0x0807).ser(&mut buf).unwrap();
        assert_eq!(buf, vec![1,2, 3,4,5,6, 7,8, 0xff]);

        let mut buf = Vec::new();
        fragmented(1, 2, 3, 4, 5, 0x0706).ser(&mut buf).unwrap();
        assert_eq!(buf, vec![1,0, 2,0,0,0, 3,0, 4, 5, 6,7]);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::truncated_header(vec![1,0, 2,0,0,0, 3,0])]
    #[case::truncated_fragment_header(vec![1,0, 2,0,0,0, 0,0, 1, 2])]
    #[case::truncated_payload(vec![1,0, 2,0,0,0, 3,0, 0xff, 1, 2])]
    fn test_deser_truncated(#[case] buf: Vec<u8>) {
        let mut b: &[u8] = &buf;
        assert!(MessageHeader::deser(&mut b).is_err());
    }

    #[test]
    fn test_debug() {
        assert_eq!(format!("{:?}", unfragmented(1, 2, 3)), "MSG{1#2:3}");
        assert_eq!(format!("{:?}", fragmented(1, 2, 3, 0, 2, 5)), "MSG{1#2:3[0/2 of 5]}");
    }
}
