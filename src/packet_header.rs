use std::fmt::Debug;
use bytes::{Buf, BufMut};
use crate::buf_ext::BufMutExt;
use crate::protocol::{AckBits, Magic, Seq, HEADER_SIZE};

/// The fixed header at the start of every datagram. All fields are little endian.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct PacketHeader {
    pub magic: Magic,
    pub sequence: Seq,
    /// newest packet received from the peer
    pub ack: Seq,
    /// bit *j* acknowledges `ack - 1 - j`
    pub ack_bits: AckBits,
}
impl Debug for PacketHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PCKT{{{:08x}#{}:ACK{}/{:032b}}}", self.magic, self.sequence, self.ack, self.ack_bits)
    }
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = HEADER_SIZE;

    pub fn ser(&self, buf: &mut impl BufMut) -> anyhow::Result<()> {
        if buf.remaining_mut() < Self::SERIALIZED_LEN {
            anyhow::bail!("no room for packet header: {} bytes remaining", buf.remaining_mut());
        }
        buf.try_put_u32_le(self.magic)?;
        buf.try_put_u32_le(self.sequence)?;
        buf.try_put_u32_le(self.ack)?;
        buf.try_put_u32_le(self.ack_bits)
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            anyhow::bail!("packet of {} bytes is too short for a header", buf.remaining());
        }
        Ok(PacketHeader {
            magic: buf.try_get_u32_le()?,
            sequence: buf.try_get_u32_le()?,
            ack: buf.try_get_u32_le()?,
            ack_bits: buf.try_get_u32_le()?,
        })
    }
}
