use crate::protocol::{is_newer, AckBits, Seq, ACKS_PER_BITFIELD};

/// Tracks which of the peer's packets were received, as a 32-wide window below the newest one.
///
/// The window is sent as `ack` / `ack_bits` in every outgoing packet header: `ack` is the newest
///  sequence number received so far, and bit *j* of `ack_bits` acknowledges `ack - 1 - j`.
///  Packets older than that can not be acknowledged any more.
#[derive(Clone, Debug, Default)]
pub struct AckWindow {
    latest: Option<Seq>,
    bits: AckBits,
}

impl AckWindow {
    pub fn new() -> AckWindow {
        AckWindow::default()
    }

    /// the newest sequence number received so far
    pub fn latest(&self) -> Option<Seq> {
        self.latest
    }

    pub fn bits(&self) -> AckBits {
        self.bits
    }

    /// the `ack` / `ack_bits` pair for an outgoing packet header
    pub fn header_values(&self) -> (Seq, AckBits) {
        (self.latest.unwrap_or(0), self.bits)
    }

    /// Records the receipt of a packet
    pub fn observe(&mut self, sequence: Seq) {
        let Some(latest) = self.latest else {
            self.latest = Some(sequence);
            self.bits = 0;
            return;
        };

        if is_newer(sequence, latest) {
            let gap = sequence.wrapping_sub(latest);
            self.bits = self.bits.checked_shl(gap).unwrap_or(0);
            if gap <= ACKS_PER_BITFIELD {
                self.bits |= 1 << (gap - 1);
            }
            self.latest = Some(sequence);
        }
        else if let Some(bit) = bit_for(latest, sequence) {
            self.bits |= 1 << bit;
        }
    }

    pub fn is_acked(&self, sequence: Seq) -> bool {
        let Some(latest) = self.latest else {
            return false;
        };
        if sequence == latest {
            return true;
        }
        bit_for(latest, sequence)
            .map(|bit| self.bits & (1 << bit) != 0)
            .unwrap_or(false)
    }
}

/// the bit acknowledging `sequence` in a window whose newest entry is `latest`, if any
fn bit_for(latest: Seq, sequence: Seq) -> Option<u32> {
    let diff = latest.wrapping_sub(sequence);
    if (1..=ACKS_PER_BITFIELD).contains(&diff) {
        Some(diff - 1)
    }
    else {
        None
    }
}

/// All sequence numbers acknowledged by a received `ack` / `ack_bits` pair, newest first
pub fn acknowledged_sequences(ack: Seq, ack_bits: AckBits) -> impl Iterator<Item = Seq> {
    let older = (0..ACKS_PER_BITFIELD)
        .filter(move |j| ack_bits & (1 << j) != 0)
        .map(move |j| ack.wrapping_sub(j + 1));
    std::iter::once(ack).chain(older)
}
