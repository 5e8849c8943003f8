//! Channels are independently sequenced sub-streams of a connection. Each channel has a
//!  delivery mode that is fixed when it is opened, and both peers must open it with the
//!  same mode.
//!
//! The send side ([ChannelOut]) only numbers and queues messages; the receive side
//!  ([ChannelIn]) reassembles fragments and decides which message to hand out next,
//!  depending on the mode.

mod channel_in;
mod channel_out;

pub use channel_in::{ChannelIn, PendingPacket};
pub use channel_out::{ChannelOut, OutgoingMessage};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ChannelMode {
    /// Messages are delivered as they arrive, lost messages stay lost
    Raw,
    /// Only the newest message is delivered, anything older is discarded
    Newest,
    /// Every message is delivered exactly once, not necessarily in send order
    Reliable,
    /// Every message is delivered exactly once, in send order
    Sequential,
}

impl ChannelMode {
    pub fn is_reliable(&self) -> bool {
        matches!(self, ChannelMode::Reliable | ChannelMode::Sequential)
    }
}

/// What both halves of a channel have in common
#[derive(Clone, Copy, Debug)]
pub struct Channel {
    mode: ChannelMode,
}

impl Channel {
    pub fn new(mode: ChannelMode) -> Channel {
        Channel { mode }
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    pub fn is_reliable(&self) -> bool {
        self.mode.is_reliable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::raw(ChannelMode::Raw, false)]
    #[case::newest(ChannelMode::Newest, false)]
    #[case::reliable(ChannelMode::Reliable, true)]
    #[case::sequential(ChannelMode::Sequential, true)]
    fn test_is_reliable(#[case] mode: ChannelMode, #[case] expected: bool) {
        assert_eq!(Channel::new(mode).is_reliable(), expected);
    }
}
