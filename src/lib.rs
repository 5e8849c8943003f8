//! This is a lightweight transport protocol for exchanging messages between two peers over UDP,
//!  with per-channel delivery guarantees ranging from 'fire and forget' to reliable in-sequence
//!  delivery. It is designed for latency-sensitive applications (games, simulations) where
//!  stale data is worthless and head-of-line blocking across unrelated streams is unacceptable.
//!
//! ## Design
//!
//! * A *connection* is identified by the peer's address and a 'magic number' that the server
//!   assigns. Apart from requesting the magic number, there is no handshake
//! * Each connection multiplexes *channels*, identified by a 16 bit number. Every channel has
//!   one of the following modes:
//!   * RAW: unreliable, messages are delivered in arrival order, duplicates are dropped
//!   * NEWEST: unreliable, only the newest message is delivered, older ones are discarded
//!   * RELIABLE: every message is delivered eventually, in arrival order
//!   * SEQUENTIAL: every message is delivered eventually, in the order it was sent
//!   * Channel 0 is a SEQUENTIAL channel reserved for control messages
//! * *Packets* carry a sequence number and acknowledge the 33 most recent packets received from
//!   the peer. Every tick sends at least one packet, so acknowledgements flow even if there is
//!   no application data.
//!   * A sent packet that is not acknowledged while it is among the most recent `sent_window`
//!     packets is considered lost. The reliable messages it carried are sent again.
//! * Messages that do not fit into a single packet are split into up to 32 fragments and
//!   re-assembled on the receiving side. Only reliable channels support fragmentation.
//! * Several messages are packed into a single packet, trying to minimise the number of packets
//!   per tick
//! * There is no encryption, no congestion control and no path MTU discovery
//!
//! Received packets are copied into a pool of buffers once, and messages are handed to the
//!  application as views into that copy. See [buffers] for details.
//!
//! ## Connecting
//!
//! A client sends the four bytes `CONN` to the server, repeating them on every tick until it
//!  receives a reply. The server replies with the magic number for the connection (u32, LE),
//!  creating the connection when it hears from a new address for the first time.
//!
//! ## Packet
//!
//! All numbers are little endian.
//!
//! ```ascii
//!  0: magic number (u32)
//!  4: packet sequence number (u32)
//!  8: ack (u32) - the most recent sequence number received from the peer, 0 if none
//! 12: ack bits (u32) - bit n acknowledges packet number `ack - 1 - n`
//! 16: message records, until the end of the datagram
//! ```
//!
//! A packet is at most `max_packet_size` bytes long, with no padding.
//!
//! ## Message record
//!
//! ```ascii
//!  0: channel id (u16)
//!  2: message sequence number (u32), starting at 1 per channel
//!  6: size of this record's payload (u16)
//!  8: fragment id (u8), 0xFF if the message is not fragmented
//!
//!  only for fragments:
//!  9: number of fragments (u8), 1 to 32
//! 10: total size of the message (u16)
//!
//! after the header: payload
//! ```
//!
//! All fragments except the last one have the same size, so a fragment's place in the message
//!  is `id * size` for those, and `total size - size` for the last one.

pub mod ack_window;
pub mod buf_ext;
pub mod buffers;
pub mod channel;
pub mod config;
pub mod connection;
pub mod end_point;
pub mod message_header;
pub mod packet_header;
pub mod packet_socket;
pub mod packing;
pub mod protocol;
pub mod safe_converter;

#[cfg(test)] mod test_util;
