//! Wire format, error taxonomy, and transport contract for the Display
//! Handler protocol: the part of the stack shared verbatim by both the
//! provider (guest) and consumer (host) halves.

pub mod channel;
pub mod error;
pub mod types;
pub mod wire;

pub use channel::{AcceptCallback, Channel, DataCallback, DisconnectCallback, ListeningServer, MemoryView, Transport};
pub use error::{Error, ProtocolError, Result};
pub use types::PacketType;
pub use wire::{Packet, PacketFooter, PacketHeader, HEADER_SIZE, FOOTER_SIZE, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE};
