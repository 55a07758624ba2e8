// Network module - HOW PROCESSES TALK
// Peer messages, their wire format, and the messengers that carry them

mod messenger;
mod peer;
mod protocol;
mod tcp;

pub use messenger::{
    broadcast, flush_all, BroadcastReport, LocalMessenger, LocalNetwork, PeerMessenger,
    PeerUnavailableError,
};
pub use peer::{PeerError, PeerRegistry};
pub use protocol::{
    read_frame, write_frame, MessageType, PeerMessage, ProtocolError, DEFAULT_MAX_FRAME_BYTES, FRAME_LENGTH_LIMIT,
};
pub use tcp::{TcpBinding, TcpMessenger, TcpMessengerConfig, TransportError};
