pub mod memory;
pub mod transport;
pub mod webrtc;
pub mod websocket;

pub use transport::{PeerTransport, TransportError, TransportEvent};
