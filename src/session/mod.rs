//! Realtime session: connection lifecycle, transport, and state.

pub mod live;
pub mod state;
pub mod transport;

pub use live::LiveSession;
pub use state::SessionState;
pub use transport::{
    MemoryConnection, MemoryTransport, OutboundFrame, Transport, TransportEvent,
    WebSocketTransport,
};
