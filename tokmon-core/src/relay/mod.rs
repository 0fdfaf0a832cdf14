//! Real-time fan-out to connected observers.

pub mod hub;
pub mod socket;

pub use hub::{
    BroadcastReport, ConnectionHandle, ConnectionId, ConnectionState, DropReason, Frame,
    HubConfig, HubEvent, RelayHub,
};
pub use socket::serve_socket;
