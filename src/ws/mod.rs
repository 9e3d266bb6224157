//! Client side of the realtime relay.

mod listeners;
mod manager;
mod service;

pub use listeners::{Handler, ListenerId, Listeners};
pub use manager::{connection_key, ConnectionManager};
pub use service::{ConnectionState, WebSocketService};
