//! babble relay server library.
//!
//! Exposes the relay for use in tests and embedding. Clients connect over
//! WebSocket, announce a display name, and every chat line or join/leave
//! notice is broadcast to all connected clients in one global order.

pub mod config;
pub mod registry;
pub mod relay;
pub mod server;
