//! Realtime channel modules.
//!
//! - `client`: websocket transport, connection state, and reconnect handling.
//! - `dispatch`: tag-keyed listener registry.
//! - `proto`: protocol messages shared with the platform server.
//! - `session`: live per-device board fed by the channel.

/// Websocket connection worker and handle.
pub mod client;
/// Listener registry and inbound dispatch.
pub mod dispatch;
/// Channel protocol messages.
pub mod proto;
/// Device board that tracks live device state from channel events.
pub mod session;
