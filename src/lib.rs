//! Rust SDK for the iotwatch telemetry platform.
//!
//! The crate is organized by transport surface:
//! - `stream`: realtime websocket client, listener dispatch, and the live
//!   device board.
//! - `api`: bearer-authenticated REST client for profile, devices,
//!   thresholds, alarms, and LED control.
//! - `retry`: shared retry, reconnect, and timeout utilities.

/// REST client and request/response types.
pub mod api;
/// Retry, reconnect and timeout helpers used across the SDK.
pub mod retry;
/// Realtime channel client, protocol types, and device board.
pub mod stream;
