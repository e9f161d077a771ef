//! Relay hub between WebSocket clients and a serial-connected controller.
//!
//! Clients send intent (`dir`, `speed`) over `/ws`; the router turns it into
//! hardware commands for the serial link and echoes every message, stamped
//! with the sender's id, to all connected clients. Telemetry read from the
//! controller is broadcast with client id 0.

pub mod api;
pub mod config;
pub mod error;
pub mod router;
pub mod serial;
pub mod ws;
