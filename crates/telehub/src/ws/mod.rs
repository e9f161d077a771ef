//! WebSocket hub for relaying client messages.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                    Browser clients (/ws)                      │
//! │  - Receive {"type":"register","clientid":n} on connect        │
//! │  - Send {"type":..,"data":..}; receive every echo             │
//! └──────────────────────────────┬────────────────────────────────┘
//!                                │ WebSocket
//! ┌──────────────────────────────▼────────────────────────────────┐
//! │  handler: register / parse / route / unregister               │
//! │  registry: id -> client outbox                                │
//! │  hub: snapshot + push into bounded outboxes                   │
//! └──────────────────────────────┬────────────────────────────────┘
//!                                │
//! ┌──────────────────────────────▼────────────────────────────────┐
//! │  router ──► command queue ──► serial monitor ──► device       │
//! │     ▲                                   │                     │
//! │     └──────────── telemetry ◄───────────┘                     │
//! └───────────────────────────────────────────────────────────────┘
//! ```

mod handler;
mod hub;
mod outbox;
mod registry;
mod types;

pub use handler::ws_handler;
pub use hub::{BroadcastHub, BroadcastReport};
pub use outbox::{Outbox, OverflowPolicy, PushOutcome};
pub use registry::{Client, ClientRegistry};
pub use types::{ClientFrame, ClientId, CommandValue, Envelope, Message, SYSTEM_CLIENT_ID};
