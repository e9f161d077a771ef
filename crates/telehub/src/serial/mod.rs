//! Hardware side of the relay.
//!
//! - [`link`]: the serial connection and its reconnect state machine
//! - [`frame`]: the controller's line protocol in both directions
//! - [`monitor`]: the task that owns the link for the life of the process

pub mod frame;
pub mod link;
pub mod monitor;

pub use frame::{HardwareCommand, SerialFrame, parse_frame};
pub use link::{Backoff, DeviceOpener, LinkSettings, LinkState, PortOpener, SerialLink};
pub use monitor::{FrameMode, MonitorSettings, SerialMonitor};
