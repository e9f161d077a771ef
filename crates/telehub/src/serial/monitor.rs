//! Long-running task that owns the hardware link.
//!
//! It writes queued hardware commands, reads frames from the controller and
//! hands telemetry to the router. While the link is down, queued commands are
//! dropped with a warning rather than replayed later.

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::frame::{HardwareCommand, SerialFrame, parse_frame};
use super::link::{LinkState, PortOpener, SerialLink};
use crate::error::SerialError;
use crate::router::MessageRouter;
use crate::ws::Message;

/// How inbound bytes are cut into frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameMode {
    /// Frames end with the line terminator.
    #[default]
    Line,
    /// Frames are a fixed number of bytes.
    Fixed,
}

/// Framing and decoding settings for the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    pub frame_mode: FrameMode,
    /// Frame size in [`FrameMode::Fixed`].
    pub frame_len: usize,
    pub line_terminator: u8,
    /// Appended to every outbound command.
    pub command_terminator: String,
    /// Number of values a telemetry frame must carry.
    pub telemetry_fields: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            frame_mode: FrameMode::Line,
            frame_len: 16,
            line_terminator: b'\n',
            command_terminator: String::new(),
            telemetry_fields: 4,
        }
    }
}

/// Drives a [`SerialLink`] for the lifetime of the process.
pub struct SerialMonitor<O: PortOpener> {
    link: SerialLink<O>,
    commands: mpsc::Receiver<HardwareCommand>,
    router: MessageRouter,
    settings: MonitorSettings,
}

impl<O: PortOpener> SerialMonitor<O> {
    pub fn new(
        link: SerialLink<O>,
        commands: mpsc::Receiver<HardwareCommand>,
        router: MessageRouter,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            link,
            commands,
            router,
            settings,
        }
    }

    pub fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe_state()
    }

    /// Run until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Serial monitor started");

        loop {
            if !self.link.is_connected() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    result = self.link.connect() => {
                        if let Err(e) = result {
                            if self.link.is_exhausted() {
                                error!("Serial link unavailable: {}; hardware commands will be dropped", e);
                                self.drop_commands_until(&cancel).await;
                                break;
                            }
                            warn!("Serial connect failed: {}", e);
                        }
                    }
                    Some(cmd) = self.commands.recv() => {
                        warn!("Dropping hardware command {}: serial link is {}", cmd, self.link.state());
                    }
                }
                continue;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(cmd) = self.commands.recv() => self.write_command(cmd).await,
                frame = read_frame(&mut self.link, &self.settings) => match frame {
                    Ok(Some(line)) => self.handle_line(&line),
                    Ok(None) => {}
                    Err(e) if e.is_fatal_for_port() => {
                        warn!("Serial link lost: {}; reconnecting", e)
                    }
                    Err(e) => warn!("Serial read failed: {}", e),
                },
            }
        }

        info!("Serial monitor stopped");
    }

    async fn drop_commands_until(&mut self, cancel: &CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => warn!("Dropping hardware command {}: serial link is faulted", cmd),
                    None => {
                        cancel.cancelled().await;
                        return;
                    }
                },
            }
        }
    }

    async fn write_command(&mut self, cmd: HardwareCommand) {
        let bytes = cmd.encode(&self.settings.command_terminator);
        match self.link.send(&bytes).await {
            Ok(()) => debug!("Wrote hardware command {}", cmd),
            Err(e) => warn!("Failed to write hardware command {}: {}", cmd, e),
        }
    }

    /// Decode one frame and act on it.
    fn handle_line(&self, line: &str) {
        match parse_frame(line) {
            SerialFrame::Debug(text) => info!("[device] {}", text),
            SerialFrame::Telemetry(fields) => {
                if fields.len() != self.settings.telemetry_fields {
                    warn!(
                        "Dropping telemetry frame with {} fields (expected {}): {:?}",
                        fields.len(),
                        self.settings.telemetry_fields,
                        line
                    );
                    return;
                }
                self.router.route_hardware(Message::Telemetry(fields));
            }
            SerialFrame::Unknown { opcode } => {
                debug!("Ignoring frame with unknown opcode {:?}", opcode)
            }
            SerialFrame::Empty => {}
        }
    }
}

async fn read_frame<O: PortOpener>(
    link: &mut SerialLink<O>,
    settings: &MonitorSettings,
) -> Result<Option<String>, SerialError> {
    match settings.frame_mode {
        FrameMode::Line => link.read_line(settings.line_terminator).await,
        FrameMode::Fixed => Ok(link.read_exact(settings.frame_len).await?.map(|bytes| {
            String::from_utf8_lossy(&bytes)
                .trim_end_matches(['\r', '\n', '\0'])
                .to_string()
        })),
    }
}
