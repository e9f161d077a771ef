//! Routing between client messages, the hardware link, and the broadcast hub.

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::serial::HardwareCommand;
use crate::ws::{BroadcastHub, BroadcastReport, ClientFrame, ClientId, Envelope, Message};

/// What happened to one routed message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteOutcome {
    /// A hardware command was queued for the link.
    pub command_queued: bool,
    pub broadcast: BroadcastReport,
}

/// Decides, per message, whether to command the hardware and what to fan out.
#[derive(Debug, Clone)]
pub struct MessageRouter {
    hub: BroadcastHub,
    commands: mpsc::Sender<HardwareCommand>,
}

impl MessageRouter {
    pub fn new(hub: BroadcastHub, commands: mpsc::Sender<HardwareCommand>) -> Self {
        Self { hub, commands }
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    /// Route a frame received from a client.
    ///
    /// `dir` and `speed` also queue a hardware command. Every frame is
    /// stamped with the sender's id and broadcast to all clients, the sender
    /// included.
    pub fn route_client(&self, sender: ClientId, frame: ClientFrame) -> RouteOutcome {
        let command = match &frame.message {
            Message::Direction(value) => Some(HardwareCommand::direction(value)),
            Message::Speed(value) => Some(HardwareCommand::speed(value)),
            _ => None,
        };

        let command_queued = command.is_some_and(|cmd| self.queue_command(sender, cmd));

        let envelope = Envelope::from_client(sender, frame);
        let broadcast = self.hub.broadcast_envelope(&envelope);
        debug!(
            "Client {} {} message delivered to {} client(s)",
            sender,
            envelope.message.kind(),
            broadcast.delivered
        );

        RouteOutcome {
            command_queued,
            broadcast,
        }
    }

    /// Route a message decoded from the hardware. Broadcast only.
    pub fn route_hardware(&self, message: Message) -> RouteOutcome {
        RouteOutcome {
            command_queued: false,
            broadcast: self.hub.broadcast_envelope(&Envelope::system(message)),
        }
    }

    fn queue_command(&self, sender: ClientId, cmd: HardwareCommand) -> bool {
        match self.commands.try_send(cmd) {
            Ok(()) => true,
            Err(TrySendError::Full(cmd)) => {
                warn!(
                    "Dropping hardware command {} from client {}: command queue full",
                    cmd, sender
                );
                false
            }
            Err(TrySendError::Closed(cmd)) => {
                warn!(
                    "Dropping hardware command {} from client {}: serial link unavailable",
                    cmd, sender
                );
                false
            }
        }
    }
}
