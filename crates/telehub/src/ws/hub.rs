//! Broadcast hub fanning frames out to every registered client.

use std::sync::Arc;

use log::{debug, warn};

use super::outbox::{Outbox, OverflowPolicy, PushOutcome};
use super::registry::ClientRegistry;
use super::types::{ClientId, Envelope};

/// Per-call delivery summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Frames queued for a client.
    pub delivered: usize,
    /// Recipients whose outbox was already closed.
    pub skipped: usize,
    /// Deliveries that evicted an older frame.
    pub dropped: usize,
    /// Recipients removed because their outbox overflowed.
    pub disconnected: usize,
}

/// Fans serialized frames out to every client in the registry.
///
/// Each call snapshots the registry and pushes into the client outboxes
/// outside the registry lock. Pushes never block, so frames from successive
/// calls reach every recipient in call order.
#[derive(Debug, Clone)]
pub struct BroadcastHub {
    registry: Arc<ClientRegistry>,
    policy: OverflowPolicy,
}

impl BroadcastHub {
    pub fn new(registry: Arc<ClientRegistry>, policy: OverflowPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Deliver a serialized frame to every registered client.
    ///
    /// Failure to reach one client never affects the others and is never
    /// reported as an error.
    pub fn broadcast(&self, frame: impl Into<Arc<str>>) -> BroadcastReport {
        let frame = frame.into();
        let mut report = BroadcastReport::default();

        for client in self.registry.snapshot() {
            match client.outbox.push(frame.clone(), self.policy) {
                PushOutcome::Queued => report.delivered += 1,
                PushOutcome::DroppedOldest => {
                    report.delivered += 1;
                    report.dropped += 1;
                    debug!("Client {} is lagging, dropped its oldest frame", client.id);
                }
                PushOutcome::Overflowed => {
                    report.disconnected += 1;
                    warn!("Client {} outbox overflowed, disconnecting", client.id);
                    self.registry.unregister(client.id);
                }
                PushOutcome::Closed => {
                    report.skipped += 1;
                    debug!("Skipping closed client {}", client.id);
                }
            }
        }

        report
    }

    /// Serialize an envelope once and broadcast it.
    pub fn broadcast_envelope(&self, envelope: &Envelope) -> BroadcastReport {
        match envelope.to_json() {
            Ok(json) => self.broadcast(json),
            Err(e) => {
                warn!("Failed to serialize {} message: {}", envelope.message.kind(), e);
                BroadcastReport::default()
            }
        }
    }

    /// Register a client with its `register` acknowledgement already queued.
    ///
    /// The acknowledgement is queued under the registry lock, so it is always
    /// the first frame the client sees, ahead of any concurrent broadcast.
    pub fn connect(&self, outbox: Arc<Outbox>) -> ClientId {
        self.registry
            .register_with(outbox, |id| match Envelope::register(id).to_json() {
                Ok(json) => Some(json.into()),
                Err(e) => {
                    warn!("Failed to serialize register ack for client {}: {}", id, e);
                    None
                }
            })
    }

    /// Frames evicted from client outboxes by the drop-oldest policy.
    pub fn dropped_frames(&self) -> u64 {
        self.registry
            .snapshot()
            .iter()
            .map(|client| client.outbox.dropped())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::outbox::Outbox;

    fn hub_with_clients(n: usize, capacity: usize, policy: OverflowPolicy) -> (BroadcastHub, Vec<Arc<Outbox>>) {
        let registry = Arc::new(ClientRegistry::new());
        let outboxes: Vec<_> = (0..n)
            .map(|_| {
                let outbox = Arc::new(Outbox::new(capacity));
                registry.register(outbox.clone());
                outbox
            })
            .collect();
        (BroadcastHub::new(registry, policy), outboxes)
    }

    fn texts(outbox: &Outbox) -> Vec<String> {
        outbox.drain().iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn test_broadcast_reaches_every_client() {
        let (hub, outboxes) = hub_with_clients(3, 8, OverflowPolicy::DropOldest);
        let report = hub.broadcast("hello");

        assert_eq!(report.delivered, 3);
        for outbox in &outboxes {
            assert_eq!(texts(outbox), vec!["hello"]);
        }
    }

    #[test]
    fn test_broadcast_skips_closed_client() {
        let (hub, outboxes) = hub_with_clients(5, 8, OverflowPolicy::DropOldest);
        outboxes[3].close();

        let report = hub.broadcast("first");
        assert_eq!(report.delivered, 4);
        assert_eq!(report.skipped, 1);

        for (i, outbox) in outboxes.iter().enumerate() {
            if i == 3 {
                assert!(outbox.is_empty());
            } else {
                assert_eq!(texts(outbox), vec!["first"]);
            }
        }

        // The registry is still usable for later broadcasts.
        let report = hub.broadcast("second");
        assert_eq!(report.delivered, 4);
        assert_eq!(hub.registry().len(), 5);
    }

    #[test]
    fn test_successive_broadcasts_keep_order() {
        let (hub, outboxes) = hub_with_clients(2, 16, OverflowPolicy::DropOldest);
        for i in 0..10 {
            hub.broadcast(i.to_string());
        }
        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        for outbox in &outboxes {
            assert_eq!(texts(outbox), expected);
        }
    }

    #[test]
    fn test_overflow_disconnect_removes_client() {
        let (hub, outboxes) = hub_with_clients(2, 2, OverflowPolicy::Disconnect);
        hub.broadcast("a");
        outboxes[1].drain();
        hub.broadcast("b");
        let report = hub.broadcast("c");

        assert_eq!(report.disconnected, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(hub.registry().len(), 1);
        assert!(outboxes[0].is_closed());
    }

    #[test]
    fn test_overflow_drop_oldest_counts_drops() {
        let (hub, outboxes) = hub_with_clients(1, 2, OverflowPolicy::DropOldest);
        hub.broadcast("a");
        hub.broadcast("b");
        let report = hub.broadcast("c");

        assert_eq!(report.dropped, 1);
        assert_eq!(texts(&outboxes[0]), vec!["b", "c"]);
    }

    #[test]
    fn test_connect_queues_register_ack() {
        let (hub, outboxes) = hub_with_clients(1, 8, OverflowPolicy::DropOldest);
        let outbox = Arc::new(Outbox::new(8));

        let id = hub.connect(outbox.clone());

        assert_eq!(id, ClientId::new(2).unwrap());
        assert!(outboxes[0].is_empty());
        assert_eq!(texts(&outbox), vec![r#"{"type":"register","clientid":2}"#]);
    }

    #[test]
    fn test_register_ack_precedes_concurrent_broadcasts() {
        let hub = BroadcastHub::new(Arc::new(ClientRegistry::new()), OverflowPolicy::DropOldest);
        let start = Arc::new(std::sync::Barrier::new(2));

        // Fewer broadcasts than outbox slots, so nothing is ever evicted.
        let flood = {
            let hub = hub.clone();
            let start = start.clone();
            std::thread::spawn(move || {
                start.wait();
                for _ in 0..500 {
                    hub.broadcast(r#"{"type":"telemetry","data":[1,2,3,4],"clientid":0}"#);
                }
            })
        };

        start.wait();
        let clients: Vec<_> = (0..100)
            .map(|_| {
                let outbox = Arc::new(Outbox::new(1024));
                (hub.connect(outbox.clone()), outbox)
            })
            .collect();
        flood.join().unwrap();

        for (id, outbox) in &clients {
            let frames = texts(outbox);
            assert_eq!(frames[0], format!(r#"{{"type":"register","clientid":{id}}}"#));
            assert!(frames[1..].iter().all(|f| f.contains("telemetry")));
        }
    }

    #[test]
    fn test_dropped_frames_sums_all_clients() {
        let (hub, _outboxes) = hub_with_clients(2, 1, OverflowPolicy::DropOldest);
        hub.broadcast("a");
        hub.broadcast("b");
        hub.broadcast("c");
        assert_eq!(hub.dropped_frames(), 4);
    }
}
