//! Registry of connected clients.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info};

use super::outbox::{Outbox, OverflowPolicy};
use super::types::ClientId;

/// A registered client: its id and the outbox its socket writer drains.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub outbox: Arc<Outbox>,
}

/// Tracks connected clients and hands out their ids.
///
/// New clients get `max(existing ids) + 1`, or `1` when nobody is connected.
/// A freed id below the current maximum is therefore not reused until every
/// higher id has been freed as well.
///
/// The lock is held only to edit the map or copy it; it is never held while
/// delivering to a client.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<ClientId, Client>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ClientId, Client>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection and return its new id.
    pub fn register(&self, outbox: Arc<Outbox>) -> ClientId {
        self.register_with(outbox, |_| None)
    }

    /// Register a connection, queueing `first(id)` into its outbox before the
    /// client becomes visible to broadcasts.
    pub fn register_with(
        &self,
        outbox: Arc<Outbox>,
        first: impl FnOnce(ClientId) -> Option<Arc<str>>,
    ) -> ClientId {
        let mut clients = self.lock();
        let id = clients
            .keys()
            .max()
            .map_or(ClientId::MIN, |max| max.saturating_add(1));
        if let Some(frame) = first(id) {
            outbox.push(frame, OverflowPolicy::DropOldest);
        }
        clients.insert(id, Client { id, outbox });
        info!("Registered client {} ({} connected)", id, clients.len());
        id
    }

    /// Remove a client. Unknown or already removed ids are ignored.
    ///
    /// The removed client's outbox is closed so its writer task stops.
    pub fn unregister(&self, id: ClientId) -> Option<Client> {
        let removed = self.lock().remove(&id);
        match &removed {
            Some(client) => {
                client.outbox.close();
                info!("Unregistered client {}", id);
            }
            None => debug!("Client {} was not registered", id),
        }
        removed
    }

    /// Copy of the current clients, for delivery outside the lock.
    pub fn snapshot(&self) -> Vec<Client> {
        self.lock().values().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: ClientId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn outbox() -> Arc<Outbox> {
        Arc::new(Outbox::new(8))
    }

    fn id(n: u64) -> ClientId {
        ClientId::new(n).unwrap()
    }

    #[test]
    fn test_first_client_gets_one() {
        let registry = ClientRegistry::new();
        assert_eq!(registry.register(outbox()), id(1));
        assert_eq!(registry.register(outbox()), id(2));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_ids_follow_current_maximum() {
        let registry = ClientRegistry::new();
        for _ in 0..3 {
            registry.register(outbox());
        }

        // A hole below the maximum is not refilled.
        registry.unregister(id(2));
        assert_eq!(registry.register(outbox()), id(4));

        // Freeing the top ids lets the counter fall back.
        registry.unregister(id(4));
        registry.unregister(id(3));
        assert_eq!(registry.register(outbox()), id(2));

        registry.unregister(id(1));
        registry.unregister(id(2));
        assert!(registry.is_empty());
        assert_eq!(registry.register(outbox()), id(1));
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = ClientRegistry::new();
        let a = registry.register(outbox());
        let b = registry.register(outbox());

        assert!(registry.unregister(a).is_some());
        assert!(registry.unregister(a).is_none());
        assert!(registry.unregister(id(42)).is_none());

        assert!(!registry.contains(a));
        assert!(registry.contains(b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_with_queues_first_frame() {
        let registry = ClientRegistry::new();
        registry.register(outbox());

        let ob = outbox();
        let id = registry.register_with(ob.clone(), |id| Some(Arc::from(format!("hello {id}"))));

        assert_eq!(id, ClientId::new(2).unwrap());
        let frames: Vec<String> = ob.drain().iter().map(|f| f.to_string()).collect();
        assert_eq!(frames, vec!["hello 2"]);
    }

    #[test]
    fn test_unregister_closes_outbox() {
        let registry = ClientRegistry::new();
        let ob = outbox();
        let a = registry.register(ob.clone());
        registry.unregister(a);
        assert!(ob.is_closed());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let registry = ClientRegistry::new();
        registry.register(outbox());
        registry.register(outbox());

        let snapshot = registry.snapshot();
        registry.unregister(id(1));

        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_registration_yields_dense_unique_ids() {
        let registry = Arc::new(ClientRegistry::new());
        let n = 64;

        let handles: Vec<_> = (0..n)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.register(outbox()))
            })
            .collect();

        let ids: HashSet<u64> = handles
            .into_iter()
            .map(|h| h.join().unwrap().get())
            .collect();

        assert_eq!(ids.len(), n);
        assert_eq!(ids, (1..=n as u64).collect());
    }
}
