//! Local half of the emitter: the registry of connections on this instance
//! and their subscriptions.
//!
//! The shared store owns the authoritative subscription state; this registry
//! only mirrors the subscriptions of clients currently connected here so an
//! emitter broadcast can be turned into per-connection deliveries without a
//! store round trip per message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use mqtt_protocol::QoS;
use tokio::sync::mpsc;

use crate::broker::filter::topic_matches;
use crate::store::{EmitterFrame, StoredSubscription};

/// An outbound publish on its way to one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Bytes,
    /// Effective QoS: the lower of the publish QoS and the subscription QoS
    /// (3.8.4).
    pub qos: QoS,
    pub retain: bool,
}

/// Identifies one registration so a replaced connection cannot evict its
/// replacement on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationId(u64);

struct ClientEntry {
    registration: RegistrationId,
    subscriptions: Vec<StoredSubscription>,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Clone, Default)]
pub struct Fanout {
    clients: Arc<Mutex<HashMap<String, ClientEntry>>>,
    next_registration: Arc<AtomicU64>,
}

pub type DeliveryReceiver = mpsc::UnboundedReceiver<Delivery>;

impl Fanout {
    /// Register a connection for `client_id`, seeding it with the
    /// subscriptions its resumed session already holds.
    ///
    /// Registering over an existing entry drops the old sender, which closes
    /// the replaced connection's delivery channel; that connection treats
    /// the closed channel as a session takeover and shuts down.
    pub fn register(
        &self,
        client_id: &str,
        subscriptions: Vec<StoredSubscription>,
    ) -> (RegistrationId, DeliveryReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registration = RegistrationId(self.next_registration.fetch_add(1, Ordering::Relaxed));

        let mut clients = self.clients.lock().expect("fanout mutex poisoned");
        clients.insert(
            client_id.into(),
            ClientEntry {
                registration,
                subscriptions,
                tx,
            },
        );

        (registration, rx)
    }

    /// Remove `client_id`, but only if `registration` still owns the entry.
    pub fn deregister(&self, client_id: &str, registration: RegistrationId) {
        let mut clients = self.clients.lock().expect("fanout mutex poisoned");

        if let Some(entry) = clients.get(client_id) {
            if entry.registration == registration {
                clients.remove(client_id);
            }
        }
    }

    pub fn subscribe(&self, client_id: &str, subscriptions: &[StoredSubscription]) {
        let mut clients = self.clients.lock().expect("fanout mutex poisoned");

        let Some(entry) = clients.get_mut(client_id) else {
            return;
        };

        for sub in subscriptions {
            match entry
                .subscriptions
                .iter_mut()
                .find(|existing| existing.filter == sub.filter)
            {
                Some(existing) => existing.qos = sub.qos,
                None => entry.subscriptions.push(sub.clone()),
            }
        }
    }

    pub fn unsubscribe(&self, client_id: &str, filters: &[String]) {
        let mut clients = self.clients.lock().expect("fanout mutex poisoned");

        if let Some(entry) = clients.get_mut(client_id) {
            entry
                .subscriptions
                .retain(|sub| !filters.contains(&sub.filter));
        }
    }

    /// Hand a broadcast frame to every locally connected subscriber.
    pub fn deliver(&self, frame: &EmitterFrame) {
        let clients = self.clients.lock().expect("fanout mutex poisoned");

        for entry in clients.values() {
            // The strongest matching subscription wins (3.3.5).
            let granted = entry
                .subscriptions
                .iter()
                .filter(|sub| topic_matches(&sub.filter, &frame.topic))
                .map(|sub| sub.qos)
                .max();

            let Some(granted) = granted else { continue };

            // The receiver only disappears mid-teardown; the frame is then
            // someone else's to queue.
            let _ = entry.tx.send(Delivery {
                topic: frame.topic.clone(),
                payload: frame.payload.clone(),
                qos: frame.qos().min(granted),
                retain: frame.retain,
            });
        }
    }
}
