//! In-memory doubles for the external collaborators, shared by the
//! integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use color_eyre::eyre;
use mqtt_protocol::v4::V4;
use mqtt_protocol::{Packet, QoS};

use mqtt_adapter::broker::fanout::Fanout;
use mqtt_adapter::broker::MqttSocket;
use mqtt_adapter::bus::BusPublisher;
use mqtt_adapter::events::{ConnEvent, EventStream};
use mqtt_adapter::store::{
    Emitter, EmitterFrame, OfflineSession, Persistence, StoredSubscription,
};
use mqtt_adapter::things::{AuthError, ThingId, ThingsClient};
use mqtt_adapter::topic::ChannelId;

/// Things service double: a key table, a connection table, and a call log.
#[derive(Default)]
pub struct FakeThings {
    keys: Mutex<HashMap<Vec<u8>, String>>,
    connected: Mutex<HashSet<(Vec<u8>, String)>>,
    /// `(key, channel)` pairs `can_access` was called with.
    pub can_access_calls: Mutex<Vec<(Vec<u8>, String)>>,
    /// When set, every call fails as if the service were unreachable.
    pub unavailable: Mutex<bool>,
}

impl FakeThings {
    pub fn with_thing(self, key: &[u8], thing_id: &str) -> Self {
        self.keys
            .lock()
            .unwrap()
            .insert(key.to_vec(), thing_id.to_string());
        self
    }

    pub fn with_connection(self, key: &[u8], channel: &str) -> Self {
        self.connected
            .lock()
            .unwrap()
            .insert((key.to_vec(), channel.to_string()));
        self
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap() = unavailable;
    }

    pub fn calls(&self) -> Vec<(Vec<u8>, String)> {
        self.can_access_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ThingsClient for FakeThings {
    async fn identify(&self, key: &[u8]) -> Result<ThingId, AuthError> {
        if *self.unavailable.lock().unwrap() {
            return Err(AuthError::Unavailable("fake outage".into()));
        }

        self.keys
            .lock()
            .unwrap()
            .get(key)
            .map(ThingId::new)
            .ok_or(AuthError::Unauthenticated)
    }

    async fn can_access(&self, key: &[u8], channel: &ChannelId) -> Result<ThingId, AuthError> {
        self.can_access_calls
            .lock()
            .unwrap()
            .push((key.to_vec(), channel.as_str().to_string()));

        if *self.unavailable.lock().unwrap() {
            return Err(AuthError::Unavailable("fake outage".into()));
        }

        let connected = self
            .connected
            .lock()
            .unwrap()
            .contains(&(key.to_vec(), channel.as_str().to_string()));

        if !connected {
            return Err(AuthError::Unauthorized);
        }

        self.keys
            .lock()
            .unwrap()
            .get(key)
            .map(ThingId::new)
            .ok_or(AuthError::Unauthenticated)
    }
}

/// Bus double recording every publish.
#[derive(Default)]
pub struct FakeBus {
    pub published: Mutex<Vec<(String, Bytes)>>,
}

impl FakeBus {
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl BusPublisher for FakeBus {
    async fn publish(&self, subject: String, payload: Bytes) -> mqtt_adapter::Result<()> {
        self.published.lock().unwrap().push((subject, payload));
        Ok(())
    }
}

/// Event stream double; optionally failing to prove failures stay contained.
#[derive(Default)]
pub struct FakeEvents {
    pub appended: Mutex<Vec<ConnEvent>>,
    pub failing: bool,
}

impl FakeEvents {
    pub fn failing() -> Self {
        FakeEvents {
            appended: Mutex::new(Vec::new()),
            failing: true,
        }
    }

    pub fn appended(&self) -> Vec<ConnEvent> {
        self.appended.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventStream for FakeEvents {
    async fn append(&self, event: ConnEvent) -> mqtt_adapter::Result<()> {
        if self.failing {
            return Err(color_eyre::eyre::eyre!("fake event stream failure"));
        }

        self.appended.lock().unwrap().push(event);
        Ok(())
    }
}

/// Emitter double recording every frame.
#[derive(Default)]
pub struct FakeEmitter {
    pub frames: Mutex<Vec<EmitterFrame>>,
}

impl FakeEmitter {
    pub fn frames(&self) -> Vec<EmitterFrame> {
        self.frames.lock().unwrap().clone()
    }
}

#[async_trait]
impl Emitter for FakeEmitter {
    async fn publish(&self, frame: EmitterFrame) -> mqtt_adapter::Result<()> {
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }
}

/// Emitter wired straight into a local fanout, standing in for the
/// broadcast-and-deliver path of the real cluster emitter.
pub struct FanoutEmitter {
    pub fanout: Fanout,
}

#[async_trait]
impl Emitter for FanoutEmitter {
    async fn publish(&self, frame: EmitterFrame) -> mqtt_adapter::Result<()> {
        self.fanout.deliver(&frame);
        Ok(())
    }
}

/// Shared-store double: everything the broker persists, in process memory.
#[derive(Default)]
pub struct FakePersistence {
    /// client id -> clean-session flag
    pub sessions: Mutex<HashMap<String, bool>>,
    /// client id -> holding instance
    pub presence: Mutex<HashMap<String, String>>,
    pub subscriptions: Mutex<HashMap<String, Vec<StoredSubscription>>>,
    /// topic -> frame
    pub retained: Mutex<HashMap<String, EmitterFrame>>,
    pub wills: Mutex<HashMap<String, EmitterFrame>>,
    pub queues: Mutex<HashMap<String, Vec<EmitterFrame>>>,
    /// client ids whose sessions were dropped
    pub dropped: Mutex<Vec<String>>,
}

impl FakePersistence {
    pub fn with_session(self, client_id: &str, clean_session: bool) -> Self {
        self.sessions
            .lock()
            .unwrap()
            .insert(client_id.into(), clean_session);
        self
    }

    pub fn with_subscription(self, client_id: &str, filter: &str, qos: QoS) -> Self {
        self.subscriptions
            .lock()
            .unwrap()
            .entry(client_id.into())
            .or_default()
            .push(StoredSubscription {
                filter: filter.into(),
                qos,
            });
        self
    }

    pub fn with_queued(self, client_id: &str, frame: EmitterFrame) -> Self {
        self.queues
            .lock()
            .unwrap()
            .entry(client_id.into())
            .or_default()
            .push(frame);
        self
    }
}

#[async_trait]
impl Persistence for FakePersistence {
    async fn save_session(&self, client_id: &str, clean_session: bool) -> mqtt_adapter::Result<()> {
        if clean_session {
            self.subscriptions.lock().unwrap().remove(client_id);
            self.queues.lock().unwrap().remove(client_id);
            self.wills.lock().unwrap().remove(client_id);
        }

        self.sessions
            .lock()
            .unwrap()
            .insert(client_id.into(), clean_session);
        Ok(())
    }

    async fn drop_session(&self, client_id: &str) -> mqtt_adapter::Result<()> {
        self.sessions.lock().unwrap().remove(client_id);
        self.subscriptions.lock().unwrap().remove(client_id);
        self.queues.lock().unwrap().remove(client_id);
        self.wills.lock().unwrap().remove(client_id);
        self.dropped.lock().unwrap().push(client_id.into());
        Ok(())
    }

    async fn claim_presence(
        &self,
        client_id: &str,
        instance: &str,
    ) -> mqtt_adapter::Result<Option<String>> {
        let previous = self
            .presence
            .lock()
            .unwrap()
            .insert(client_id.into(), instance.into());

        Ok(previous.filter(|prev| prev != instance))
    }

    async fn release_presence(&self, client_id: &str, instance: &str) -> mqtt_adapter::Result<()> {
        let mut presence = self.presence.lock().unwrap();
        if presence.get(client_id).map(String::as_str) == Some(instance) {
            presence.remove(client_id);
        }
        Ok(())
    }

    async fn store_subscriptions(
        &self,
        client_id: &str,
        subscriptions: &[StoredSubscription],
    ) -> mqtt_adapter::Result<()> {
        let mut all = self.subscriptions.lock().unwrap();
        let entry = all.entry(client_id.into()).or_default();

        for sub in subscriptions {
            match entry.iter_mut().find(|existing| existing.filter == sub.filter) {
                Some(existing) => existing.qos = sub.qos,
                None => entry.push(sub.clone()),
            }
        }
        Ok(())
    }

    async fn remove_subscriptions(
        &self,
        client_id: &str,
        filters: &[String],
    ) -> mqtt_adapter::Result<()> {
        if let Some(entry) = self.subscriptions.lock().unwrap().get_mut(client_id) {
            entry.retain(|sub| !filters.contains(&sub.filter));
        }
        Ok(())
    }

    async fn subscriptions(
        &self,
        client_id: &str,
    ) -> mqtt_adapter::Result<Vec<StoredSubscription>> {
        Ok(self
            .subscriptions
            .lock()
            .unwrap()
            .get(client_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn offline_sessions(&self) -> mqtt_adapter::Result<Vec<OfflineSession>> {
        let sessions = self.sessions.lock().unwrap();
        let presence = self.presence.lock().unwrap();
        let subscriptions = self.subscriptions.lock().unwrap();

        Ok(sessions
            .iter()
            .filter(|(client_id, clean)| !**clean && !presence.contains_key(*client_id))
            .filter_map(|(client_id, _)| {
                let subs = subscriptions.get(client_id)?;
                (!subs.is_empty()).then(|| OfflineSession {
                    client_id: client_id.clone(),
                    subscriptions: subs.clone(),
                })
            })
            .collect())
    }

    async fn store_retained(&self, frame: &EmitterFrame) -> mqtt_adapter::Result<()> {
        let mut retained = self.retained.lock().unwrap();
        if frame.payload.is_empty() {
            retained.remove(&frame.topic);
        } else {
            retained.insert(frame.topic.clone(), frame.clone());
        }
        Ok(())
    }

    async fn retained(&self) -> mqtt_adapter::Result<Vec<EmitterFrame>> {
        Ok(self.retained.lock().unwrap().values().cloned().collect())
    }

    async fn store_will(&self, client_id: &str, will: &EmitterFrame) -> mqtt_adapter::Result<()> {
        self.wills
            .lock()
            .unwrap()
            .insert(client_id.into(), will.clone());
        Ok(())
    }

    async fn take_will(&self, client_id: &str) -> mqtt_adapter::Result<Option<EmitterFrame>> {
        Ok(self.wills.lock().unwrap().remove(client_id))
    }

    async fn enqueue(&self, client_id: &str, frame: &EmitterFrame) -> mqtt_adapter::Result<()> {
        self.queues
            .lock()
            .unwrap()
            .entry(client_id.into())
            .or_default()
            .push(frame.clone());
        Ok(())
    }

    async fn drain_queue(&self, client_id: &str) -> mqtt_adapter::Result<Vec<EmitterFrame>> {
        Ok(self
            .queues
            .lock()
            .unwrap()
            .remove(client_id)
            .unwrap_or_default())
    }
}

/// Transport double that plays a fixed sequence of client packets and
/// records everything the broker writes back.
pub struct ScriptedSocket {
    incoming: Vec<u8>,
    served: bool,
    /// Keep the connection open (reads hang) after the script instead of
    /// signalling a peer hangup.
    hold_open: bool,
    written: Arc<Mutex<Vec<u8>>>,
}

impl ScriptedSocket {
    /// Play `packets`, then hang up.
    pub fn closing(packets: Vec<Packet>) -> (ScriptedSocket, Arc<Mutex<Vec<u8>>>) {
        Self::new(packets, false)
    }

    /// Play `packets`, then stay connected with nothing more to say.
    pub fn holding(packets: Vec<Packet>) -> (ScriptedSocket, Arc<Mutex<Vec<u8>>>) {
        Self::new(packets, true)
    }

    fn new(packets: Vec<Packet>, hold_open: bool) -> (ScriptedSocket, Arc<Mutex<Vec<u8>>>) {
        let mut incoming = Vec::new();
        for packet in packets {
            V4.write(packet, &mut incoming).unwrap();
        }

        let written = Arc::new(Mutex::new(Vec::new()));

        (
            ScriptedSocket {
                incoming,
                served: false,
                hold_open,
                written: written.clone(),
            },
            written,
        )
    }
}

impl MqttSocket for ScriptedSocket {
    fn remote_addr(&self) -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    async fn read(&mut self, buf: &mut BytesMut) -> eyre::Result<usize> {
        if !self.served {
            self.served = true;
            buf.extend_from_slice(&self.incoming);
            return Ok(self.incoming.len());
        }

        if self.hold_open {
            std::future::pending::<()>().await;
        }

        Ok(0)
    }

    async fn write_all(&mut self, buf: &mut Vec<u8>) -> eyre::Result<()> {
        self.written.lock().unwrap().extend_from_slice(buf);
        buf.clear();
        Ok(())
    }

    async fn shutdown(&mut self) -> eyre::Result<()> {
        Ok(())
    }
}

/// Decode every packet the broker wrote to a [`ScriptedSocket`].
pub fn decode_packets(bytes: &[u8]) -> Vec<Packet> {
    let mut buf = BytesMut::from(bytes);
    let mut packets = Vec::new();

    loop {
        match V4.read_mut(&mut buf, usize::MAX) {
            Ok(packet) => packets.push(packet),
            Err(mqtt_protocol::Error::InsufficientBytes(_)) if buf.is_empty() => break,
            Err(e) => panic!("truncated or invalid broker output: {e}"),
        }
    }

    packets
}
