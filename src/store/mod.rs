//! Shared broker state: the pluggable persistence/emitter pair the broker
//! core consumes.
//!
//! Both halves are keyed into an external shared store so that a client may
//! reconnect to any adapter instance and a publish handled on one instance
//! reaches subscribers connected to another. Instances never keep an
//! authoritative copy of session state in memory.

use async_trait::async_trait;
use bytes::Bytes;
use mqtt_protocol::QoS;

mod redis;

pub use redis::{RedisEmitter, RedisPersistence, RedisStore};

/// The in-cluster wire form of a broker-side publish: what the emitter
/// broadcasts and what offline queues hold.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EmitterFrame {
    #[prost(string, tag = "1")]
    pub topic: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub payload: Bytes,
    #[prost(uint32, tag = "3")]
    pub qos: u32,
    #[prost(bool, tag = "4")]
    pub retain: bool,
}

impl EmitterFrame {
    pub fn new(topic: String, payload: Bytes, qos: QoS, retain: bool) -> EmitterFrame {
        EmitterFrame {
            topic,
            payload,
            qos: qos as u32,
            retain,
        }
    }

    /// QoS the frame was published with. An out-of-range value from a
    /// mismatched peer degrades to at-most-once rather than killing the
    /// delivery path.
    pub fn qos(&self) -> QoS {
        match self.qos {
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtMostOnce,
        }
    }
}

/// One subscription as the shared store records it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSubscription {
    pub filter: String,
    pub qos: QoS,
}

/// A session that is eligible for offline queueing: persistent, with at
/// least one subscription, and not connected to any instance in the fleet.
#[derive(Debug, Clone)]
pub struct OfflineSession {
    pub client_id: String,
    pub subscriptions: Vec<StoredSubscription>,
}

/// Broker-side session, subscription, retained, will and queue state over
/// the shared store.
///
/// Store failures are recovered at the packet boundary: session operations
/// refuse the packet, delivery operations drop the delivery. Neither is ever
/// silently accepted.
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    /// Record a session for `client_id`. A clean session wipes whatever the
    /// store held for that client first.
    async fn save_session(&self, client_id: &str, clean_session: bool) -> crate::Result<()>;

    /// Remove everything the store holds for `client_id`.
    async fn drop_session(&self, client_id: &str) -> crate::Result<()>;

    /// Mark `client_id` as connected to `instance`, returning the instance
    /// that previously held it if this is a takeover.
    async fn claim_presence(
        &self,
        client_id: &str,
        instance: &str,
    ) -> crate::Result<Option<String>>;

    /// Clear the presence mark, but only if `instance` still holds it.
    async fn release_presence(&self, client_id: &str, instance: &str) -> crate::Result<()>;

    async fn store_subscriptions(
        &self,
        client_id: &str,
        subscriptions: &[StoredSubscription],
    ) -> crate::Result<()>;

    async fn remove_subscriptions(&self, client_id: &str, filters: &[String])
        -> crate::Result<()>;

    async fn subscriptions(&self, client_id: &str) -> crate::Result<Vec<StoredSubscription>>;

    /// Sessions eligible for offline queueing (see [`OfflineSession`]).
    async fn offline_sessions(&self) -> crate::Result<Vec<OfflineSession>>;

    /// Store or, with an empty payload, clear the retained message for a
    /// topic (3.3.1.3: a zero-byte retained payload clears it).
    async fn store_retained(&self, frame: &EmitterFrame) -> crate::Result<()>;

    /// Every retained frame. Matching against a new subscription's filters
    /// happens broker-side.
    async fn retained(&self) -> crate::Result<Vec<EmitterFrame>>;

    async fn store_will(&self, client_id: &str, will: &EmitterFrame) -> crate::Result<()>;

    /// Remove and return the stored will, if any.
    async fn take_will(&self, client_id: &str) -> crate::Result<Option<EmitterFrame>>;

    /// Append a frame to a disconnected session's queue.
    async fn enqueue(&self, client_id: &str, frame: &EmitterFrame) -> crate::Result<()>;

    /// Remove and return everything queued for `client_id`, oldest first.
    async fn drain_queue(&self, client_id: &str) -> crate::Result<Vec<EmitterFrame>>;
}

/// Topic-based in-cluster publish/subscribe.
///
/// After `publish` returns, every connection in the fleet whose session has
/// a matching subscription is eligible for delivery according to its QoS and
/// clean-session state; sessions that are offline but persistent get the
/// frame queued instead.
#[async_trait]
pub trait Emitter: Send + Sync + 'static {
    async fn publish(&self, frame: EmitterFrame) -> crate::Result<()>;
}
