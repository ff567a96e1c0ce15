//! The authorization and bridging hooks the broker core calls on CONNECT,
//! PUBLISH, SUBSCRIBE and teardown.
//!
//! Every device-originated packet re-authorizes against the things service;
//! nothing is cached. An accepted PUBLISH goes out on the internal bus and
//! is *not* fanned out locally: it re-enters through the inbound bridge so
//! every subscriber receives the platform-canonical form.

use std::sync::Arc;

use bytes::Bytes;

use crate::bus::BusPublisher;
use crate::envelope::{RawMessage, PROTOCOL_MQTT};
use crate::events::{conn_event, EventKind, EventStream};
use crate::things::{AuthError, ThingId, ThingsClient};
use crate::topic::{self, TopicError};

/// Why a PUBLISH or SUBSCRIBE was refused. All variants surface to the
/// device as the 3.1.1 "not authorized" behavior; the distinction is for
/// logs and counters.
#[derive(Debug, thiserror::Error)]
pub enum Refusal {
    #[error(transparent)]
    InvalidTopic(#[from] TopicError),
    #[error("not authorized")]
    Unauthorized,
    #[error("authorization unavailable: {0}")]
    Unavailable(String),
}

impl From<AuthError> for Refusal {
    fn from(e: AuthError) -> Refusal {
        match e {
            // An unknown key on the publish path means the thing was removed
            // mid-connection; indistinguishable from plain denial.
            AuthError::Unauthenticated | AuthError::Unauthorized => Refusal::Unauthorized,
            AuthError::Unavailable(reason) => Refusal::Unavailable(reason),
        }
    }
}

pub struct Hooks {
    things: Arc<dyn ThingsClient>,
    bus: Arc<dyn BusPublisher>,
    events: Arc<dyn EventStream>,
    instance: String,
}

impl Hooks {
    pub fn new(
        things: Arc<dyn ThingsClient>,
        bus: Arc<dyn BusPublisher>,
        events: Arc<dyn EventStream>,
        instance: String,
    ) -> Hooks {
        Hooks {
            things,
            bus,
            events,
            instance,
        }
    }

    /// CONNECT: resolve the thing key carried as the MQTT password. The
    /// username is ignored.
    pub async fn authenticate(&self, key: &[u8]) -> Result<ThingId, AuthError> {
        self.things.identify(key).await
    }

    /// PUBLISH: parse the topic, authorize, and bridge the message onto the
    /// internal bus. Success means the envelope is on the bus; the caller
    /// acks per QoS and must not fan the packet out itself.
    pub async fn authorize_publish(
        &self,
        key: &[u8],
        mqtt_topic: &str,
        payload: Bytes,
    ) -> Result<(), Refusal> {
        let (channel, subtopic) = topic::parse_publish_topic(mqtt_topic)?;

        let publisher = self.things.can_access(key, &channel).await?;

        let message = RawMessage {
            channel: channel.as_str().into(),
            subtopic: subtopic.as_dots().into(),
            publisher: publisher.as_str().into(),
            protocol: PROTOCOL_MQTT.into(),
            payload,
        };

        let subject = topic::bus_subject(&channel, &subtopic);

        self.bus
            .publish(subject, message.encode_to_bytes())
            .await
            .map_err(|e| Refusal::Unavailable(format!("bus publish failed: {e}")))?;

        Ok(())
    }

    /// SUBSCRIBE: authorize every filter; one failure refuses the whole
    /// packet.
    pub async fn authorize_subscribe(&self, key: &[u8], filters: &[&str]) -> Result<(), Refusal> {
        for filter in filters {
            let channel = topic::parse_subscribe_filter(filter)?;
            self.things.can_access(key, &channel).await?;
        }

        Ok(())
    }

    /// Post-CONNACK: record the connect event. Event stream failures never
    /// affect the connection.
    pub async fn connected(&self, thing_id: &ThingId) {
        let event = conn_event(thing_id, EventKind::Connect, &self.instance);

        if let Err(e) = self.events.append(event).await {
            tracing::warn!(%thing_id, ?e, "failed to append connect event");
        }
    }

    /// Teardown, clean or not: record the disconnect event.
    pub async fn disconnected(&self, thing_id: &ThingId) {
        let event = conn_event(thing_id, EventKind::Disconnect, &self.instance);

        if let Err(e) = self.events.append(event).await {
            tracing::warn!(%thing_id, ?e, "failed to append disconnect event");
        }
    }
}
