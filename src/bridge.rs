//! Inbound bridge: internal bus to MQTT.
//!
//! One queue-group subscription on `channel.>` per instance, so the fleet
//! consumes each bus message exactly once; fanning the message out to every
//! subscribed device, on whatever instance, is the shared emitter's job.
//! Conflating the two produces duplicates or losses.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::eyre;
use futures::StreamExt;
use mqtt_protocol::QoS;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::bus::NatsBus;
use crate::envelope::{RawMessage, PROTOCOL_MQTT};
use crate::store::{Emitter, EmitterFrame};
use crate::topic::{self, ChannelId, Subtopic, SUBJECT_ALL_CHANNELS};

/// Queue group name; fixed per service so every adapter instance joins the
/// same group.
pub const QUEUE_GROUP: &str = "mqtts";

#[derive(Clone)]
pub struct Bridge {
    emitter: Arc<dyn Emitter>,
    /// Backpressure knob: how many bus messages may be in flight at once on
    /// this instance.
    concurrency: Arc<Semaphore>,
    loop_drops: Arc<AtomicU64>,
}

impl Bridge {
    pub fn new(emitter: Arc<dyn Emitter>, concurrency: usize) -> Bridge {
        Bridge {
            emitter,
            concurrency: Arc::new(Semaphore::new(concurrency)),
            loop_drops: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Consume the queue-group subscription until shutdown, then drain
    /// in-flight handlers within `grace`.
    pub async fn run(
        &self,
        bus: &NatsBus,
        token: CancellationToken,
        grace: Duration,
    ) -> crate::Result<()> {
        let mut subscriber = bus.queue_subscribe(SUBJECT_ALL_CHANNELS, QUEUE_GROUP).await?;

        tracing::info!(
            subject = SUBJECT_ALL_CHANNELS,
            queue_group = QUEUE_GROUP,
            "bridge subscribed"
        );

        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                message = subscriber.next() => {
                    let Some(message) = message else {
                        return Err(eyre!("bus subscription closed"));
                    };

                    let Ok(permit) = self.concurrency.clone().acquire_owned().await else {
                        break;
                    };

                    let bridge = self.clone();
                    handlers.spawn(async move {
                        bridge.handle_message(&message.payload).await;
                        drop(permit);
                    });
                }
                Some(res) = handlers.join_next() => {
                    if let Err(e) = res {
                        tracing::error!(?e, "bridge handler panicked");
                    }
                }
            }
        }

        let drained = tokio::time::timeout(grace, async {
            while handlers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!("bridge drain deadline exceeded; aborting handlers");
            handlers.abort_all();
        }

        if let Err(e) = subscriber.unsubscribe().await {
            tracing::debug!(?e, "error unsubscribing from the bus");
        }

        Ok(())
    }

    /// Handle one bus payload: decode, suppress loops, translate, emit.
    pub async fn handle_message(&self, payload: &[u8]) {
        let message = match RawMessage::decode_from(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(?e, "dropping undecodable bus message");
                return;
            }
        };

        // Messages this adapter (or a peer MQTT adapter) produced come back
        // around on the bus; forwarding them again would loop.
        if message.protocol == PROTOCOL_MQTT {
            self.loop_drops.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let channel = match ChannelId::parse(&message.channel) {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(?e, "dropping bus message with an unrenderable channel");
                return;
            }
        };

        let subtopic = match Subtopic::from_dots(&message.subtopic) {
            Ok(subtopic) => subtopic,
            Err(e) => {
                tracing::warn!(?e, "dropping bus message with an unrenderable subtopic");
                return;
            }
        };

        let mqtt_topic = topic::render_topic(&channel, &subtopic);

        let frame = EmitterFrame::new(mqtt_topic, message.payload, QoS::ExactlyOnce, false);

        if let Err(e) = self.emitter.publish(frame).await {
            // Never silently accepted: the delivery is dropped and said so.
            tracing::error!(?e, "dropping delivery: emitter publish failed");
        }
    }

    /// Number of bus messages dropped by loop suppression.
    pub fn loop_drops(&self) -> u64 {
        self.loop_drops.load(Ordering::Relaxed)
    }
}
