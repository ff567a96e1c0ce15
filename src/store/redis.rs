//! Redis-backed persistence and emitter.
//!
//! Layout, all under one prefix so an operator can inspect the broker state
//! with `SCAN mqtt:*`:
//!
//! - `mqtt:clients`        set of client ids with a stored session
//! - `mqtt:session:<id>`   hash, `clean_session` flag
//! - `mqtt:subs:<id>`      hash, filter -> QoS
//! - `mqtt:retained`       hash, topic -> frame bytes
//! - `mqtt:will:<id>`      frame bytes
//! - `mqtt:queue:<id>`     list of frame bytes, oldest first
//! - `mqtt:conn:<id>`      id of the instance holding the live connection
//!
//! The emitter broadcasts frames on the `mqtt:emitter` pub/sub channel;
//! every instance (the publishing one included) receives the frame and
//! delivers it to its locally connected subscribers.

use std::collections::HashMap;

use async_trait::async_trait;
use color_eyre::eyre::WrapErr;
use futures::StreamExt;
use mqtt_protocol::QoS;
use prost::Message;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;

use crate::broker::fanout::Fanout;
use crate::broker::filter::topic_matches;
use crate::store::{Emitter, EmitterFrame, OfflineSession, Persistence, StoredSubscription};

const EMITTER_CHANNEL: &str = "mqtt:emitter";

const CLIENTS_KEY: &str = "mqtt:clients";
const RETAINED_KEY: &str = "mqtt:retained";

fn session_key(client_id: &str) -> String {
    format!("mqtt:session:{client_id}")
}

fn subs_key(client_id: &str) -> String {
    format!("mqtt:subs:{client_id}")
}

fn will_key(client_id: &str) -> String {
    format!("mqtt:will:{client_id}")
}

fn queue_key(client_id: &str) -> String {
    format!("mqtt:queue:{client_id}")
}

fn conn_key(client_id: &str) -> String {
    format!("mqtt:conn:{client_id}")
}

/// Shared handle to the broker's Redis instance; hands out the persistence
/// and emitter halves.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(info: redis::ConnectionInfo) -> crate::Result<RedisStore> {
        let client = redis::Client::open(info).wrap_err("invalid broker store address")?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .wrap_err("error connecting to the broker store")?;

        Ok(RedisStore { client, conn })
    }

    pub fn persistence(&self) -> RedisPersistence {
        RedisPersistence {
            conn: self.conn.clone(),
        }
    }

    pub fn emitter(&self) -> RedisEmitter {
        RedisEmitter {
            conn: self.conn.clone(),
            persistence: self.persistence(),
        }
    }

    /// Receive emitter broadcasts and deliver them to locally connected
    /// clients. Runs until the token is cancelled.
    pub async fn run_emitter_loop(
        &self,
        fanout: Fanout,
        token: CancellationToken,
    ) -> crate::Result<()> {
        // Pub/sub needs its own connection; the multiplexed one cannot enter
        // subscriber mode.
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .wrap_err("error opening the emitter subscription connection")?;

        pubsub
            .subscribe(EMITTER_CHANNEL)
            .await
            .wrap_err("error subscribing to the emitter channel")?;

        let mut messages = pubsub.on_message();

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                msg = messages.next() => {
                    let Some(msg) = msg else {
                        // The connection dropped; the store is the single
                        // source of truth, so running blind is not an option.
                        return Err(color_eyre::eyre::eyre!(
                            "emitter subscription connection closed"
                        ));
                    };

                    match EmitterFrame::decode(msg.get_payload_bytes()) {
                        Ok(frame) => fanout.deliver(&frame),
                        Err(e) => {
                            tracing::warn!(?e, "dropping undecodable emitter frame");
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

#[derive(Clone)]
pub struct RedisPersistence {
    conn: MultiplexedConnection,
}

#[async_trait]
impl Persistence for RedisPersistence {
    async fn save_session(&self, client_id: &str, clean_session: bool) -> crate::Result<()> {
        let mut conn = self.conn.clone();

        if clean_session {
            // 3.1.2.4: a clean session starts from nothing.
            let _: () = redis::pipe()
                .atomic()
                .del(subs_key(client_id))
                .del(queue_key(client_id))
                .del(will_key(client_id))
                .query_async(&mut conn)
                .await?;
        }

        let _: () = redis::pipe()
            .atomic()
            .hset(session_key(client_id), "clean_session", clean_session as u8)
            .sadd(CLIENTS_KEY, client_id)
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn drop_session(&self, client_id: &str) -> crate::Result<()> {
        let mut conn = self.conn.clone();

        let _: () = redis::pipe()
            .atomic()
            .del(session_key(client_id))
            .del(subs_key(client_id))
            .del(queue_key(client_id))
            .del(will_key(client_id))
            .srem(CLIENTS_KEY, client_id)
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn claim_presence(
        &self,
        client_id: &str,
        instance: &str,
    ) -> crate::Result<Option<String>> {
        let mut conn = self.conn.clone();

        let previous: Option<String> = conn.getset(conn_key(client_id), instance).await?;

        Ok(previous.filter(|prev| prev != instance))
    }

    async fn release_presence(&self, client_id: &str, instance: &str) -> crate::Result<()> {
        let mut conn = self.conn.clone();

        // Check-then-delete is racy against a takeover, but the takeover
        // rewrites the key before the old connection releases it, so the
        // window only ever deletes this instance's own stale claim.
        let holder: Option<String> = conn.get(conn_key(client_id)).await?;
        if holder.as_deref() == Some(instance) {
            let _: () = conn.del(conn_key(client_id)).await?;
        }

        Ok(())
    }

    async fn store_subscriptions(
        &self,
        client_id: &str,
        subscriptions: &[StoredSubscription],
    ) -> crate::Result<()> {
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic();
        for sub in subscriptions {
            pipe.hset(subs_key(client_id), &sub.filter, sub.qos as u8);
        }

        let _: () = pipe.query_async(&mut conn).await?;

        Ok(())
    }

    async fn remove_subscriptions(
        &self,
        client_id: &str,
        filters: &[String],
    ) -> crate::Result<()> {
        let mut conn = self.conn.clone();

        let _: () = conn.hdel(subs_key(client_id), filters).await?;

        Ok(())
    }

    async fn subscriptions(&self, client_id: &str) -> crate::Result<Vec<StoredSubscription>> {
        let mut conn = self.conn.clone();

        let raw: HashMap<String, u8> = conn.hgetall(subs_key(client_id)).await?;

        Ok(raw
            .into_iter()
            .map(|(filter, qos)| StoredSubscription {
                filter,
                qos: stored_qos(qos),
            })
            .collect())
    }

    async fn offline_sessions(&self) -> crate::Result<Vec<OfflineSession>> {
        let mut conn = self.conn.clone();

        let client_ids: Vec<String> = conn.smembers(CLIENTS_KEY).await?;

        let mut sessions = Vec::new();

        for client_id in client_ids {
            let present: Option<String> = conn.get(conn_key(&client_id)).await?;
            if present.is_some() {
                continue;
            }

            let clean: Option<u8> = conn.hget(session_key(&client_id), "clean_session").await?;
            if clean != Some(0) {
                continue;
            }

            let raw: HashMap<String, u8> = conn.hgetall(subs_key(&client_id)).await?;
            if raw.is_empty() {
                continue;
            }

            sessions.push(OfflineSession {
                client_id,
                subscriptions: raw
                    .into_iter()
                    .map(|(filter, qos)| StoredSubscription {
                        filter,
                        qos: stored_qos(qos),
                    })
                    .collect(),
            });
        }

        Ok(sessions)
    }

    async fn store_retained(&self, frame: &EmitterFrame) -> crate::Result<()> {
        let mut conn = self.conn.clone();

        if frame.payload.is_empty() {
            let _: () = conn.hdel(RETAINED_KEY, &frame.topic).await?;
        } else {
            let _: () = conn
                .hset(RETAINED_KEY, &frame.topic, frame.encode_to_vec())
                .await?;
        }

        Ok(())
    }

    async fn retained(&self) -> crate::Result<Vec<EmitterFrame>> {
        let mut conn = self.conn.clone();

        let raw: HashMap<String, Vec<u8>> = conn.hgetall(RETAINED_KEY).await?;

        Ok(raw
            .into_iter()
            .filter_map(|(topic, bytes)| match EmitterFrame::decode(&bytes[..]) {
                Ok(frame) => Some(frame),
                Err(e) => {
                    tracing::warn!(topic, ?e, "skipping undecodable retained frame");
                    None
                }
            })
            .collect())
    }

    async fn store_will(&self, client_id: &str, will: &EmitterFrame) -> crate::Result<()> {
        let mut conn = self.conn.clone();

        let _: () = conn.set(will_key(client_id), will.encode_to_vec()).await?;

        Ok(())
    }

    async fn take_will(&self, client_id: &str) -> crate::Result<Option<EmitterFrame>> {
        let mut conn = self.conn.clone();

        let (bytes, _): (Option<Vec<u8>>, i64) = redis::pipe()
            .atomic()
            .get(will_key(client_id))
            .del(will_key(client_id))
            .query_async(&mut conn)
            .await?;

        let Some(bytes) = bytes else {
            return Ok(None);
        };

        Ok(Some(EmitterFrame::decode(&bytes[..]).wrap_err(
            "undecodable will frame in the broker store",
        )?))
    }

    async fn enqueue(&self, client_id: &str, frame: &EmitterFrame) -> crate::Result<()> {
        let mut conn = self.conn.clone();

        let _: () = conn
            .rpush(queue_key(client_id), frame.encode_to_vec())
            .await?;

        Ok(())
    }

    async fn drain_queue(&self, client_id: &str) -> crate::Result<Vec<EmitterFrame>> {
        let mut conn = self.conn.clone();

        let (frames, _): (Vec<Vec<u8>>, i64) = redis::pipe()
            .atomic()
            .lrange(queue_key(client_id), 0, -1)
            .del(queue_key(client_id))
            .query_async(&mut conn)
            .await?;

        Ok(frames
            .into_iter()
            .filter_map(|bytes| match EmitterFrame::decode(&bytes[..]) {
                Ok(frame) => Some(frame),
                Err(e) => {
                    tracing::warn!(client_id, ?e, "skipping undecodable queued frame");
                    None
                }
            })
            .collect())
    }
}

fn stored_qos(qos: u8) -> QoS {
    match qos {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

pub struct RedisEmitter {
    conn: MultiplexedConnection,
    persistence: RedisPersistence,
}

#[async_trait]
impl Emitter for RedisEmitter {
    async fn publish(&self, frame: EmitterFrame) -> crate::Result<()> {
        let mut conn = self.conn.clone();

        let _: () = conn
            .publish(EMITTER_CHANNEL, frame.encode_to_vec())
            .await
            .wrap_err("error broadcasting emitter frame")?;

        // Offline persistent sessions get the frame queued instead. Done
        // here, once, by the publishing instance; duplicating it per
        // receiver would duplicate the queue entries.
        if frame.qos() != QoS::AtMostOnce {
            for session in self.persistence.offline_sessions().await? {
                let matched = session
                    .subscriptions
                    .iter()
                    .any(|sub| topic_matches(&sub.filter, &frame.topic));

                if matched {
                    self.persistence.enqueue(&session.client_id, &frame).await?;
                }
            }
        }

        Ok(())
    }
}
