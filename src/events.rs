//! Connection lifecycle events shared with the rest of the platform.
//!
//! Every accepted CONNECT and every teardown appends one record to a shared
//! append-only stream; the platform uses it to track device liveness. The
//! stream's auto-assigned entry ids are monotonic, which is all the ordering
//! peers rely on.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use color_eyre::eyre::WrapErr;
use redis::aio::MultiplexedConnection;

use crate::things::ThingId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Connect,
    Disconnect,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::Disconnect => "disconnect",
        }
    }
}

/// One record on the stream. Field order is fixed by the consumers:
/// `thing_id`, `timestamp`, `event_type`, `instance`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnEvent {
    pub thing_id: String,
    /// Seconds since the epoch.
    pub timestamp: u64,
    pub kind: EventKind,
    pub instance: String,
}

/// Sink for connection lifecycle events.
///
/// Append failures are the caller's to log (at WARN); they must never affect
/// the MQTT connection being accepted or closed.
#[async_trait]
pub trait EventStream: Send + Sync + 'static {
    async fn append(&self, event: ConnEvent) -> crate::Result<()>;
}

pub fn conn_event(thing_id: &ThingId, kind: EventKind, instance: &str) -> ConnEvent {
    ConnEvent {
        thing_id: thing_id.as_str().into(),
        timestamp: unix_seconds(),
        kind,
        instance: instance.into(),
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Event stream over a shared Redis stream (`XADD <stream> *`).
pub struct RedisEventStream {
    conn: MultiplexedConnection,
    stream: String,
}

impl RedisEventStream {
    pub async fn connect(
        info: redis::ConnectionInfo,
        stream: String,
    ) -> crate::Result<RedisEventStream> {
        let client = redis::Client::open(info).wrap_err("invalid event stream address")?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .wrap_err("error connecting to the event stream store")?;

        Ok(RedisEventStream { conn, stream })
    }
}

#[async_trait]
impl EventStream for RedisEventStream {
    async fn append(&self, event: ConnEvent) -> crate::Result<()> {
        let mut conn = self.conn.clone();

        let _id: String = redis::cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg("thing_id")
            .arg(&event.thing_id)
            .arg("timestamp")
            .arg(event.timestamp)
            .arg("event_type")
            .arg(event.kind.as_str())
            .arg("instance")
            .arg(&event.instance)
            .query_async(&mut conn)
            .await
            .wrap_err_with(|| format!("error appending to event stream {}", self.stream))?;

        Ok(())
    }
}
