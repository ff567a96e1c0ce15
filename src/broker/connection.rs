use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use color_eyre::eyre;
use mqtt_protocol::v4::V4;
use mqtt_protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS,
    SubAck, Subscribe, SubscribeReasonCode, UnsubAck, Unsubscribe,
};
use tokio_util::sync::CancellationToken;

use crate::broker::fanout::{Delivery, DeliveryReceiver, RegistrationId};
use crate::broker::keep_alive::KeepAlive;
use crate::broker::{ConnectionData, ConnectionId, MqttSocket, Shared};
use crate::store::{EmitterFrame, StoredSubscription};
use crate::things::{AuthError, ThingId};

// The MQTT spec imposes a maximum topic length of 64 KiB but implementations
// can impose a smaller limit.
const TOPIC_MAX_LENGTH: usize = 1024;

/// Upper bound on a single inbound packet; larger frames kill the
/// connection before they are buffered.
const MAX_PACKET_SIZE: usize = 1024 * 1024;

pub struct Connection<S> {
    id: ConnectionId,
    remote_addr: SocketAddr,

    socket: S,
    protocol: V4,
    read_buf: BytesMut,
    write_buf: Vec<u8>,

    token: CancellationToken,
    shared: Arc<Shared>,

    // State below here exists only after a CONNECT was accepted.
    client_id: Option<String>,
    thing_id: Option<ThingId>,
    /// The thing key; wiped on teardown.
    password: Bytes,
    clean_session: bool,
    keep_alive: KeepAlive,
    registration: Option<RegistrationId>,

    /// The client sent a DISCONNECT; the will is discarded.
    graceful: bool,

    /// QoS 2 publishes received but not yet released (duplicate
    /// suppression, 4.3.3).
    incoming_qos2: HashSet<u16>,

    /// Packet ids of outbound QoS 1/2 publishes awaiting their final ack.
    outbound_pending: HashSet<u16>,
    next_pkid: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] mqtt_protocol::Error),
    #[error("closing connection: {0}")]
    Close(String),
    #[error("transport error: {0}")]
    Transport(eyre::Error),
    #[error("session taken over by a newer connection")]
    TakenOver,
    #[error("keep-alive expired")]
    KeepAliveExpired,
}

enum Flow {
    Continue,
    Disconnect,
}

macro_rules! close (
    ($($message:tt)*) => {
        return Err(ConnectionError::Close(format!($($message)*)))
    };
);

impl<S: MqttSocket> Connection<S> {
    pub fn new(
        id: ConnectionId,
        socket: S,
        token: CancellationToken,
        shared: Arc<Shared>,
    ) -> Self {
        Connection {
            id,
            remote_addr: socket.remote_addr(),
            socket,
            protocol: V4,
            read_buf: BytesMut::with_capacity(8192),
            write_buf: Vec::with_capacity(8192),
            token,
            shared,
            client_id: None,
            thing_id: None,
            password: Bytes::new(),
            clean_session: true,
            keep_alive: KeepAlive::default(),
            registration: None,
            graceful: false,
            incoming_qos2: HashSet::new(),
            outbound_pending: HashSet::new(),
            next_pkid: 1,
        }
    }

    #[tracing::instrument(name = "Connection::run", skip_all, fields(remote_addr = %self.remote_addr))]
    pub async fn run(mut self) -> ConnectionData {
        let result = self.run_inner().await;

        let taken_over = match result {
            Ok(()) => false,
            Err(ConnectionError::TakenOver) => {
                tracing::info!("connection replaced by a newer session");
                true
            }
            Err(ConnectionError::KeepAliveExpired) => {
                tracing::debug!("closing connection: keep-alive expired");
                false
            }
            Err(e) => {
                tracing::debug!("closing connection: {e}");
                false
            }
        };

        self.teardown(taken_over).await;

        let _ = self.socket.shutdown().await;

        ConnectionData {
            id: self.id,
            client_id: self.client_id.take(),
        }
    }

    async fn run_inner(&mut self) -> Result<(), ConnectionError> {
        let Some(packet) = self.recv().await? else {
            return Ok(());
        };

        // Anything other than CONNECT before the handshake closes the
        // socket with no response (MQTT-3.1.0-1).
        let Packet::Connect(connect) = packet else {
            close!("expected CONNECT, got {packet:?}");
        };

        let Some(mut deliveries) = self.handle_connect(connect).await? else {
            // Refused; the CONNACK already went out.
            return Ok(());
        };

        self.run_session(&mut deliveries).await
    }

    #[tracing::instrument(skip_all, fields(client_id = self.client_id.as_deref().unwrap_or("")))]
    async fn run_session(
        &mut self,
        deliveries: &mut DeliveryReceiver,
    ) -> Result<(), ConnectionError> {
        loop {
            tokio::select! {
                res = self.recv_timed() => {
                    match res? {
                        Some(packet) => {
                            if let Flow::Disconnect = self.handle_packet(packet).await? {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                delivery = deliveries.recv() => {
                    match delivery {
                        Some(delivery) => self.deliver(delivery).await?,
                        // The fanout entry was replaced from under us.
                        None => return Err(ConnectionError::TakenOver),
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle the CONNECT handshake. `Ok(None)` means the connection was
    /// refused and a CONNACK with the reason already went out.
    async fn handle_connect(
        &mut self,
        connect: Connect,
    ) -> Result<Option<DeliveryReceiver>, ConnectionError> {
        tracing::trace!(?connect.client_id, "received CONNECT");

        // The thing key rides in the password; a CONNECT without one cannot
        // possibly authenticate.
        let Some(login) = connect.login else {
            return self.refuse(ConnectReturnCode::BadUserNamePassword).await;
        };

        let thing_id = match self.shared.hooks.authenticate(&login.password).await {
            Ok(thing_id) => thing_id,
            Err(AuthError::Unauthenticated) => {
                return self.refuse(ConnectReturnCode::BadUserNamePassword).await;
            }
            Err(e) => {
                // Fail closed on an unreachable things service.
                tracing::warn!(?e, "refusing CONNECT");
                return self.refuse(ConnectReturnCode::NotAuthorized).await;
            }
        };

        // An absent client id is assigned from the authenticated identity,
        // so a reconnecting thing resumes the same session anywhere in the
        // fleet.
        let client_id = if connect.client_id.is_empty() {
            thing_id.as_str().to_string()
        } else {
            connect.client_id
        };

        let persistence = self.shared.persistence.clone();

        let prior_subscriptions = if connect.clean_session {
            Vec::new()
        } else {
            match persistence.subscriptions(&client_id).await {
                Ok(subscriptions) => subscriptions,
                Err(e) => {
                    tracing::error!(client_id, ?e, "error loading session state");
                    return self.refuse(ConnectReturnCode::ServiceUnavailable).await;
                }
            }
        };

        if let Err(e) = persistence
            .save_session(&client_id, connect.clean_session)
            .await
        {
            tracing::error!(client_id, ?e, "error saving session state");
            return self.refuse(ConnectReturnCode::ServiceUnavailable).await;
        }

        match persistence
            .claim_presence(&client_id, &self.shared.instance)
            .await
        {
            Ok(Some(previous_instance)) => {
                tracing::info!(client_id, previous_instance, "session takeover");
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(client_id, ?e, "error claiming session presence");
                return self.refuse(ConnectReturnCode::ServiceUnavailable).await;
            }
        }

        if let Some(will) = &connect.last_will {
            let frame = EmitterFrame::new(
                will.topic.clone(),
                will.message.clone(),
                will.qos,
                will.retain,
            );

            if let Err(e) = persistence.store_will(&client_id, &frame).await {
                // The in-memory copy still fires it on this instance.
                tracing::error!(client_id, ?e, "error storing will");
            }
        }

        let session_present = !connect.clean_session && !prior_subscriptions.is_empty();

        // Replaces any previous local registration for this client id,
        // closing the replaced connection's delivery channel.
        let (registration, deliveries) = self
            .shared
            .fanout
            .register(&client_id, prior_subscriptions.clone());

        self.client_id = Some(client_id.clone());
        self.thing_id = Some(thing_id.clone());
        self.password = login.password;
        self.clean_session = connect.clean_session;
        self.keep_alive = KeepAlive::from_seconds(connect.keep_alive);
        self.registration = Some(registration);

        self.send(Packet::ConnAck(ConnAck {
            session_present,
            code: ConnectReturnCode::Success,
        }))
        .await?;

        self.shared.hooks.connected(&thing_id).await;

        // Messages queued while the session was offline drain after the
        // CONNACK, replayed against the resumed subscriptions.
        if !connect.clean_session {
            match persistence.drain_queue(&client_id).await {
                Ok(queued) => {
                    for frame in queued {
                        let Some(granted) = granted_qos(&prior_subscriptions, &frame.topic)
                        else {
                            continue;
                        };

                        let qos = frame.qos().min(granted);
                        self.deliver_publish(frame.topic, frame.payload, qos, false)
                            .await?;
                    }
                }
                Err(e) => {
                    tracing::error!(client_id, ?e, "error draining offline queue");
                }
            }
        }

        Ok(Some(deliveries))
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<Flow, ConnectionError> {
        match packet {
            Packet::PingReq => {
                self.send(Packet::PingResp).await?;
            }
            Packet::Publish(publish) => {
                return self.handle_publish(publish).await;
            }
            Packet::PubAck(PubAck { pkid }) | Packet::PubComp(PubComp { pkid }) => {
                if !self.outbound_pending.remove(&pkid) {
                    tracing::trace!(pkid, "ack for an unknown outbound publish");
                }
            }
            Packet::PubRec(PubRec { pkid }) => {
                // The publish stays pending until the PUBCOMP.
                if self.outbound_pending.contains(&pkid) {
                    self.send(Packet::PubRel(PubRel { pkid })).await?;
                } else {
                    tracing::trace!(pkid, "PUBREC for an unknown outbound publish");
                }
            }
            Packet::PubRel(PubRel { pkid }) => {
                if !self.incoming_qos2.remove(&pkid) {
                    tracing::trace!(pkid, "PUBREL for an unknown inbound publish");
                }

                self.send(Packet::PubComp(PubComp { pkid })).await?;
            }
            Packet::Subscribe(subscribe) => {
                return self.handle_subscribe(subscribe).await;
            }
            Packet::Unsubscribe(unsubscribe) => {
                return self.handle_unsubscribe(unsubscribe).await;
            }
            Packet::Disconnect => {
                // 3.1.2.5: a clean DISCONNECT discards the will.
                self.graceful = true;
                return Ok(Flow::Disconnect);
            }
            Packet::Connect(..) => {
                // MQTT-3.1.0-2
                close!("second CONNECT packet");
            }
            Packet::ConnAck(..)
            | Packet::SubAck(..)
            | Packet::UnsubAck(..)
            | Packet::PingResp => {
                close!("server-to-client packet from client: {packet:?}");
            }
        }

        Ok(Flow::Continue)
    }

    async fn handle_publish(&mut self, publish: Publish) -> Result<Flow, ConnectionError> {
        let qos = publish.qos;
        let pkid = publish.pkid;

        let Ok(topic) = std::str::from_utf8(&publish.topic) else {
            close!("publish topic is not valid UTF-8");
        };

        if topic.len() > TOPIC_MAX_LENGTH {
            close!("publish topic too long: {} bytes", topic.len());
        }

        if !mqtt_protocol::valid_topic(topic) {
            close!("not a valid publish topic: {topic:?}");
        }

        // A redelivered QoS 2 publish whose predecessor was not released
        // yet must not be processed again (4.3.3); just re-ack it.
        if qos == QoS::ExactlyOnce && self.incoming_qos2.contains(&pkid) {
            self.send(Packet::PubRec(PubRec { pkid })).await?;
            return Ok(Flow::Continue);
        }

        let topic = topic.to_string();

        match self
            .shared
            .hooks
            .authorize_publish(&self.password, &topic, publish.payload.clone())
            .await
        {
            Ok(()) => {
                if publish.retain {
                    let frame =
                        EmitterFrame::new(topic.clone(), publish.payload, qos, true);

                    // The envelope is already on the bus; a retained-store
                    // failure only loses the retained copy.
                    if let Err(e) = self.shared.persistence.store_retained(&frame).await {
                        tracing::error!(topic, ?e, "error storing retained message");
                    }
                }
            }
            Err(refusal) => {
                // 3.1.1 has no PUBLISH nack: the packet is acked below and
                // discarded, and the connection stays open.
                tracing::warn!(topic, client_id = ?self.client_id, "refusing publish: {refusal}");
            }
        }

        match qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => {
                self.send(Packet::PubAck(PubAck { pkid })).await?;
            }
            QoS::ExactlyOnce => {
                self.send(Packet::PubRec(PubRec { pkid })).await?;
                self.incoming_qos2.insert(pkid);
            }
        }

        Ok(Flow::Continue)
    }

    async fn handle_subscribe(&mut self, subscribe: Subscribe) -> Result<Flow, ConnectionError> {
        let pkid = subscribe.pkid;
        if pkid == 0 {
            close!("SUBSCRIBE packet ID cannot be zero");
        }

        let client_id = self
            .client_id
            .clone()
            .expect("BUG: no client id in a running session");

        // Shape problems refuse the whole packet, like authorization
        // failures: one SUBACK, every code a failure.
        let mut shape_ok = true;

        for filter in &subscribe.filters {
            if filter.path.len() > TOPIC_MAX_LENGTH || !mqtt_protocol::valid_filter(&filter.path)
            {
                tracing::warn!(filter = ?filter.path, "refusing subscribe: invalid filter");
                shape_ok = false;
                break;
            }
        }

        let authorized = if shape_ok {
            let paths: Vec<&str> = subscribe.filters.iter().map(|f| f.path.as_str()).collect();

            match self
                .shared
                .hooks
                .authorize_subscribe(&self.password, &paths)
                .await
            {
                Ok(()) => true,
                Err(refusal) => {
                    tracing::warn!(client_id, "refusing subscribe: {refusal}");
                    false
                }
            }
        } else {
            false
        };

        if !authorized {
            let return_codes = vec![SubscribeReasonCode::Failure; subscribe.filters.len()];
            self.send(Packet::SubAck(SubAck { pkid, return_codes })).await?;
            return Ok(Flow::Continue);
        }

        let subscriptions: Vec<StoredSubscription> = subscribe
            .filters
            .iter()
            .map(|filter| StoredSubscription {
                filter: filter.path.clone(),
                qos: filter.qos,
            })
            .collect();

        if let Err(e) = self
            .shared
            .persistence
            .store_subscriptions(&client_id, &subscriptions)
            .await
        {
            // Accepting a subscription the store never saw would silently
            // break resumption and offline queueing on the next connect.
            tracing::error!(client_id, ?e, "error storing subscriptions");

            let return_codes = vec![SubscribeReasonCode::Failure; subscribe.filters.len()];
            self.send(Packet::SubAck(SubAck { pkid, return_codes })).await?;
            return Ok(Flow::Continue);
        }

        self.shared.fanout.subscribe(&client_id, &subscriptions);

        let return_codes = subscriptions
            .iter()
            .map(|sub| SubscribeReasonCode::Success(sub.qos))
            .collect();

        self.send(Packet::SubAck(SubAck { pkid, return_codes })).await?;

        // Retained pass-through: matching retained messages open the new
        // subscription (3.3.1.3).
        match self.shared.persistence.retained().await {
            Ok(frames) => {
                for frame in frames {
                    let Some(granted) = granted_qos(&subscriptions, &frame.topic) else {
                        continue;
                    };

                    let qos = frame.qos().min(granted);
                    self.deliver_publish(frame.topic, frame.payload, qos, true)
                        .await?;
                }
            }
            Err(e) => {
                tracing::warn!(client_id, ?e, "error loading retained messages");
            }
        }

        Ok(Flow::Continue)
    }

    async fn handle_unsubscribe(
        &mut self,
        unsubscribe: Unsubscribe,
    ) -> Result<Flow, ConnectionError> {
        let pkid = unsubscribe.pkid;
        if pkid == 0 {
            close!("UNSUBSCRIBE packet ID cannot be zero");
        }

        let client_id = self
            .client_id
            .clone()
            .expect("BUG: no client id in a running session");

        if let Err(e) = self
            .shared
            .persistence
            .remove_subscriptions(&client_id, &unsubscribe.filters)
            .await
        {
            tracing::error!(client_id, ?e, "error removing subscriptions");
        }

        self.shared
            .fanout
            .unsubscribe(&client_id, &unsubscribe.filters);

        self.send(Packet::UnsubAck(UnsubAck { pkid })).await?;

        Ok(Flow::Continue)
    }

    async fn deliver(&mut self, delivery: Delivery) -> Result<(), ConnectionError> {
        self.deliver_publish(
            delivery.topic,
            delivery.payload,
            delivery.qos,
            delivery.retain,
        )
        .await
    }

    async fn deliver_publish(
        &mut self,
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ConnectionError> {
        let pkid = match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce | QoS::ExactlyOnce => {
                let pkid = self.alloc_pkid();
                self.outbound_pending.insert(pkid);
                pkid
            }
        };

        self.send(Packet::Publish(Publish {
            dup: false,
            qos,
            retain,
            pkid,
            topic: topic.into(),
            payload,
        }))
        .await
    }

    fn alloc_pkid(&mut self) -> u16 {
        loop {
            let pkid = self.next_pkid;
            self.next_pkid = if self.next_pkid == u16::MAX {
                1
            } else {
                self.next_pkid + 1
            };

            if !self.outbound_pending.contains(&pkid) {
                return pkid;
            }
        }
    }

    async fn recv_timed(&mut self) -> Result<Option<Packet>, ConnectionError> {
        match self.keep_alive.as_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, self.recv())
                .await
                .map_err(|_| ConnectionError::KeepAliveExpired)?,
            None => self.recv().await,
        }
    }

    async fn recv(&mut self) -> Result<Option<Packet>, ConnectionError> {
        loop {
            let mut read_len = match self.protocol.read_mut(&mut self.read_buf, MAX_PACKET_SIZE) {
                Ok(packet) => {
                    tracing::trace!(?packet, "received");
                    return Ok(Some(packet));
                }
                Err(mqtt_protocol::Error::InsufficientBytes(expected)) => expected,
                Err(e) => return Err(e.into()),
            };

            while read_len > 0 {
                tokio::select! {
                    res = self.socket.read(&mut self.read_buf) => {
                        let read = res.map_err(ConnectionError::Transport)?;

                        if read == 0 {
                            tracing::debug!("connection closed by remote peer");
                            return Ok(None);
                        }

                        read_len = read_len.saturating_sub(read);
                    }
                    () = self.token.cancelled() => {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn send(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        tracing::trace!(?packet, "sending");

        self.protocol.write(packet, &mut self.write_buf)?;

        self.socket
            .write_all(&mut self.write_buf)
            .await
            .map_err(ConnectionError::Transport)
    }

    /// Refuse the CONNECT with `code` and close.
    async fn refuse(
        &mut self,
        code: ConnectReturnCode,
    ) -> Result<Option<DeliveryReceiver>, ConnectionError> {
        self.send(Packet::ConnAck(ConnAck {
            session_present: false,
            code,
        }))
        .await?;

        let _ = self.socket.shutdown().await;

        Ok(None)
    }

    async fn teardown(&mut self, taken_over: bool) {
        let (Some(client_id), Some(thing_id)) = (self.client_id.clone(), self.thing_id.clone())
        else {
            // Never authenticated; nothing to clean up.
            return;
        };

        let persistence = self.shared.persistence.clone();

        // The will fires on every ungraceful teardown except process
        // shutdown and takeover (the successor carries the session on, will
        // included, so a taken-over connection must not touch the store's
        // copy). A clean DISCONNECT discards it instead.
        let fire_will = !self.graceful && !taken_over && !self.token.is_cancelled();

        if fire_will || (self.graceful && !taken_over) {
            match persistence.take_will(&client_id).await {
                Ok(Some(will)) if fire_will => {
                    // The will runs through the same authorize-publish path
                    // as a live publish; the key is still in memory here.
                    match self
                        .shared
                        .hooks
                        .authorize_publish(&self.password, &will.topic, will.payload.clone())
                        .await
                    {
                        Ok(()) => {
                            if will.retain {
                                if let Err(e) = persistence.store_retained(&will).await {
                                    tracing::error!(client_id, ?e, "error storing retained will");
                                }
                            }
                        }
                        Err(refusal) => {
                            tracing::warn!(client_id, "refusing will publish: {refusal}");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(client_id, ?e, "error taking will");
                }
            }
        }

        self.shared.hooks.disconnected(&thing_id).await;

        if self.clean_session {
            if let Err(e) = persistence.drop_session(&client_id).await {
                tracing::error!(client_id, ?e, "error dropping clean session");
            }
        }

        if let Some(registration) = self.registration.take() {
            self.shared.fanout.deregister(&client_id, registration);
        }

        if !taken_over {
            if let Err(e) = persistence
                .release_presence(&client_id, &self.shared.instance)
                .await
            {
                tracing::error!(client_id, ?e, "error releasing session presence");
            }
        }

        // Secret material does not outlive the connection.
        self.password = Bytes::new();
    }
}

fn granted_qos(subscriptions: &[StoredSubscription], topic: &str) -> Option<QoS> {
    subscriptions
        .iter()
        .filter(|sub| crate::broker::filter::topic_matches(&sub.filter, topic))
        .map(|sub| sub.qos)
        .max()
}
