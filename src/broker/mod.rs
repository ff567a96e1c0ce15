//! The MQTT broker core: listeners, the per-connection state machine, and
//! the local fanout half of the shared emitter.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use color_eyre::eyre;
use color_eyre::eyre::WrapErr;
use slotmap::SlotMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::hooks::Hooks;
use crate::store::Persistence;

pub mod fanout;
pub mod filter;
pub mod keep_alive;
pub mod websocket;

mod connection;

pub use connection::Connection;
use fanout::Fanout;
use websocket::WebsocketAcceptor;

slotmap::new_key_type! {
    pub struct ConnectionId;
}

/// One device-facing byte stream.
///
/// Raw TCP and WebSocket framing differ below this line and nowhere else:
/// the connection state machine only ever pulls bytes in, pushes a packet
/// buffer out, and hangs up. Reframing partial or coalesced packets is the
/// codec's job, not the transport's.
pub trait MqttSocket: Send + Unpin + 'static {
    fn remote_addr(&self) -> SocketAddr;

    /// Pull whatever the device has sent into `buf`. Zero bytes means the
    /// device hung up.
    fn read(&mut self, buf: &mut BytesMut) -> impl Future<Output = eyre::Result<usize>> + Send;

    /// Push the packet bytes in `buf` to the device and leave `buf` empty.
    /// The WebSocket side takes the allocation instead of copying it, so
    /// callers must not rely on the buffer keeping its capacity.
    fn write_all(&mut self, buf: &mut Vec<u8>) -> impl Future<Output = eyre::Result<()>> + Send;

    fn shutdown(&mut self) -> impl Future<Output = eyre::Result<()>> + Send;
}

/// The raw-TCP transport behind the MQTT listener.
pub struct TcpSocket {
    remote_addr: SocketAddr,
    stream: TcpStream,
}

impl MqttSocket for TcpSocket {
    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    async fn read(&mut self, buf: &mut BytesMut) -> eyre::Result<usize> {
        Ok(self.stream.read_buf(buf).await?)
    }

    async fn write_all(&mut self, buf: &mut Vec<u8>) -> eyre::Result<()> {
        self.stream.write_all(buf).await?;
        buf.clear();
        Ok(())
    }

    async fn shutdown(&mut self) -> eyre::Result<()> {
        Ok(self.stream.shutdown().await?)
    }
}

/// State shared by every connection on this instance.
pub struct Shared {
    pub hooks: Hooks,
    pub persistence: Arc<dyn Persistence>,
    pub fanout: Fanout,
    /// Tag recorded in connection events and presence claims.
    pub instance: String,
}

/// What a finished connection task reports back to the accept loop.
pub struct ConnectionData {
    pub id: ConnectionId,
    pub client_id: Option<String>,
}

pub struct MqttBroker {
    mqtt_addr: SocketAddr,
    listener: TcpListener,
    websocket: WebsocketAcceptor,

    token: CancellationToken,

    /// Generator for `ConnectionId`s.
    connections: SlotMap<ConnectionId, ()>,
    tasks: JoinSet<ConnectionData>,

    shared: Arc<Shared>,
}

impl MqttBroker {
    pub async fn bind(
        mqtt_addr: SocketAddr,
        ws_addr: SocketAddr,
        shared: Shared,
        token: CancellationToken,
    ) -> crate::Result<Self> {
        let listener = TcpListener::bind(mqtt_addr)
            .await
            .wrap_err_with(|| format!("failed to bind mqtt_addr: {mqtt_addr}"))?;

        let websocket = WebsocketAcceptor::bind(ws_addr).await?;

        Ok(MqttBroker {
            mqtt_addr,
            listener,
            websocket,
            token,
            connections: SlotMap::with_capacity_and_key(256),
            tasks: JoinSet::new(),
            shared: Arc::new(shared),
        })
    }

    pub async fn run(&mut self) -> crate::Result<()> {
        tracing::info!(mqtt_addr = %self.mqtt_addr, "listening for connections");

        loop {
            tokio::select! {
                () = self.token.cancelled() => break,
                res = self.listener.accept() => {
                    self.handle_accept(res);
                }
                res = self.websocket.accept() => {
                    let socket = res.wrap_err("websocket listener failed")?;
                    self.spawn_connection(socket);
                }
                Some(res) = self.tasks.join_next() => {
                    match res {
                        Ok(data) => {
                            self.connections.remove(data.id);
                            tracing::trace!(client_id = ?data.client_id, "connection finished");
                        }
                        Err(e) => tracing::error!(?e, "connection task panicked"),
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_accept(&mut self, result: std::io::Result<(TcpStream, SocketAddr)>) {
        match result {
            Ok((stream, remote_addr)) => {
                tracing::debug!(%remote_addr, "connection received");

                self.spawn_connection(TcpSocket {
                    remote_addr,
                    stream,
                });
            }
            // TODO: some kinds of accept failures are probably fatal
            Err(e) => tracing::error!(?e, "accept failed"),
        }
    }

    fn spawn_connection<S: MqttSocket>(&mut self, socket: S) {
        let id = self.connections.insert(());

        let conn = Connection::new(id, socket, self.token.clone(), self.shared.clone());

        self.tasks.spawn(conn.run());
    }

    pub fn connections(&self) -> usize {
        self.tasks.len()
    }

    /// Stop listening and wait for every connection to finish its teardown.
    /// The caller bounds this with the shutdown deadline.
    pub async fn shutdown(mut self) -> crate::Result<()> {
        // Closes any pending connections and stops listening for new ones.
        drop(self.listener);
        drop(self.websocket);

        self.token.cancel();

        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                tracing::error!(?e, "connection task panicked during shutdown");
            }

            tracing::debug!("{} connections remaining", self.tasks.len());
        }

        Ok(())
    }
}
