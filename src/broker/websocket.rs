use std::mem;
use std::net::SocketAddr;

use bytes::BytesMut;
use color_eyre::eyre;
use color_eyre::eyre::WrapErr;
use futures::{SinkExt, TryStreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broker::MqttSocket;

/// Sub-protocol tokens devices offer for MQTT over WebSocket. The handshake
/// echoes the first one back (MQTT-6.0.0-3, but tokens are optional here).
const SUBPROTOCOLS: &[&str] = &["mqtt", "mqttv3.1"];

pub struct WebsocketAcceptor {
    listener: TcpListener,
    // To not block the broker loop, WebSocket upgrades complete in tasks.
    handshaking: JoinSet<eyre::Result<MqttWebsocket>>,
}

pub struct MqttWebsocket {
    remote_addr: SocketAddr,
    stream: WebSocketStream<TcpStream>,
}

impl WebsocketAcceptor {
    pub async fn bind(addr: SocketAddr) -> eyre::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .wrap_err_with(|| format!("failed to bind ws_addr: {addr}"))?;

        Ok(Self {
            listener,
            handshaking: JoinSet::new(),
        })
    }

    pub async fn accept(&mut self) -> eyre::Result<MqttWebsocket> {
        loop {
            tokio::select! {
                res = self.listener.accept() => {
                    let (stream, addr) = res.wrap_err("error from TcpListener.accept()")?;

                    tracing::debug!(remote_addr = %addr, "websocket connection received");
                    self.handshaking.spawn(handshake(addr, stream));
                }
                Some(res) = self.handshaking.join_next() => {
                    match res {
                        Ok(Ok(socket)) => return Ok(socket),
                        // Error is logged by `handshake()`
                        Ok(Err(_)) => (),
                        Err(e) => {
                            tracing::debug!("error from handshake task: {e}");
                        }
                    }
                }
            }
        }
    }
}

impl MqttSocket for MqttWebsocket {
    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    async fn read(&mut self, buf: &mut BytesMut) -> eyre::Result<usize> {
        let message = self.stream.try_next().await?;

        let Some(message) = message else { return Ok(0) };

        match message {
            Message::Binary(bytes) => {
                buf.extend_from_slice(&bytes);
                Ok(bytes.len())
            }
            // Frames are transparent: a WebSocket message may hold part of
            // an MQTT packet or several packets; the codec reframes.
            //
            // MQTT Control Packets MUST be sent in WebSocket binary data
            // frames; on any other data frame the connection is closed
            // [MQTT-6.0.0-1].
            Message::Close(_) => Ok(0),
            _ => Err(eyre::eyre!("unexpected websocket message: {message:?}")),
        }
    }

    async fn write_all(&mut self, buf: &mut Vec<u8>) -> eyre::Result<()> {
        // `tokio-tungstenite` only works with `Vec<u8>`; to avoid copying,
        // take the whole buffer and send it.
        self.stream.send(Message::Binary(mem::take(buf))).await?;

        Ok(())
    }

    async fn shutdown(&mut self) -> eyre::Result<()> {
        self.stream.close(None).await?;

        Ok(())
    }
}

#[tracing::instrument(skip(stream), err(level = tracing::Level::DEBUG))]
async fn handshake(remote_addr: SocketAddr, stream: TcpStream) -> eyre::Result<MqttWebsocket> {
    // Disable Nagle's algorithm since we always send complete packets.
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(?e, "error setting TCP_NODELAY on socket");
    }

    let stream = tokio_tungstenite::accept_hdr_async(stream, negotiate_subprotocol)
        .await
        .wrap_err("error from websocket accept")?;

    Ok(MqttWebsocket {
        remote_addr,
        stream,
    })
}

/// Echo back the first MQTT sub-protocol token the client offered, if any.
/// Clients that offer none still get a plain upgrade.
fn negotiate_subprotocol(
    request: &Request,
    mut response: Response,
) -> Result<Response, tokio_tungstenite::tungstenite::handshake::server::ErrorResponse> {
    let offered = request
        .headers()
        .get("Sec-WebSocket-Protocol")
        .and_then(|header| header.to_str().ok());

    if let Some(offered) = offered {
        let accepted = offered
            .split(',')
            .map(str::trim)
            .find(|token| SUBPROTOCOLS.contains(token));

        if let Some(token) = accepted {
            if let Ok(value) = token.parse() {
                response
                    .headers_mut()
                    .insert("Sec-WebSocket-Protocol", value);
            }
        }
    }

    Ok(response)
}
