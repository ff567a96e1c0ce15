//! gRPC transport for the things service.
//!
//! The request/response types are written out by hand against the platform
//! protobuf schema (`mainflux.ThingsService`); there is no build-time
//! codegen, so the tags and method paths below are the single source of
//! truth on this side of the wire.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use color_eyre::eyre::WrapErr;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tonic::{Code, Status};

use crate::things::{AuthError, Breaker, ThingId, ThingsClient};
use crate::topic::ChannelId;

const IDENTIFY_PATH: &str = "/mainflux.ThingsService/Identify";
const CAN_ACCESS_PATH: &str = "/mainflux.ThingsService/CanAccess";

#[derive(Clone, PartialEq, ::prost::Message)]
struct Token {
    #[prost(string, tag = "1")]
    value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
struct AccessReq {
    #[prost(string, tag = "1")]
    token: String,
    #[prost(string, tag = "2")]
    chan_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
struct ThingIdentity {
    #[prost(string, tag = "1")]
    value: String,
}

/// Connection settings for the things service.
#[derive(Debug, Clone)]
pub struct ThingsTransport {
    /// `http://` or `https://` endpoint of the things service.
    pub url: String,
    /// Negotiate TLS even when `url` does not force it.
    pub tls: bool,
    /// Optional CA bundle for the TLS handshake.
    pub ca_certs: Option<PathBuf>,
}

/// Things service client over a lazily connected gRPC channel, guarded by a
/// per-process circuit breaker.
pub struct GrpcThingsClient {
    inner: Grpc<Channel>,
    breaker: Breaker,
}

/// Outcome of one RPC round trip before it is mapped to a per-method
/// [`AuthError`].
enum CallError {
    /// The service answered and said no.
    Denied,
    /// The service could not be reached or did not answer in time.
    Unavailable(String),
}

impl GrpcThingsClient {
    /// Build the client. The channel connects lazily: an unreachable things
    /// service keeps the adapter up and failing closed rather than failing
    /// startup.
    pub fn connect(transport: &ThingsTransport, deadline: Duration) -> crate::Result<Self> {
        let mut endpoint = Endpoint::from_shared(transport.url.clone())
            .wrap_err_with(|| format!("invalid things service url: {}", transport.url))?
            .connect_timeout(deadline)
            .timeout(deadline);

        if transport.tls {
            let mut tls = ClientTlsConfig::new();

            if let Some(ca_path) = &transport.ca_certs {
                let pem = std::fs::read(ca_path)
                    .wrap_err_with(|| format!("error reading {}", ca_path.display()))?;
                tls = tls.ca_certificate(Certificate::from_pem(pem));
            }

            endpoint = endpoint
                .tls_config(tls)
                .wrap_err("invalid things service TLS configuration")?;
        }

        Ok(GrpcThingsClient {
            inner: Grpc::new(endpoint.connect_lazy()),
            breaker: Breaker::default(),
        })
    }

    async fn unary<Req, Res>(&self, path: &'static str, request: Req) -> Result<Res, CallError>
    where
        Req: prost::Message + Send + Sync + 'static,
        Res: prost::Message + Default + Send + Sync + 'static,
    {
        if !self.breaker.admit() {
            return Err(CallError::Unavailable("circuit breaker is open".into()));
        }

        let result = self.unary_inner(path, request).await;

        match result {
            Ok(response) => {
                self.breaker.record_success();
                Ok(response)
            }
            Err(status) => match status.code() {
                // A clean denial is a successful round trip as far as the
                // breaker is concerned.
                Code::Unauthenticated | Code::PermissionDenied | Code::NotFound => {
                    self.breaker.record_success();
                    Err(CallError::Denied)
                }
                _ => {
                    self.breaker.record_failure();
                    Err(CallError::Unavailable(status.to_string()))
                }
            },
        }
    }

    async fn unary_inner<Req, Res>(&self, path: &'static str, request: Req) -> Result<Res, Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Res: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.inner.clone();

        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("things service was not ready: {e}")))?;

        let codec: ProstCodec<Req, Res> = ProstCodec::default();
        let response = grpc
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(path),
                codec,
            )
            .await?;

        Ok(response.into_inner())
    }
}

#[async_trait]
impl ThingsClient for GrpcThingsClient {
    async fn identify(&self, key: &[u8]) -> Result<ThingId, AuthError> {
        // Thing keys are UTF-8 tokens on the schema side; anything else
        // cannot possibly be known to the service.
        let Ok(value) = std::str::from_utf8(key) else {
            return Err(AuthError::Unauthenticated);
        };

        let response: ThingIdentity = self
            .unary(
                IDENTIFY_PATH,
                Token {
                    value: value.into(),
                },
            )
            .await
            .map_err(|e| match e {
                CallError::Denied => AuthError::Unauthenticated,
                CallError::Unavailable(reason) => AuthError::Unavailable(reason),
            })?;

        Ok(ThingId::new(response.value))
    }

    async fn can_access(&self, key: &[u8], channel: &ChannelId) -> Result<ThingId, AuthError> {
        let Ok(token) = std::str::from_utf8(key) else {
            return Err(AuthError::Unauthorized);
        };

        let response: ThingIdentity = self
            .unary(
                CAN_ACCESS_PATH,
                AccessReq {
                    token: token.into(),
                    chan_id: channel.as_str().into(),
                },
            )
            .await
            .map_err(|e| match e {
                CallError::Denied => AuthError::Unauthorized,
                CallError::Unavailable(reason) => AuthError::Unavailable(reason),
            })?;

        Ok(ThingId::new(response.value))
    }
}
