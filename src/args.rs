use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::things::ThingsTransport;

/// Adapter configuration. Every option doubles as an environment variable,
/// which is how deployments set them.
#[derive(clap::Parser, Debug)]
pub struct Args {
    /// Set the format of log output.
    #[clap(short, long, default_value = "full")]
    pub log: LogFormat,

    /// Log verbosity when RUST_LOG is not set.
    #[clap(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Tag recorded in connection events and session presence claims;
    /// should be unique per adapter instance.
    #[clap(long, env = "INSTANCE_ID", default_value = "mqtt-adapter")]
    pub instance_id: String,

    /// TCP listener port for raw MQTT.
    #[clap(long, env = "MQTT_PORT", default_value = "1883")]
    pub mqtt_port: u16,

    /// Listener port for MQTT over WebSocket.
    #[clap(long, env = "WS_PORT", default_value = "8880")]
    pub ws_port: u16,

    /// Internal bus endpoint.
    #[clap(long, env = "NATS_URL", default_value = "nats://localhost:4222")]
    pub nats_url: String,

    /// Shared broker store host.
    #[clap(long, env = "REDIS_HOST", default_value = "localhost")]
    pub redis_host: String,

    /// Shared broker store port.
    #[clap(long, env = "REDIS_PORT", default_value = "6379")]
    pub redis_port: u16,

    /// Shared broker store password.
    #[clap(long, env = "REDIS_PASS")]
    pub redis_pass: Option<String>,

    /// Shared broker store database index.
    #[clap(long, env = "REDIS_DB", default_value = "0")]
    pub redis_db: i64,

    /// Event stream store host (may equal the broker store).
    #[clap(long, env = "ES_HOST", default_value = "localhost")]
    pub es_host: String,

    /// Event stream store port.
    #[clap(long, env = "ES_PORT", default_value = "6379")]
    pub es_port: u16,

    /// Event stream store password.
    #[clap(long, env = "ES_PASS")]
    pub es_pass: Option<String>,

    /// Event stream store database index.
    #[clap(long, env = "ES_DB", default_value = "0")]
    pub es_db: i64,

    /// Name of the connection event stream.
    #[clap(long, env = "ES_STREAM", default_value = "mainflux.mqtt")]
    pub es_stream: String,

    /// Negotiate TLS towards the things service.
    #[clap(long, env = "CLIENT_TLS")]
    pub client_tls: bool,

    /// CA bundle for the things service TLS handshake.
    #[clap(long, env = "CA_CERTS")]
    pub ca_certs: Option<PathBuf>,

    /// How many bus messages this instance processes in parallel.
    #[clap(long, env = "CONCURRENCY", default_value = "100")]
    pub concurrency: usize,

    /// Things service endpoint.
    #[clap(long, env = "THINGS_URL", default_value = "http://localhost:8183")]
    pub things_url: String,

    /// Deadline for one things service call, in seconds.
    #[clap(long, env = "AUTH_DEADLINE", default_value = "3")]
    pub auth_deadline: u64,

    /// Grace window for draining connections and bridge handlers on
    /// shutdown, in seconds.
    #[clap(long, env = "SHUTDOWN_GRACE", default_value = "30")]
    pub shutdown_grace: u64,
}

#[derive(clap::ValueEnum, Debug, Copy, Clone)]
pub enum LogFormat {
    Full,
    Compact,
    Pretty,
    Json,
}

impl Args {
    pub fn mqtt_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.mqtt_port)
    }

    pub fn ws_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.ws_port)
    }

    pub fn broker_store(&self) -> redis::ConnectionInfo {
        redis_info(
            &self.redis_host,
            self.redis_port,
            self.redis_pass.clone(),
            self.redis_db,
        )
    }

    pub fn event_store(&self) -> redis::ConnectionInfo {
        redis_info(&self.es_host, self.es_port, self.es_pass.clone(), self.es_db)
    }

    pub fn things_transport(&self) -> ThingsTransport {
        ThingsTransport {
            url: self.things_url.clone(),
            tls: self.client_tls,
            ca_certs: self.ca_certs.clone(),
        }
    }

    pub fn auth_deadline(&self) -> Duration {
        Duration::from_secs(self.auth_deadline)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }
}

fn redis_info(
    host: &str,
    port: u16,
    password: Option<String>,
    db: i64,
) -> redis::ConnectionInfo {
    redis::ConnectionInfo {
        addr: redis::ConnectionAddr::Tcp(host.into(), port),
        redis: redis::RedisConnectionInfo {
            db,
            password,
            ..Default::default()
        },
    }
}
