//! Internal bus client.
//!
//! The bus carries [`crate::envelope::RawMessage`] frames on subjects under
//! `channel.`; the adapter publishes device messages out and the inbound
//! bridge consumes the whole subject space through a queue group.

use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::eyre::WrapErr;

/// Publishing half of the bus, behind a trait so the publish hook can be
/// exercised without a live broker.
#[async_trait]
pub trait BusPublisher: Send + Sync + 'static {
    async fn publish(&self, subject: String, payload: Bytes) -> crate::Result<()>;
}

/// Bus client over NATS.
#[derive(Clone)]
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    pub async fn connect(url: &str) -> crate::Result<NatsBus> {
        let client = async_nats::connect(url)
            .await
            .wrap_err_with(|| format!("error connecting to the internal bus at {url}"))?;

        Ok(NatsBus { client })
    }

    /// Queue-group subscription: each message on `subject` is delivered to
    /// exactly one member of `group` across the fleet.
    pub async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
    ) -> crate::Result<async_nats::Subscriber> {
        self.client
            .queue_subscribe(subject.to_string(), group.to_string())
            .await
            .wrap_err_with(|| format!("error subscribing to {subject} in queue group {group}"))
    }

    pub async fn flush(&self) -> crate::Result<()> {
        self.client.flush().await.wrap_err("error flushing the bus")
    }
}

#[async_trait]
impl BusPublisher for NatsBus {
    async fn publish(&self, subject: String, payload: Bytes) -> crate::Result<()> {
        self.client
            .publish(subject, payload)
            .await
            .wrap_err("error publishing to the internal bus")
    }
}
