//! Client for the external things service, which owns every authn/authz
//! decision the adapter makes.

use std::fmt::{self, Display, Formatter};

use async_trait::async_trait;

use crate::topic::ChannelId;

mod breaker;
mod grpc;

pub use breaker::Breaker;
pub use grpc::{GrpcThingsClient, ThingsTransport};

/// Identity of a thing as assigned by the things service. Opaque; stamped as
/// `publisher` on every envelope this adapter produces.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThingId(String);

impl ThingId {
    pub fn new(id: impl Into<String>) -> ThingId {
        ThingId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ThingId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The key is not a known thing; refuse the CONNECT.
    #[error("thing key is not recognized")]
    Unauthenticated,
    /// The thing is not connected to the channel; refuse the packet.
    #[error("thing is not connected to the channel")]
    Unauthorized,
    /// Transport failure or open circuit breaker; fail closed.
    #[error("things service unavailable: {0}")]
    Unavailable(String),
}

/// The two operations the adapter needs from the things service. Both are
/// idempotent; transport failures surface as [`AuthError::Unavailable`] and
/// the caller refuses the affected packet.
#[async_trait]
pub trait ThingsClient: Send + Sync + 'static {
    /// Resolve a thing key (the MQTT password) to the thing's identity.
    async fn identify(&self, key: &[u8]) -> Result<ThingId, AuthError>;

    /// Check that the thing holding `key` may publish to and subscribe from
    /// `channel`, resolving its identity at the same time.
    async fn can_access(&self, key: &[u8], channel: &ChannelId) -> Result<ThingId, AuthError>;
}
