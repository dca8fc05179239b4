//! Session channel seams.

use async_trait::async_trait;
use thiserror::Error;

/// Error on an open channel.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,
    #[error("Channel error: {0}")]
    Transport(String),
}

/// Why a session could not be opened or ended abnormally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("{0}")]
    LocalTransport(String),
    #[error("not approved")]
    RejectedNotApproved,
    #[error("device change")]
    DeviceChangeInitiated,
    #[error("Session rejected with status {status}")]
    OtherRejection { status: u16 },
}

impl ConnectionError {
    /// Whether a retry should come soon rather than after the long interval.
    #[must_use]
    pub const fn retry_soon(&self) -> bool {
        matches!(self, Self::RejectedNotApproved | Self::DeviceChangeInitiated)
    }
}

impl From<ChannelError> for ConnectionError {
    fn from(e: ChannelError) -> Self {
        Self::LocalTransport(e.to_string())
    }
}

/// An open, text-framed session to the manager.
#[async_trait]
pub trait Channel: Send {
    /// Send one text frame.
    async fn send(&mut self, text: String) -> Result<(), ChannelError>;

    /// Next text frame. `None` once the peer closed the session.
    async fn recv(&mut self) -> Option<Result<String, ChannelError>>;

    /// Close the session. Errors are ignored.
    async fn close(&mut self);
}

/// Opens sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        user_agent: &str,
    ) -> Result<Box<dyn Channel>, ConnectionError>;
}
