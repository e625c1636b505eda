//! The channel send contract.
//!
//! Concrete providers (SMS, voice, chat, email) are thin adapters over
//! third-party transports and live outside the engine; the engine depends
//! only on this trait.

use async_trait::async_trait;

/// Receipt returned by a provider on successful delivery.
#[derive(Debug, Clone, Default)]
pub struct ProviderReceipt {
    /// Provider-side message identifier, when the transport reports one.
    pub provider_message_id: Option<String>,
}

/// A failed send, classified for the retry loop.
#[derive(Debug, Clone)]
pub struct SendError {
    /// Transient errors are retried with backoff; permanent errors are
    /// immediately terminal.
    pub transient: bool,
    pub message: String,
}

impl SendError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            transient: true,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            transient: false,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let class = if self.transient { "transient" } else { "permanent" };
        write!(f, "{} send error: {}", class, self.message)
    }
}

impl std::error::Error for SendError {}

/// Uniform send contract implemented by every delivery medium.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel name as referenced by routing rules and rate limit
    /// configuration (e.g. `"sms"`, `"email"`).
    fn name(&self) -> &str;

    /// Deliver a rendered payload to a recipient.
    async fn send(
        &self,
        payload: &str,
        recipient: &str,
    ) -> std::result::Result<ProviderReceipt, SendError>;
}
