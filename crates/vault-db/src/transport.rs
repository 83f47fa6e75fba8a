//! MessagePort trait for cross-context messaging.
//!
//! Implementations:
//! - Channel: in-process tokio mpsc pair (tests, single-process hosts)
//! - Hosts may bridge a port to IPC or a worker boundary

use crate::protocol::Envelope;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Port closed")]
    Closed,

    #[error("Send failed: {0}")]
    SendFailed(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Receiving half of a port. Envelopes arrive in send order.
pub type Inbox = mpsc::UnboundedReceiver<Envelope>;

/// Sending half of a logical channel between two contexts.
#[async_trait]
pub trait MessagePort: Send + Sync {
    /// Post an envelope to the other side.
    async fn post(&self, envelope: Envelope) -> Result<()>;
}

/// In-process port backed by an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelPort {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ChannelPort {
    /// A port and the inbox it delivers to.
    pub fn new() -> (Self, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Two connected ends: whatever one side posts, the other side's inbox
    /// receives.
    pub fn pair() -> ((ChannelPort, Inbox), (ChannelPort, Inbox)) {
        let (a_port, b_inbox) = Self::new();
        let (b_port, a_inbox) = Self::new();
        ((a_port, a_inbox), (b_port, b_inbox))
    }
}

#[async_trait]
impl MessagePort for ChannelPort {
    async fn post(&self, envelope: Envelope) -> Result<()> {
        self.tx.send(envelope).map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServiceKey;
    use serde_json::json;

    #[tokio::test]
    async fn test_pair_delivers_to_other_side() {
        let ((a, mut a_inbox), (b, mut b_inbox)) = ChannelPort::pair();

        a.post(Envelope::event(ServiceKey::Store, "ping", json!(1)))
            .await
            .unwrap();
        b.post(Envelope::event(ServiceKey::Device, "pong", json!(2)))
            .await
            .unwrap();

        assert_eq!(b_inbox.recv().await.unwrap().operation, "ping");
        assert_eq!(a_inbox.recv().await.unwrap().operation, "pong");
    }

    #[tokio::test]
    async fn test_post_after_inbox_dropped_fails() {
        let (port, inbox) = ChannelPort::new();
        drop(inbox);

        let result = port
            .post(Envelope::event(ServiceKey::Store, "ping", json!(null)))
            .await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }
}
