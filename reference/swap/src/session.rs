//! Ordered message session between the two parties of one request.

use std::time::Duration;

use crossnotary_common::{DurationExt, Party, RequestId, Result, SwapError};
use crossnotary_protocol::{SwapEnvelope, SwapMessage};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::metrics::SharedMetrics;

/// Messages buffered per direction.
const CHANNEL_CAPACITY: usize = 32;

/// One side of a session, as configured by its node.
#[derive(Clone)]
pub struct SessionEndpoint {
    pub party: Party,
    pub timeout: chrono::Duration,
    pub metrics: SharedMetrics,
}

/// A session end. Messages arrive in the order they were sent.
pub struct Session {
    request_id: RequestId,
    local: Party,
    peer: Party,
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: mpsc::Receiver<Vec<u8>>,
    timeout: Duration,
    metrics: SharedMetrics,
}

impl Session {
    /// Connected pair of session ends for `request_id`.
    pub fn pair(
        request_id: RequestId,
        initiator: SessionEndpoint,
        responder: SessionEndpoint,
    ) -> (Session, Session) {
        let (to_responder, from_initiator) = mpsc::channel(CHANNEL_CAPACITY);
        let (to_initiator, from_responder) = mpsc::channel(CHANNEL_CAPACITY);

        let left = Session {
            request_id,
            local: initiator.party.clone(),
            peer: responder.party.clone(),
            outbound: to_responder,
            inbound: from_responder,
            timeout: initiator.timeout.as_std(),
            metrics: initiator.metrics,
        };
        let right = Session {
            request_id,
            local: responder.party,
            peer: initiator.party,
            outbound: to_initiator,
            inbound: from_initiator,
            timeout: responder.timeout.as_std(),
            metrics: responder.metrics,
        };
        (left, right)
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn local(&self) -> &Party {
        &self.local
    }

    pub fn peer(&self) -> &Party {
        &self.peer
    }

    /// Send a message to the peer.
    pub async fn send(&self, message: SwapMessage) -> Result<()> {
        let kind = message.kind();
        let bytes = SwapEnvelope::new(self.request_id, message).encode()?;
        self.outbound
            .send(bytes)
            .await
            .map_err(|_| SwapError::SessionClosed(format!("{} left the session", self.peer)))?;
        self.metrics.message_sent();
        debug!(request_id = %self.request_id, to = %self.peer, kind, "Message sent");
        Ok(())
    }

    /// Next message, waiting at most the session timeout.
    pub async fn receive(&mut self) -> Result<SwapMessage> {
        match tokio::time::timeout(self.timeout, self.inbound.recv()).await {
            Ok(Some(bytes)) => self.accept(&bytes),
            Ok(None) => Err(SwapError::SessionClosed(format!(
                "{} left the session",
                self.peer
            ))),
            Err(_) => Err(SwapError::Timeout(format!(
                "no message from {} within {:?}",
                self.peer, self.timeout
            ))),
        }
    }

    /// Next message if one arrives before `deadline`.
    pub async fn receive_until(&mut self, deadline: Instant) -> Result<Option<SwapMessage>> {
        match tokio::time::timeout_at(deadline, self.inbound.recv()).await {
            Ok(Some(bytes)) => self.accept(&bytes).map(Some),
            Ok(None) => Err(SwapError::SessionClosed(format!(
                "{} left the session",
                self.peer
            ))),
            Err(_) => Ok(None),
        }
    }

    /// Tell the peer the flow stopped because of `err`. Best effort.
    pub async fn abort(&self, err: &SwapError) {
        if let Err(send_err) = self.send(SwapMessage::abort(err)).await {
            debug!(request_id = %self.request_id, error = %send_err, "Abort not delivered");
        }
    }

    fn accept(&self, bytes: &[u8]) -> Result<SwapMessage> {
        let envelope = SwapEnvelope::decode(bytes)?;
        self.metrics.message_received();

        if envelope.request_id != self.request_id {
            return Err(SwapError::UnexpectedMessage {
                expected: format!("message for {}", self.request_id),
                actual: format!("message for {}", envelope.request_id),
            });
        }
        debug!(
            request_id = %self.request_id,
            from = %self.peer,
            kind = envelope.message.kind(),
            "Message received"
        );

        match envelope.message {
            SwapMessage::Abort { code, reason } => Err(SwapError::CounterpartyAborted(format!(
                "{}: {}",
                code, reason
            ))),
            message => Ok(message),
        }
    }
}

/// Error for a message that arrived where another was expected.
pub fn unexpected(expected: &str, actual: &SwapMessage) -> SwapError {
    SwapError::UnexpectedMessage {
        expected: expected.to_string(),
        actual: actual.kind().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crossnotary_crypto::SigningKey;

    use crate::metrics::SwapMetrics;

    fn create_test_pair(timeout: chrono::Duration) -> (Session, Session, SharedMetrics) {
        let metrics = Arc::new(SwapMetrics::new());
        let endpoint = |name: &str| SessionEndpoint {
            party: Party::new(name, SigningKey::generate().public_key()),
            timeout,
            metrics: metrics.clone(),
        };
        let (alice, bob) = Session::pair(RequestId::new(), endpoint("alice"), endpoint("bob"));
        (alice, bob, metrics)
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let (alice, mut bob, metrics) = create_test_pair(chrono::Duration::seconds(5));

        alice.send(SwapMessage::Acknowledged).await.unwrap();
        alice
            .send(SwapMessage::SettlementFailed {
                reason: "late".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(bob.receive().await.unwrap(), SwapMessage::Acknowledged);
        assert!(matches!(
            bob.receive().await.unwrap(),
            SwapMessage::SettlementFailed { .. }
        ));
        assert_eq!(bob.peer().name.as_str(), "alice");
        assert_eq!(metrics.snapshot().messages_sent, 2);
        assert_eq!(metrics.snapshot().messages_received, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_times_out() {
        let (_alice, mut bob, _) = create_test_pair(chrono::Duration::seconds(120));
        let err = bob.receive().await.unwrap_err();
        assert!(matches!(err, SwapError::Timeout(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_until_returns_none_at_deadline() {
        let (_alice, mut bob, _) = create_test_pair(chrono::Duration::seconds(120));
        let deadline = Instant::now() + Duration::from_secs(30);
        assert!(bob.receive_until(deadline).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_abort_surfaces_as_counterparty_aborted() {
        let (alice, mut bob, _) = create_test_pair(chrono::Duration::seconds(5));
        alice
            .abort(&SwapError::ConsistencyFault("id mismatch".into()))
            .await;

        match bob.receive().await.unwrap_err() {
            SwapError::CounterpartyAborted(reason) => {
                assert!(reason.starts_with("CONSISTENCY_FAULT"))
            }
            other => panic!("unexpected error {}", other),
        }
    }

    #[tokio::test]
    async fn test_dropped_peer_closes_session() {
        let (alice, mut bob, _) = create_test_pair(chrono::Duration::seconds(5));
        drop(alice);
        assert!(matches!(
            bob.receive().await.unwrap_err(),
            SwapError::SessionClosed(_)
        ));
    }
}
