//! Broker abstraction over the two external wire protocols (§6.1): AMQP-1.0
//! (UMB) and AMQP-0.9.1 (RabbitMQ). One [`BrokerClient`] trait hides the
//! protocol difference from the listener; the wire codecs themselves are out
//! of scope, so [`Amqp1Broker`]/[`Amqp091Broker`] are thin connection-config
//! holders and [`MockBroker`] is the one implementation exercised in tests.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use kaijs_config::BrokerKind;
use kaijs_error::{ErrorCode, KaijsError};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use tokio::sync::Mutex;

/// A single message received off the broker, prior to becoming a
/// `kaijs_model::SpoolMessage` (the listener stamps `spool_id` on ingest).
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    /// Broker-assigned message id.
    pub msg_id: String,
    /// Raw topic as seen on the wire (may carry a `topic://` prefix).
    pub topic: String,
    /// Provider-reported timestamp, seconds since epoch.
    pub provider_ts: i64,
    /// Header timestamp, if the broker's transport header carried one.
    pub header_ts: Option<i64>,
    /// Parsed JSON body.
    pub body: Value,
    /// Any additional broker-specific headers.
    pub extra: Map<String, Value>,
}

/// Uniform broker operations the listener drives, independent of wire
/// protocol (§6.1).
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Receives the next available message, or `None` if none is
    /// immediately available (non-blocking poll semantics).
    async fn receive(&self) -> Result<Option<BrokerMessage>, KaijsError>;

    /// Acknowledges successful processing of `msg`.
    async fn ack(&self, msg: &BrokerMessage) -> Result<(), KaijsError>;

    /// Negatively acknowledges `msg`, making it eligible for redelivery.
    async fn nack(&self, msg: &BrokerMessage) -> Result<(), KaijsError>;

    /// Closes the broker connection.
    async fn close(&self) -> Result<(), KaijsError>;
}

/// In-memory broker for tests and local development: `enqueue` feeds
/// messages that `receive` then pops in FIFO order; `nack` requeues at the
/// front so a retried message is seen again before fresh ones.
#[derive(Default)]
pub struct MockBroker {
    inbox: Mutex<VecDeque<BrokerMessage>>,
    acked: Mutex<Vec<String>>,
    nacked: Mutex<Vec<String>>,
    closed: std::sync::atomic::AtomicBool,
}

impl MockBroker {
    /// Creates an empty mock broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a message onto the back of the inbox.
    pub async fn enqueue(&self, msg: BrokerMessage) {
        self.inbox.lock().await.push_back(msg);
    }

    /// Returns the ids acknowledged so far, in order.
    pub async fn acked_ids(&self) -> Vec<String> {
        self.acked.lock().await.clone()
    }

    /// Returns the ids negatively acknowledged so far, in order.
    pub async fn nacked_ids(&self) -> Vec<String> {
        self.nacked.lock().await.clone()
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn receive(&self) -> Result<Option<BrokerMessage>, KaijsError> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(KaijsError::new(ErrorCode::ConnectionLost, "mock broker is closed"));
        }
        Ok(self.inbox.lock().await.pop_front())
    }

    async fn ack(&self, msg: &BrokerMessage) -> Result<(), KaijsError> {
        self.acked.lock().await.push(msg.msg_id.clone());
        Ok(())
    }

    async fn nack(&self, msg: &BrokerMessage) -> Result<(), KaijsError> {
        self.nacked.lock().await.push(msg.msg_id.clone());
        self.inbox.lock().await.push_front(msg.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), KaijsError> {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

/// AMQP-1.0 (UMB) adapter. The wire codec is out of scope for this pipeline;
/// this struct only holds the connection parameters a real adapter would
/// need, and surfaces a clear `ConnectionLost` error if driven without one.
pub struct Amqp1Broker {
    url: String,
    client_name: String,
}

impl Amqp1Broker {
    /// Builds an adapter for `url` identifying itself as `client_name`.
    #[must_use]
    pub fn new(url: impl Into<String>, client_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_name: client_name.into(),
        }
    }

    /// The configured broker URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl BrokerClient for Amqp1Broker {
    async fn receive(&self) -> Result<Option<BrokerMessage>, KaijsError> {
        Err(not_wired(BrokerKind::Amqp1, &self.url))
    }

    async fn ack(&self, _msg: &BrokerMessage) -> Result<(), KaijsError> {
        Err(not_wired(BrokerKind::Amqp1, &self.url))
    }

    async fn nack(&self, _msg: &BrokerMessage) -> Result<(), KaijsError> {
        Err(not_wired(BrokerKind::Amqp1, &self.url))
    }

    async fn close(&self) -> Result<(), KaijsError> {
        tracing::info!(target: "kaijs::broker", client = %self.client_name, "closing amqp1 broker (no-op, never wired)");
        Ok(())
    }
}

/// AMQP-0.9.1 (RabbitMQ) adapter; same scope boundary as [`Amqp1Broker`].
pub struct Amqp091Broker {
    url: String,
}

impl Amqp091Broker {
    /// Builds an adapter for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// The configured broker URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl BrokerClient for Amqp091Broker {
    async fn receive(&self) -> Result<Option<BrokerMessage>, KaijsError> {
        Err(not_wired(BrokerKind::Amqp091, &self.url))
    }

    async fn ack(&self, _msg: &BrokerMessage) -> Result<(), KaijsError> {
        Err(not_wired(BrokerKind::Amqp091, &self.url))
    }

    async fn nack(&self, _msg: &BrokerMessage) -> Result<(), KaijsError> {
        Err(not_wired(BrokerKind::Amqp091, &self.url))
    }

    async fn close(&self) -> Result<(), KaijsError> {
        Ok(())
    }
}

fn not_wired(kind: BrokerKind, url: &str) -> KaijsError {
    KaijsError::new(
        ErrorCode::ConnectionLost,
        format!("{kind:?} wire protocol is not wired in this build"),
    )
    .with_context("url", url)
}

/// Builds the configured broker adapter for `kind`, used by the listener
/// binary to pick the real client from `kaijs_config::Config`.
#[must_use]
pub fn broker_for(kind: BrokerKind, url: &str, client_name: &str) -> Box<dyn BrokerClient> {
    match kind {
        BrokerKind::Amqp1 => Box::new(Amqp1Broker::new(url, client_name)),
        BrokerKind::Amqp091 => Box::new(Amqp091Broker::new(url)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> BrokerMessage {
        BrokerMessage {
            msg_id: id.into(),
            topic: "topic://org.fedoraproject.prod.ci.koji-build.test.complete".into(),
            provider_ts: 1,
            header_ts: None,
            body: Value::Null,
            extra: Map::new(),
        }
    }

    #[tokio::test]
    async fn mock_broker_receives_in_fifo_order() {
        let broker = MockBroker::new();
        broker.enqueue(sample("m1")).await;
        broker.enqueue(sample("m2")).await;

        assert_eq!(broker.receive().await.unwrap().unwrap().msg_id, "m1");
        assert_eq!(broker.receive().await.unwrap().unwrap().msg_id, "m2");
        assert!(broker.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn nack_requeues_at_front() {
        let broker = MockBroker::new();
        broker.enqueue(sample("m1")).await;
        broker.enqueue(sample("m2")).await;

        let m1 = broker.receive().await.unwrap().unwrap();
        broker.nack(&m1).await.unwrap();

        assert_eq!(broker.receive().await.unwrap().unwrap().msg_id, "m1");
        assert_eq!(broker.nacked_ids().await, vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn ack_records_msg_id() {
        let broker = MockBroker::new();
        broker.enqueue(sample("m1")).await;
        let m1 = broker.receive().await.unwrap().unwrap();
        broker.ack(&m1).await.unwrap();
        assert_eq!(broker.acked_ids().await, vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn closed_broker_refuses_receive() {
        let broker = MockBroker::new();
        broker.close().await.unwrap();
        let err = broker.receive().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ConnectionLost);
    }

    #[tokio::test]
    async fn amqp_adapters_report_connection_lost_until_wired() {
        let amqp1 = Amqp1Broker::new("amqps://umb.example.com", "kaijs-listener");
        assert_eq!(amqp1.receive().await.unwrap_err().code, ErrorCode::ConnectionLost);
        amqp1.close().await.unwrap();

        let amqp091 = Amqp091Broker::new("amqp://rabbit.example.com");
        assert_eq!(amqp091.receive().await.unwrap_err().code, ErrorCode::ConnectionLost);
    }

    #[test]
    fn broker_for_dispatches_by_kind() {
        let c1 = broker_for(BrokerKind::Amqp1, "amqps://umb", "client");
        let c2 = broker_for(BrokerKind::Amqp091, "amqp://rabbit", "client");
        drop(c1);
        drop(c2);
    }
}
