//! The envelope (`SpoolMessage`) that crosses the spool, §3.1.

use crate::BrokerExtra;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single broker message, normalized into the shape every downstream
/// stage consumes. This is the unit the spool stores, claims, and commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SpoolMessage {
    /// Locally unique id, `"<unix_seconds>-<broker_msg_id>"`.
    pub spool_id: String,
    /// Broker-assigned id; stable across retries.
    pub broker_msg_id: String,
    /// Normalized topic string (leading `topic://` stripped).
    pub broker_topic: String,
    /// Which listener produced this envelope.
    pub provider_name: String,
    /// Unix seconds when the listener received the broker message.
    pub provider_ts: i64,
    /// Optional timestamp extracted from broker headers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_ts: Option<i64>,
    /// Decoded JSON payload.
    pub body: Value,
    /// Verbatim broker headers (opaque mapping).
    #[serde(default)]
    pub broker_extra: BrokerExtra,
}

impl SpoolMessage {
    /// Strips a leading `topic://` prefix, per listener step 1.
    #[must_use]
    pub fn normalize_topic(raw: &str) -> String {
        raw.strip_prefix("topic://").unwrap_or(raw).to_string()
    }

    /// Builds the `spool_id` from the provider timestamp and broker message
    /// id, per §3.1.
    #[must_use]
    pub fn make_spool_id(provider_ts: i64, broker_msg_id: &str) -> String {
        format!("{provider_ts}-{broker_msg_id}")
    }

    /// `true` when `broker_topic` contains the CI middle segment, the
    /// discriminator the validator uses to pick strict vs. non-CI handling.
    #[must_use]
    pub fn is_ci_topic(&self) -> bool {
        self.broker_topic.contains(".ci.")
    }
}
