//! Environment-variable configuration for the kaijs listener and loader.
//!
//! Every field maps to a specific `KAIJS_*` environment variable with a
//! documented default; nothing is required to start either binary. Call
//! [`Config::from_env`] once at process start.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Errors that can occur while loading configuration from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// One or more environment variables failed to parse into their
    /// expected type.
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages, one per bad field.
        reasons: Vec<String>,
    },
}

/// Which broker protocol a listener process speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    /// AMQP-1.0, as spoken by the Unified Message Bus.
    Amqp1,
    /// AMQP-0.9.1, as spoken by RabbitMQ.
    Amqp091,
}

impl std::str::FromStr for BrokerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amqp1" | "amqp-1" | "amqp1.0" => Ok(Self::Amqp1),
            "amqp091" | "amqp-0.9.1" | "rabbitmq" => Ok(Self::Amqp091),
            other => Err(format!("unrecognized broker kind: {other}")),
        }
    }
}

/// Top-level runtime configuration shared by the `listener` and `loader`
/// binaries. Every field has a default; `from_env` only overrides fields for
/// which the corresponding environment variable is set and non-empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Root directory of the file-backed spool.
    pub spool_dir: String,
    /// Maximum filenames claimed per spool scan.
    pub spool_scan_batch: usize,
    /// URL of the schemas Git repository to mirror.
    pub schema_repo_url: String,
    /// Local path for the bare Git mirror and schema compiler cache.
    pub schema_cache_dir: String,
    /// Hours between scheduled `fetch --prune` refreshes.
    pub schema_refresh_hours: u64,
    /// Prefix for document-DB collection names.
    pub docdb_index_prefix: String,
    /// Prefix for search-index names.
    pub search_index_prefix: String,
    /// Maximum optimistic-concurrency retry iterations.
    pub occ_max_retries: u32,
    /// Pending-update count that triggers a bulk flush.
    pub bulk_flush_count: usize,
    /// Pending byte-size that triggers a bulk flush.
    pub bulk_flush_bytes: u64,
    /// Idle milliseconds since the last envelope that trigger a bulk flush.
    pub bulk_flush_idle_ms: u64,
    /// Build-system XML-RPC endpoint used for the `getBuild` enrichment call.
    pub buildsys_xmlrpc_url: String,
    /// Number of retry attempts for the XML-RPC enrichment call.
    pub buildsys_retry_attempts: u32,
    /// Exponential backoff factor for the XML-RPC enrichment call.
    pub buildsys_retry_factor: u32,
    /// Base backoff delay in milliseconds.
    pub buildsys_retry_base_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub buildsys_retry_max_ms: u64,
    /// Seconds between listener liveness status snapshots.
    pub listener_status_interval_secs: u64,
    /// Which broker protocol the listener speaks.
    pub broker_kind: BrokerKind,
    /// Broker connection URL.
    pub broker_url: String,
    /// Client name used in UMB queue naming / RabbitMQ connection name.
    pub broker_client_name: String,
    /// `tracing` log level filter.
    pub log_level: String,
    /// Whether to emit logs as JSON lines instead of compact text.
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            spool_dir: "./spool".into(),
            spool_scan_batch: 32,
            schema_repo_url: "https://github.com/fedora-ci/schemas.git".into(),
            schema_cache_dir: "./schema-cache".into(),
            schema_refresh_hours: 12,
            docdb_index_prefix: "kaijs_".into(),
            search_index_prefix: "kaijs-".into(),
            occ_max_retries: 30,
            bulk_flush_count: 100,
            bulk_flush_bytes: 50 * 1024 * 1024,
            bulk_flush_idle_ms: 3_000,
            buildsys_xmlrpc_url: "https://koji.fedoraproject.org/kojihub".into(),
            buildsys_retry_attempts: 5,
            buildsys_retry_factor: 3,
            buildsys_retry_base_ms: 1_000,
            buildsys_retry_max_ms: 60_000,
            listener_status_interval_secs: 60,
            broker_kind: BrokerKind::Amqp091,
            broker_url: "amqps://localhost".into(),
            broker_client_name: "kaijs".into(),
            log_level: "info".into(),
            log_json: false,
        }
    }
}

macro_rules! override_string {
    ($field:expr, $var:expr) => {
        if let Ok(val) = std::env::var($var)
            && !val.is_empty()
        {
            $field = val;
        }
    };
}

macro_rules! override_parsed {
    ($field:expr, $var:expr, $reasons:expr) => {
        if let Ok(val) = std::env::var($var)
            && !val.is_empty()
        {
            match val.parse() {
                Ok(parsed) => $field = parsed,
                Err(_) => $reasons.push(format!("{}: invalid value {val:?}", $var)),
            }
        }
    };
}

impl Config {
    /// Load configuration from the process environment, overlaying
    /// [`Config::default`] with every `KAIJS_*` variable that is set and
    /// parses successfully.
    ///
    /// # Errors
    /// Returns [`ConfigError::ValidationError`] listing every variable that
    /// was set but failed to parse into its expected type. Fields whose
    /// variable is unset or empty silently keep their default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let mut reasons = Vec::new();

        override_string!(config.spool_dir, "KAIJS_SPOOL_DIR");
        override_parsed!(config.spool_scan_batch, "KAIJS_SPOOL_SCAN_BATCH", reasons);
        override_string!(config.schema_repo_url, "KAIJS_SCHEMA_REPO_URL");
        override_string!(config.schema_cache_dir, "KAIJS_SCHEMA_CACHE_DIR");
        override_parsed!(
            config.schema_refresh_hours,
            "KAIJS_SCHEMA_REFRESH_HOURS",
            reasons
        );
        override_string!(config.docdb_index_prefix, "KAIJS_DOCDB_PREFIX");
        override_string!(config.search_index_prefix, "KAIJS_SEARCH_INDEX_PREFIX");
        override_parsed!(config.occ_max_retries, "KAIJS_OCC_MAX_RETRIES", reasons);
        override_parsed!(config.bulk_flush_count, "KAIJS_BULK_FLUSH_COUNT", reasons);
        override_parsed!(config.bulk_flush_bytes, "KAIJS_BULK_FLUSH_BYTES", reasons);
        override_parsed!(
            config.bulk_flush_idle_ms,
            "KAIJS_BULK_FLUSH_IDLE_MS",
            reasons
        );
        override_string!(config.buildsys_xmlrpc_url, "KAIJS_BUILDSYS_XMLRPC_URL");
        override_parsed!(
            config.buildsys_retry_attempts,
            "KAIJS_BUILDSYS_RETRY_ATTEMPTS",
            reasons
        );
        override_parsed!(
            config.buildsys_retry_factor,
            "KAIJS_BUILDSYS_RETRY_FACTOR",
            reasons
        );
        override_parsed!(
            config.buildsys_retry_base_ms,
            "KAIJS_BUILDSYS_RETRY_BASE_MS",
            reasons
        );
        override_parsed!(
            config.buildsys_retry_max_ms,
            "KAIJS_BUILDSYS_RETRY_MAX_MS",
            reasons
        );
        override_parsed!(
            config.listener_status_interval_secs,
            "KAIJS_LISTENER_STATUS_INTERVAL_SECS",
            reasons
        );
        override_parsed!(config.broker_kind, "KAIJS_BROKER_KIND", reasons);
        override_string!(config.broker_url, "KAIJS_BROKER_URL");
        override_string!(config.broker_client_name, "KAIJS_BROKER_CLIENT_NAME");
        override_string!(config.log_level, "KAIJS_LOG_LEVEL");
        override_parsed!(config.log_json, "KAIJS_LOG_JSON", reasons);

        if reasons.is_empty() {
            Ok(config)
        } else {
            Err(ConfigError::ValidationError { reasons })
        }
    }
}
