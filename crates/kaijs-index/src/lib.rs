//! Search-index writer, §4.8: bulk-flush scheduling, index-name resolution,
//! and the invalid-messages sink.
//!
//! Grounded on the teacher's `abp-protocol::batch` module — a `MAX_*`
//! threshold constant, an `Instant`-timed processor, and one result per
//! batched item — generalized from "encode each envelope" to "track pending
//! bulk size/count/idle-time and flush under any of three triggers".

#![deny(unsafe_code)]
#![warn(missing_docs)]

use kaijs_error::{ErrorCode, KaijsError, KaijsErrorDto};
use kaijs_model::IndexUpdate;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Flush trigger: pending update count, §4.8.
pub const FLUSH_COUNT_THRESHOLD: usize = 100;
/// Flush trigger: pending byte size, §4.8 (50 MiB).
pub const FLUSH_BYTES_THRESHOLD: usize = 50 * 1024 * 1024;
/// Flush trigger: idle time since the last envelope, §4.8.
pub const FLUSH_IDLE: Duration = Duration::from_secs(3);

/// Name of the sink index for invalid/malformed messages, §4.8.
pub const INVALID_MESSAGES_INDEX: &str = "invalid-messages";

/// Byte threshold above which a raw message body is truncated before being
/// written to the invalid-messages sink (just over the 16 MiB BSON limit,
/// §4.8).
pub const INVALID_MESSAGE_BYTE_THRESHOLD: usize = 17_800_000;

const TRUNCATION_NOTE: &str = "Message is bigger than 16Mb. Cannot store.";

/// The origin product line a message belongs to, the first half of the
/// `(context, artifact_type)` key that resolves an index name, §4.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    /// Red Hat internal (brew, errata, MBS).
    Redhat,
    /// CentOS Stream.
    Centos,
    /// Fedora.
    Fedora,
    /// Unrecognized or cross-cutting context.
    Any,
}

impl Context {
    /// Stable lowercase name used in the resolved index name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Redhat => "redhat",
            Self::Centos => "centos",
            Self::Fedora => "fedora",
            Self::Any => "any",
        }
    }

    /// Infers the context from a normalized broker topic's leading
    /// namespace segments, falling back to [`Context::Any`].
    #[must_use]
    pub fn from_topic(topic: &str) -> Self {
        if topic.contains("centos") {
            Self::Centos
        } else if topic.contains("fedoraproject") {
            Self::Fedora
        } else if topic.contains("redhat") || topic.starts_with("VirtualTopic") {
            Self::Redhat
        } else {
            Self::Any
        }
    }
}

/// Resolves the target index name as a pure function of `(prefix, context,
/// artifact_type)`, §4.8.
#[must_use]
pub fn resolve_index_name(prefix: &str, context: Context, artifact_type: &str) -> String {
    format!("{prefix}{}-{}", context.as_str(), artifact_type)
}

/// Builds the document written to the `invalid-messages` index: the raw
/// body (or a fixed truncation note if it's over
/// [`INVALID_MESSAGE_BYTE_THRESHOLD`] bytes) plus the validation error
/// detail.
#[must_use]
pub fn invalid_message_doc(body: &Value, error: &KaijsErrorDto) -> Value {
    let serialized_len = serde_json::to_vec(body).map(|v| v.len()).unwrap_or(0);
    let body_field = if serialized_len > INVALID_MESSAGE_BYTE_THRESHOLD {
        json!(TRUNCATION_NOTE)
    } else {
        body.clone()
    };
    json!({"body": body_field, "error": error})
}

/// Bulk write operations the flush path issues against the search index.
pub trait IndexStore: Send + Sync {
    /// Applies one bulk batch. Per §4.8, a bulk error is all-or-nothing:
    /// implementations must not partially apply a failed batch.
    fn bulk(&self, updates: &[IndexUpdate]) -> Result<(), KaijsError>;
}

/// Accumulates pending [`IndexUpdate`]s and decides when to flush, per the
/// three triggers of §4.8: count ≥ 100, bytes ≥ 50 MiB, idle > 3s.
pub struct BulkScheduler {
    pending: Vec<IndexUpdate>,
    pending_bytes: usize,
    last_activity: Instant,
    flush_count: usize,
    flush_bytes: usize,
    flush_idle: Duration,
}

impl BulkScheduler {
    /// Builds a scheduler using the default thresholds.
    #[must_use]
    pub fn new() -> Self {
        Self::with_thresholds(FLUSH_COUNT_THRESHOLD, FLUSH_BYTES_THRESHOLD, FLUSH_IDLE)
    }

    /// Builds a scheduler with explicit thresholds (for tests, or a
    /// differently configured deployment).
    #[must_use]
    pub fn with_thresholds(flush_count: usize, flush_bytes: usize, flush_idle: Duration) -> Self {
        Self {
            pending: Vec::new(),
            pending_bytes: 0,
            last_activity: Instant::now(),
            flush_count,
            flush_bytes,
            flush_idle,
        }
    }

    /// Queues `update`, returning the batch to flush immediately if the
    /// count or byte threshold was just crossed.
    pub fn push(&mut self, update: IndexUpdate) -> Option<Vec<IndexUpdate>> {
        self.pending_bytes += estimate_size(&update);
        self.pending.push(update);
        self.last_activity = Instant::now();
        if self.pending.len() >= self.flush_count || self.pending_bytes >= self.flush_bytes {
            Some(self.drain())
        } else {
            None
        }
    }

    /// Call periodically (e.g. once per loader iteration) to flush on the
    /// idle-time trigger even when no new update has arrived.
    pub fn poll_idle(&mut self) -> Option<Vec<IndexUpdate>> {
        if !self.pending.is_empty() && self.last_activity.elapsed() >= self.flush_idle {
            Some(self.drain())
        } else {
            None
        }
    }

    /// Number of updates currently buffered.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Forces a flush regardless of threshold, for shutdown. Returns `None`
    /// if nothing is pending.
    pub fn flush_now(&mut self) -> Option<Vec<IndexUpdate>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.drain())
        }
    }

    fn drain(&mut self) -> Vec<IndexUpdate> {
        self.pending_bytes = 0;
        std::mem::take(&mut self.pending)
    }
}

impl Default for BulkScheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn estimate_size(update: &IndexUpdate) -> usize {
    serde_json::to_vec(&update.doc).map(|v| v.len()).unwrap_or(0)
}

/// In-memory reference [`IndexStore`], keyed by `(index_name, doc_id)`.
/// Honors the parent/child upsert asymmetry: a non-`doc_as_upsert` write
/// only creates, never overwrites, an existing document.
#[derive(Default)]
pub struct MemoryIndexStore {
    docs: Mutex<HashMap<(String, String), Value>>,
    bulk_calls: Mutex<usize>,
}

impl MemoryIndexStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current document at `(index_name, doc_id)`, if any.
    #[must_use]
    pub fn get(&self, index_name: &str, doc_id: &str) -> Option<Value> {
        self.docs.lock().unwrap().get(&(index_name.to_string(), doc_id.to_string())).cloned()
    }

    /// Number of `bulk` calls made so far.
    #[must_use]
    pub fn bulk_call_count(&self) -> usize {
        *self.bulk_calls.lock().unwrap()
    }
}

impl IndexStore for MemoryIndexStore {
    fn bulk(&self, updates: &[IndexUpdate]) -> Result<(), KaijsError> {
        let mut docs = self.docs.lock().unwrap();
        for update in updates {
            let key = (update.index_name.clone(), update.doc_id.clone());
            if update.doc_as_upsert {
                docs.insert(key, update.doc.clone());
            } else {
                docs.entry(key).or_insert_with(|| update.upsert.clone().unwrap_or_else(|| update.doc.clone()));
            }
        }
        *self.bulk_calls.lock().unwrap() += 1;
        Ok(())
    }
}

/// An [`IndexStore`] that always fails, for exercising the loader's
/// all-or-nothing rollback path.
pub struct FailingIndexStore;

impl IndexStore for FailingIndexStore {
    fn bulk(&self, _updates: &[IndexUpdate]) -> Result<(), KaijsError> {
        Err(KaijsError::new(ErrorCode::ConnectionLost, "bulk request failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kaijs_model::JoinField;

    fn parent_update(index: &str, id: &str) -> IndexUpdate {
        IndexUpdate {
            doc_id: id.into(),
            index_name: index.into(),
            doc: json!({"nvr": "foo-1-1"}),
            upsert: Some(json!({"nvr": "foo-1-1"})),
            routing: id.into(),
            doc_as_upsert: false,
        }
    }

    fn child_update(index: &str, id: &str, parent: &str) -> IndexUpdate {
        IndexUpdate {
            doc_id: id.into(),
            index_name: index.into(),
            doc: json!({"join": JoinField::child(parent)}),
            upsert: None,
            routing: parent.into(),
            doc_as_upsert: true,
        }
    }

    #[test]
    fn resolve_index_name_is_pure_and_prefixed() {
        assert_eq!(
            resolve_index_name("kaijs-", Context::Fedora, "koji-build"),
            "kaijs-fedora-koji-build"
        );
        assert_eq!(
            resolve_index_name("kaijs-", Context::Redhat, "redhat-container-image"),
            "kaijs-redhat-redhat-container-image"
        );
    }

    #[test]
    fn context_from_topic_recognizes_known_namespaces() {
        assert_eq!(Context::from_topic("org.centos.prod.ci.koji-build.test.complete"), Context::Centos);
        assert_eq!(
            Context::from_topic("org.fedoraproject.prod.buildsys.tag"),
            Context::Fedora
        );
        assert_eq!(Context::from_topic("totally.unknown.topic"), Context::Any);
    }

    #[test]
    fn invalid_message_doc_keeps_small_bodies_verbatim() {
        let body = json!({"foo": "bar"});
        let error = KaijsErrorDto {
            code: ErrorCode::ValidationError,
            message: "bad shape".into(),
            context: Default::default(),
            source_message: None,
        };
        let doc = invalid_message_doc(&body, &error);
        assert_eq!(doc["body"], json!({"foo": "bar"}));
    }

    #[test]
    fn invalid_message_doc_truncates_oversized_bodies() {
        let body = json!({"blob": "x".repeat(INVALID_MESSAGE_BYTE_THRESHOLD + 1)});
        let error = KaijsErrorDto {
            code: ErrorCode::ValidationError,
            message: "too big".into(),
            context: Default::default(),
            source_message: None,
        };
        let doc = invalid_message_doc(&body, &error);
        assert_eq!(doc["body"], json!("Message is bigger than 16Mb. Cannot store."));
    }

    #[test]
    fn bulk_scheduler_flushes_on_count_threshold() {
        let mut scheduler = BulkScheduler::with_thresholds(2, usize::MAX, Duration::from_secs(3600));
        assert!(scheduler.push(parent_update("i", "p1")).is_none());
        let batch = scheduler.push(child_update("i", "c1", "p1")).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(scheduler.pending_len(), 0);
    }

    #[test]
    fn bulk_scheduler_flushes_on_byte_threshold() {
        let mut scheduler = BulkScheduler::with_thresholds(1_000_000, 10, Duration::from_secs(3600));
        let batch = scheduler.push(parent_update("i", "p1")).unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn bulk_scheduler_flushes_on_idle_poll() {
        let mut scheduler = BulkScheduler::with_thresholds(1_000_000, usize::MAX, Duration::from_millis(1));
        assert!(scheduler.push(parent_update("i", "p1")).is_none());
        std::thread::sleep(Duration::from_millis(5));
        let batch = scheduler.poll_idle().unwrap();
        assert_eq!(batch.len(), 1);
        assert!(scheduler.poll_idle().is_none());
    }

    #[test]
    fn flush_now_drains_regardless_of_threshold() {
        let mut scheduler = BulkScheduler::with_thresholds(1_000_000, usize::MAX, Duration::from_secs(3600));
        assert!(scheduler.flush_now().is_none());
        scheduler.push(parent_update("i", "p1"));
        let batch = scheduler.flush_now().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(scheduler.pending_len(), 0);
    }

    #[test]
    fn memory_store_parent_update_is_created_only_once() {
        let store = MemoryIndexStore::new();
        store.bulk(&[parent_update("i", "p1")]).unwrap();
        let mut second = parent_update("i", "p1");
        second.doc = json!({"nvr": "should-not-apply"});
        second.upsert = Some(second.doc.clone());
        store.bulk(&[second]).unwrap();
        assert_eq!(store.get("i", "p1"), Some(json!({"nvr": "foo-1-1"})));
    }

    #[test]
    fn memory_store_child_update_always_overwrites() {
        let store = MemoryIndexStore::new();
        store.bulk(&[child_update("i", "c1", "p1")]).unwrap();
        let mut second = child_update("i", "c1", "p1");
        second.doc = json!({"stage": "complete"});
        store.bulk(&[second]).unwrap();
        assert_eq!(store.get("i", "c1"), Some(json!({"stage": "complete"})));
        assert_eq!(store.bulk_call_count(), 2);
    }

    #[test]
    fn failing_store_reports_connection_lost() {
        let store = FailingIndexStore;
        let err = store.bulk(&[parent_update("i", "p1")]).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConnectionLost);
    }
}
