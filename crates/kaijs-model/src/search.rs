//! Search-index parent/child documents and the write-op record handlers
//! hand to the index writer, §3.4 and §4.6.

use crate::envelope::SpoolMessage;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Join field value, distinguishing parent from child documents in a single
/// index, §3.4.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum JoinField {
    /// Parent side: `{name: "artifact"}`.
    Parent {
        /// Always `"artifact"`.
        name: String,
    },
    /// Child side: `{name: "message", parent: <parent_docId>}`.
    Child {
        /// Always `"message"`.
        name: String,
        /// The parent document's id.
        parent: String,
    },
}

impl JoinField {
    /// Builds the parent-side join field.
    #[must_use]
    pub fn parent() -> Self {
        Self::Parent {
            name: "artifact".into(),
        }
    }

    /// Builds the child-side join field routed to `parent_doc_id`.
    #[must_use]
    pub fn child(parent_doc_id: impl Into<String>) -> Self {
        Self::Child {
            name: "message".into(),
            parent: parent_doc_id.into(),
        }
    }
}

/// Parent document: the "searchable" projection of an artifact, keyed by
/// `"<artifact_type>-<artifact_id>"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ParentDoc {
    /// `docId = "<artifact_type>-<artifact_id>"`.
    pub doc_id: String,
    /// Flat searchable projection of the artifact.
    pub searchable: Value,
    /// Join field, always [`JoinField::parent`].
    pub join: JoinField,
}

impl ParentDoc {
    /// Computes the canonical parent `docId` for an artifact.
    #[must_use]
    pub fn doc_id_for(artifact_type: &str, artifact_id: &str) -> String {
        format!("{artifact_type}-{artifact_id}")
    }
}

/// Child document: per-message searchable projection plus the raw envelope,
/// keyed by `broker_msg_id` and routed to the parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ChildDoc {
    /// `docId = broker_msg_id`.
    pub doc_id: String,
    /// Flat searchable projection of this message.
    pub searchable: Value,
    /// The raw envelope, preserved for forensics/debugging.
    pub envelope: SpoolMessage,
    /// Join field, always [`JoinField::child`] routed to the parent.
    pub join: JoinField,
}

/// A single write-op a handler hands to the index writer, §4.6/§4.8.
///
/// Typically one `IndexUpdate` for the parent (upsert-only-if-missing) and
/// one for the child (always upsert) are produced per envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct IndexUpdate {
    /// Target document id.
    pub doc_id: String,
    /// Target index name (already resolved, see `kaijs-index::resolve_index_name`).
    pub index_name: String,
    /// The document body to merge/insert.
    pub doc: Value,
    /// `Some(doc)` when this update may create the document; parent updates
    /// carry the full parent doc here and set `doc_as_upsert: false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upsert: Option<Value>,
    /// Routing value; always the parent `docId` for both parent and child.
    pub routing: String,
    /// `true` for child updates (always up-sert); `false` for parent
    /// updates (created only on first observation).
    pub doc_as_upsert: bool,
}

impl IndexUpdate {
    /// Builds the parent-side update: created only if missing.
    #[must_use]
    pub fn for_parent(index_name: impl Into<String>, parent: &ParentDoc) -> Self {
        let doc = serde_json::to_value(parent).unwrap_or(Value::Null);
        Self {
            doc_id: parent.doc_id.clone(),
            index_name: index_name.into(),
            doc: doc.clone(),
            upsert: Some(doc),
            routing: parent.doc_id.clone(),
            doc_as_upsert: false,
        }
    }

    /// Builds the child-side update: always up-serted.
    #[must_use]
    pub fn for_child(index_name: impl Into<String>, child: &ChildDoc, parent_doc_id: &str) -> Self {
        let doc = serde_json::to_value(child).unwrap_or(Value::Null);
        Self {
            doc_id: child.doc_id.clone(),
            index_name: index_name.into(),
            doc,
            upsert: None,
            routing: parent_doc_id.to_string(),
            doc_as_upsert: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_doc_id_format() {
        assert_eq!(ParentDoc::doc_id_for("koji-build", "111"), "koji-build-111");
    }

    #[test]
    fn parent_update_is_not_doc_as_upsert() {
        let parent = ParentDoc {
            doc_id: "koji-build-111".into(),
            searchable: serde_json::json!({"nvr": "a-1-1"}),
            join: JoinField::parent(),
        };
        let update = IndexUpdate::for_parent("kaijs-fedora-koji-build", &parent);
        assert!(!update.doc_as_upsert);
        assert!(update.upsert.is_some());
        assert_eq!(update.routing, "koji-build-111");
    }

    #[test]
    fn child_update_is_always_doc_as_upsert() {
        let child = ChildDoc {
            doc_id: "msg-1".into(),
            searchable: serde_json::json!({"stage": "test"}),
            envelope: SpoolMessage {
                spool_id: "1-msg-1".into(),
                broker_msg_id: "msg-1".into(),
                broker_topic: "topic".into(),
                provider_name: "umb".into(),
                provider_ts: 1,
                header_ts: None,
                body: Value::Null,
                broker_extra: Default::default(),
            },
            join: JoinField::child("koji-build-111"),
        };
        let update = IndexUpdate::for_child("kaijs-fedora-koji-build", &child, "koji-build-111");
        assert!(update.doc_as_upsert);
        assert!(update.upsert.is_none());
        assert_eq!(update.routing, "koji-build-111");
    }
}
