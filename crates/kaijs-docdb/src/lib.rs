//! Optimistic-concurrency document-DB writer, §4.7 — the hardest subroutine
//! in the pipeline. Every envelope merges into a single per-`(type, aid)`
//! document: read, transform, diff against a fresh read, write the diff
//! under a version check, retry on conflict.
//!
//! [`FileDocStore`] is the reference implementation, one JSON file per
//! artifact document, grounded on the teacher's file-based `ReceiptStore`.
//! A production deployment would swap in a real document-DB client behind
//! the same [`DocStore`] trait.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use kaijs_error::{ErrorCode, KaijsError};
use kaijs_model::{ArtifactDocument, ArtifactType};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// The 16 MiB BSON document limit the OCC loop raises `ToLargeDocumentError`
/// against, per §4.7 step (h).
pub const MAX_DOCUMENT_BYTES: usize = 16 * 1024 * 1024;

/// Storage operations the OCC loop in [`write_with_occ`] drives.
pub trait DocStore: Send + Sync {
    /// Returns the existing document for `(artifact_type, aid)`, creating an
    /// empty shell (`_version: 1`) on first observation, §4.7.2.
    fn find_or_create(&self, artifact_type: ArtifactType, aid: &str) -> Result<ArtifactDocument, KaijsError>;

    /// Applies `update_set` iff the stored document's `_version` still
    /// equals `expected_version`, bumping `_version` and `updated_at`.
    /// Returns `Ok(None)` on a version conflict (the caller should retry),
    /// `Err(ToLargeDocumentError)` if the result would exceed
    /// [`MAX_DOCUMENT_BYTES`].
    fn find_one_and_update(
        &self,
        id: &str,
        expected_version: u64,
        update_set: Map<String, Value>,
    ) -> Result<Option<ArtifactDocument>, KaijsError>;
}

/// Computes the minimal `$set` that makes `current` semantically equal to
/// `computed`, per §4.7.1:
/// - arrays are replaced wholesale (never diffed element-wise);
/// - scalars are emitted only when they differ from the current value;
/// - a `null` or empty array/object on the `computed` side never overwrites
///   an existing value.
#[must_use]
pub fn mk_update_set(current: &Value, computed: &Value) -> Map<String, Value> {
    let mut new_paths = Vec::new();
    collect_leaf_paths(computed, "", &mut new_paths);
    let mut cur_paths = Vec::new();
    collect_leaf_paths(current, "", &mut cur_paths);

    let cur_map: std::collections::HashMap<&str, &Value> =
        cur_paths.iter().filter(|(_, v)| !v.is_null()).map(|(p, v)| (p.as_str(), v)).collect();

    let mut out = Map::new();
    for (path, value) in &new_paths {
        if is_empty_new_value(value) {
            continue;
        }
        if !value.is_array() {
            if let Some(cur_value) = cur_map.get(path.as_str()) {
                if *cur_value == value {
                    continue;
                }
            }
        }
        out.insert(path.clone(), value.clone());
    }
    out
}

/// Arrays and empty objects are opaque leaves: descent stops there so an
/// array is always replaced wholesale rather than diffed index-by-index.
fn collect_leaf_paths(value: &Value, prefix: &str, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, inner) in map {
                let path = if prefix.is_empty() { key.clone() } else { format!("{prefix}.{key}") };
                collect_leaf_paths(inner, &path, out);
            }
        }
        _ => out.push((prefix.to_string(), value.clone())),
    }
}

fn is_empty_new_value(value: &Value) -> bool {
    matches!(value, Value::Null)
        || matches!(value, Value::Array(a) if a.is_empty())
        || matches!(value, Value::Object(o) if o.is_empty())
}

fn set_by_dotted_path(root: &mut Map<String, Value>, path: &str, value: Value) {
    let mut parts = path.split('.').peekable();
    let mut current = root;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.insert(part.to_string(), value);
            return;
        }
        let entry = current.entry(part.to_string()).or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry.as_object_mut().expect("just ensured object");
    }
}

/// Drives the full OCC loop of §4.7: seed a merge with the current
/// document, validate the merged result, re-read to get a version to race
/// against, diff, and write under that version — retrying on conflict up
/// to `max_retries` times.
///
/// `build_computed` plays the role of "the handler merges payload and
/// appends state" (§4.7 step 2a); `validate` is the artifact-document
/// schema check of step 2b.
pub fn write_with_occ<S, B, V>(
    store: &S,
    artifact_type: ArtifactType,
    aid: &str,
    max_retries: u32,
    mut build_computed: B,
    validate: V,
) -> Result<ArtifactDocument, KaijsError>
where
    S: DocStore + ?Sized,
    B: FnMut(&ArtifactDocument) -> Result<ArtifactDocument, KaijsError>,
    V: Fn(&ArtifactDocument) -> Result<(), KaijsError>,
{
    for attempt in 0..max_retries {
        let seed = store.find_or_create(artifact_type, aid)?;
        let computed = build_computed(&seed)?;
        validate(&computed)?;

        let current = store.find_or_create(artifact_type, aid)?;
        let current_value = serde_json::to_value(&current)
            .map_err(|e| KaijsError::new(ErrorCode::Internal, format!("serialize current document: {e}")))?;
        let computed_value = serde_json::to_value(&computed)
            .map_err(|e| KaijsError::new(ErrorCode::Internal, format!("serialize computed document: {e}")))?;

        let update_set = mk_update_set(&current_value, &computed_value);
        if update_set.is_empty() {
            return Ok(computed);
        }

        let id = current
            .id
            .clone()
            .ok_or_else(|| KaijsError::new(ErrorCode::Internal, "document is missing _id after find_or_create"))?;

        match store.find_one_and_update(&id, current.version, update_set)? {
            Some(new_doc) => return Ok(new_doc),
            None => {
                tracing::debug!(target: "kaijs::docdb", %artifact_type, aid, attempt, "occ conflict, retrying");
                continue;
            }
        }
    }
    Err(KaijsError::new(
        ErrorCode::OccExhausted,
        format!("exhausted {max_retries} optimistic-concurrency retries for {artifact_type}:{aid}"),
    )
    .with_context("artifact_type", artifact_type.as_str())
    .with_context("aid", aid))
}

/// File-based reference [`DocStore`]: one JSON file per `(artifact_type,
/// aid)` under `root/<type>/<aid>.json`.
#[derive(Debug)]
pub struct FileDocStore {
    root: PathBuf,
}

impl FileDocStore {
    /// Opens a store rooted at `root`, creating it lazily on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn doc_path(&self, artifact_type: ArtifactType, aid: &str) -> PathBuf {
        let safe_aid = aid.replace('/', "_");
        self.root.join(artifact_type.as_str()).join(format!("{safe_aid}.json"))
    }

    fn write_value(&self, path: &Path, value: &Value) -> Result<(), KaijsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err("create artifact document dir", &e))?;
        }
        let json = serde_json::to_vec_pretty(value)
            .map_err(|e| KaijsError::new(ErrorCode::Internal, format!("serialize artifact document: {e}")))?;
        std::fs::write(path, json).map_err(|e| io_err("write artifact document", &e))
    }
}

fn io_err(action: &str, err: &std::io::Error) -> KaijsError {
    KaijsError::new(ErrorCode::Internal, format!("{action}: {err}"))
        .with_source(std::io::Error::new(err.kind(), err.to_string()))
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn document_id(artifact_type: ArtifactType, aid: &str) -> String {
    format!("{}:{}", artifact_type.as_str(), aid)
}

fn split_document_id(id: &str) -> Result<(ArtifactType, String), KaijsError> {
    let (type_str, aid) = id
        .split_once(':')
        .ok_or_else(|| KaijsError::new(ErrorCode::Internal, format!("malformed document id {id:?}")))?;
    let artifact_type = ArtifactType::from_wire(type_str)
        .ok_or_else(|| KaijsError::new(ErrorCode::Internal, format!("unknown artifact type in document id {id:?}")))?;
    Ok((artifact_type, aid.to_string()))
}

impl DocStore for FileDocStore {
    fn find_or_create(&self, artifact_type: ArtifactType, aid: &str) -> Result<ArtifactDocument, KaijsError> {
        let path = self.doc_path(artifact_type, aid);
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                KaijsError::new(ErrorCode::Internal, format!("corrupt artifact document at {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut doc = ArtifactDocument::new_shell(artifact_type, aid);
                doc.id = Some(document_id(artifact_type, aid));
                doc.updated_at = Some(now());
                let value = serde_json::to_value(&doc)
                    .map_err(|e| KaijsError::new(ErrorCode::Internal, format!("serialize new document shell: {e}")))?;
                self.write_value(&path, &value)?;
                Ok(doc)
            }
            Err(e) => Err(io_err("read artifact document", &e)),
        }
    }

    fn find_one_and_update(
        &self,
        id: &str,
        expected_version: u64,
        update_set: Map<String, Value>,
    ) -> Result<Option<ArtifactDocument>, KaijsError> {
        let (artifact_type, aid) = split_document_id(id)?;
        let path = self.doc_path(artifact_type, &aid);
        let bytes = std::fs::read(&path).map_err(|e| io_err("read artifact document", &e))?;
        let mut value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| KaijsError::new(ErrorCode::Internal, format!("corrupt artifact document: {e}")))?;

        let current_version = value.get("_version").and_then(Value::as_u64).unwrap_or(0);
        if current_version != expected_version {
            return Ok(None);
        }

        let Value::Object(obj) = &mut value else {
            return Err(KaijsError::new(ErrorCode::Internal, "artifact document root is not an object"));
        };
        for (path_key, v) in update_set {
            set_by_dotted_path(obj, &path_key, v);
        }
        obj.insert("_version".to_string(), Value::from(current_version + 1));
        obj.insert("updated_at".to_string(), Value::from(now()));

        let size = serde_json::to_vec(&value)
            .map_err(|e| KaijsError::new(ErrorCode::Internal, format!("serialize updated document: {e}")))?
            .len();
        if size > MAX_DOCUMENT_BYTES {
            return Err(KaijsError::new(
                ErrorCode::ToLargeDocumentError,
                format!("artifact document {id} is {size} bytes, exceeds the {MAX_DOCUMENT_BYTES}-byte limit"),
            ));
        }

        self.write_value(&path, &value)?;
        let new_doc: ArtifactDocument = serde_json::from_value(value)
            .map_err(|e| KaijsError::new(ErrorCode::Internal, format!("updated document no longer matches shape: {e}")))?;
        Ok(Some(new_doc))
    }
}
