//! Envelope validation (§4.4): shape checks, strict JSON-Schema draft-07
//! validation for versioned CI topics, and relaxed declarative-shape
//! validation for the legacy `0.x` message family and non-CI topics.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use kaijs_error::{ErrorCode, KaijsError};
use kaijs_model::SpoolMessage;
use kaijs_schema::SchemaCatalog;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

/// A declarative shape: a set of JSON Pointers that must resolve to a
/// non-null value, used for the relaxed `0.x` family and for non-CI topics
/// that have no JSON-Schema counterpart.
#[derive(Debug, Clone)]
pub struct RelaxedShape {
    /// JSON Pointers (RFC 6901) that must be present and non-null.
    pub required_pointers: Vec<&'static str>,
}

impl RelaxedShape {
    /// The shape shared by every `0.x` CI message: a discriminated
    /// `artifact.type` plus the envelope's own pipeline anchor.
    #[must_use]
    pub fn legacy_ci_shape() -> Self {
        Self {
            required_pointers: vec!["/artifact/type"],
        }
    }

    fn check(&self, body: &Value) -> Result<(), KaijsError> {
        for pointer in &self.required_pointers {
            match body.pointer(pointer) {
                Some(Value::Null) | None => {
                    return Err(KaijsError::new(
                        ErrorCode::ValidationError,
                        format!("required field missing: {pointer}"),
                    )
                    .with_context("pointer", *pointer));
                }
                Some(_) => {}
            }
        }

        if let Some(artifact_type) = body.pointer("/artifact/type").and_then(Value::as_str)
            && kaijs_model::ArtifactType::from_wire(artifact_type).is_none()
        {
            return Err(KaijsError::new(
                ErrorCode::ValidationError,
                format!("unrecognized artifact.type: {artifact_type}"),
            )
            .with_context("artifact_type", artifact_type));
        }

        Ok(())
    }
}

/// A registry of `(regex, shape)` pairs for non-CI or legacy topics,
/// first-match-wins, matching the dispatch registry's own ordering rule.
#[derive(Debug, Default)]
pub struct ShapeRegistry {
    entries: Vec<(Regex, RelaxedShape)>,
}

impl ShapeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Registers a shape for topics matching `pattern`. Earlier
    /// registrations take precedence over later, broader ones.
    pub fn register(&mut self, pattern: &str, shape: RelaxedShape) -> Result<(), KaijsError> {
        let re = Regex::new(pattern)
            .map_err(|e| KaijsError::new(ErrorCode::Internal, format!("bad shape pattern {pattern}: {e}")))?;
        self.entries.push((re, shape));
        Ok(())
    }

    fn find(&self, topic: &str) -> Option<&RelaxedShape> {
        self.entries.iter().find(|(re, _)| re.is_match(topic)).map(|(_, s)| s)
    }
}

fn issuer_denylist() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("(?i)(freshmaker|cpaas)").expect("static issuer denylist regex"))
}

/// Rejects issuers matching `/(freshmaker|cpaas)/i`, applied by handlers to
/// the `valid_artifact_issuer` special-purpose schema, not the top-level
/// validator.
#[must_use]
pub fn is_denied_issuer(issuer: &str) -> bool {
    issuer_denylist().is_match(issuer)
}

/// Validates envelopes against the strict/relaxed split described in §4.4.
pub struct Validator<'a> {
    catalog: &'a SchemaCatalog,
    non_ci_shapes: ShapeRegistry,
    compiled_cache: Mutex<HashMap<(String, String), Arc<jsonschema::Validator>>>,
}

impl<'a> Validator<'a> {
    /// Builds a validator backed by `catalog` and `non_ci_shapes`.
    #[must_use]
    pub fn new(catalog: &'a SchemaCatalog, non_ci_shapes: ShapeRegistry) -> Self {
        Self { catalog, non_ci_shapes, compiled_cache: Mutex::new(HashMap::new()) }
    }

    /// Validates a single envelope, returning the first failure as a
    /// [`KaijsError`] carrying one of `EnvelopeShapeViolation`,
    /// `WrongVersionError`, `NoValidationSchemaError`, or `ValidationError`.
    pub fn validate(&self, msg: &SpoolMessage) -> Result<(), KaijsError> {
        if !msg.body.is_object() {
            return Err(KaijsError::new(
                ErrorCode::EnvelopeShapeViolation,
                "envelope body must be a JSON object",
            ));
        }

        let topic = SpoolMessage::normalize_topic(&msg.broker_topic);
        if topic.contains(".ci.") {
            self.validate_ci(&topic, &msg.body)
        } else {
            self.validate_non_ci(&topic, &msg.body)
        }
    }

    fn validate_ci(&self, topic: &str, body: &Value) -> Result<(), KaijsError> {
        let version = body.get("version").and_then(Value::as_str).unwrap_or("");
        if version.is_empty() {
            return Err(KaijsError::new(
                ErrorCode::WrongVersionError,
                "body.version missing or empty on a CI topic",
            ));
        }

        if version.starts_with("0.") {
            RelaxedShape::legacy_ci_shape().check(body)
        } else {
            self.strict_validate(topic, version, body)
        }
    }

    fn validate_non_ci(&self, topic: &str, body: &Value) -> Result<(), KaijsError> {
        match self.non_ci_shapes.find(topic) {
            Some(shape) => shape.check(body),
            None => Err(KaijsError::new(
                ErrorCode::NoValidationSchemaError,
                format!("no declarative shape registered for non-CI topic {topic}"),
            )),
        }
    }

    fn strict_validate(&self, topic: &str, version: &str, body: &Value) -> Result<(), KaijsError> {
        let path = schema_path_for_topic(topic);
        let validator = self.compiled_validator(version, &path)?;

        if let Err(first) = validator.validate(body) {
            let messages: Vec<String> = std::iter::once(first.to_string())
                .chain(validator.iter_errors(body).skip(1).map(|e| e.to_string()))
                .collect();
            return Err(KaijsError::new(ErrorCode::ValidationError, messages.join("; "))
                .with_context("schema_path", path)
                .with_context("schema_tag", version));
        }

        Ok(())
    }

    /// Compiles the schema at `(version, path)` and caches it, per §4.3/§4.4's
    /// "compile once per tag" rule — the compiled validator, not just the
    /// raw file `SchemaCatalog` already memoizes, is the expensive part.
    fn compiled_validator(&self, version: &str, path: &str) -> Result<Arc<jsonschema::Validator>, KaijsError> {
        let key = (version.to_string(), path.to_string());
        if let Some(cached) = self.compiled_cache.lock().expect("lock poisoned").get(&key) {
            return Ok(Arc::clone(cached));
        }

        let raw = self.catalog.get_file(version, path)?;
        let schema: Value = serde_yaml::from_slice(&raw).map_err(|e| {
            KaijsError::new(
                ErrorCode::NoValidationSchemaError,
                format!("schema at {path}@{version} is not valid YAML: {e}"),
            )
        })?;
        let compiled = jsonschema::validator_for(&schema).map_err(|e| {
            KaijsError::new(
                ErrorCode::NoValidationSchemaError,
                format!("schema at {path}@{version} does not compile: {e}"),
            )
        })?;
        let compiled = Arc::new(compiled);
        self.compiled_cache.lock().expect("lock poisoned").insert(key, Arc::clone(&compiled));
        Ok(compiled)
    }
}

/// Maps a normalized topic's last three dot-segments to a schema path, e.g.
/// `"pipeline.koji-build.test.complete"` resolves to
/// `"schemas/koji-build.test.complete.json"`.
#[must_use]
pub fn schema_path_for_topic(topic: &str) -> String {
    let segments: Vec<&str> = topic.split('.').collect();
    let last_three = if segments.len() >= 3 {
        &segments[segments.len() - 3..]
    } else {
        &segments[..]
    };
    format!("schemas/{}.json", last_three.join("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;
    use std::process::Command;
    use tempfile::tempdir;

    fn init_bare_remote_with_tag(remote_dir: &Path, tag: &str, file: &str, contents: &str) {
        Command::new("git").args(["init", "-q"]).current_dir(remote_dir).status().unwrap();
        std::fs::create_dir_all(Path::new(remote_dir).join("schemas")).unwrap();
        std::fs::write(remote_dir.join(file), contents).unwrap();
        Command::new("git").args(["add", "-A"]).current_dir(remote_dir).status().unwrap();
        Command::new("git")
            .args([
                "-c",
                "user.name=kaijs",
                "-c",
                "user.email=kaijs@local",
                "commit",
                "-qm",
                "schemas",
            ])
            .current_dir(remote_dir)
            .status()
            .unwrap();
        Command::new("git").args(["tag", tag]).current_dir(remote_dir).status().unwrap();
    }

    #[test]
    fn schema_path_takes_last_three_segments() {
        assert_eq!(
            schema_path_for_topic("pipeline.koji-build.test.complete"),
            "schemas/koji-build.test.complete.json"
        );
    }

    #[test]
    fn non_object_body_is_shape_violation() {
        let workdir = tempdir().unwrap();
        let remote = workdir.path().join("remote");
        std::fs::create_dir_all(&remote).unwrap();
        init_bare_remote_with_tag(&remote, "1.0.0", "schemas/x.y.z.json", "type: object\n");
        let mirror = workdir.path().join("mirror");
        let catalog = SchemaCatalog::open(&mirror, remote.to_string_lossy()).unwrap();
        let validator = Validator::new(&catalog, ShapeRegistry::new());

        let msg = SpoolMessage {
            spool_id: "1-m".into(),
            broker_msg_id: "m".into(),
            broker_topic: "org.centos.prod.ci.koji-build.test.complete".into(),
            provider_name: "umb".into(),
            provider_ts: 1,
            header_ts: None,
            body: Value::Null,
            broker_extra: Default::default(),
        };
        let err = validator.validate(&msg).unwrap_err();
        assert_eq!(err.code, ErrorCode::EnvelopeShapeViolation);
    }

    #[test]
    fn ci_topic_missing_version_is_wrong_version_error() {
        let workdir = tempdir().unwrap();
        let remote = workdir.path().join("remote");
        std::fs::create_dir_all(&remote).unwrap();
        init_bare_remote_with_tag(&remote, "1.0.0", "schemas/x.y.z.json", "type: object\n");
        let mirror = workdir.path().join("mirror");
        let catalog = SchemaCatalog::open(&mirror, remote.to_string_lossy()).unwrap();
        let validator = Validator::new(&catalog, ShapeRegistry::new());

        let msg = SpoolMessage {
            spool_id: "1-m".into(),
            broker_msg_id: "m".into(),
            broker_topic: "org.centos.prod.ci.koji-build.test.complete".into(),
            provider_name: "umb".into(),
            provider_ts: 1,
            header_ts: None,
            body: json!({"artifact": {"type": "koji-build"}}),
            broker_extra: Default::default(),
        };
        let err = validator.validate(&msg).unwrap_err();
        assert_eq!(err.code, ErrorCode::WrongVersionError);
    }

    #[test]
    fn relaxed_path_accepts_legacy_zero_x_shape() {
        let workdir = tempdir().unwrap();
        let remote = workdir.path().join("remote");
        std::fs::create_dir_all(&remote).unwrap();
        init_bare_remote_with_tag(&remote, "1.0.0", "schemas/x.y.z.json", "type: object\n");
        let mirror = workdir.path().join("mirror");
        let catalog = SchemaCatalog::open(&mirror, remote.to_string_lossy()).unwrap();
        let validator = Validator::new(&catalog, ShapeRegistry::new());

        let msg = SpoolMessage {
            spool_id: "1-m".into(),
            broker_msg_id: "m".into(),
            broker_topic: "org.centos.prod.ci.koji-build.test.complete".into(),
            provider_name: "umb".into(),
            provider_ts: 1,
            header_ts: None,
            body: json!({"version": "0.2.1", "artifact": {"type": "koji-build"}}),
            broker_extra: Default::default(),
        };
        validator.validate(&msg).unwrap();
    }

    #[test]
    fn relaxed_path_rejects_unknown_artifact_type() {
        let workdir = tempdir().unwrap();
        let remote = workdir.path().join("remote");
        std::fs::create_dir_all(&remote).unwrap();
        init_bare_remote_with_tag(&remote, "1.0.0", "schemas/x.y.z.json", "type: object\n");
        let mirror = workdir.path().join("mirror");
        let catalog = SchemaCatalog::open(&mirror, remote.to_string_lossy()).unwrap();
        let validator = Validator::new(&catalog, ShapeRegistry::new());

        let msg = SpoolMessage {
            spool_id: "1-m".into(),
            broker_msg_id: "m".into(),
            broker_topic: "org.centos.prod.ci.koji-build.test.complete".into(),
            provider_name: "umb".into(),
            provider_ts: 1,
            header_ts: None,
            body: json!({"version": "0.2.1", "artifact": {"type": "not-a-real-type"}}),
            broker_extra: Default::default(),
        };
        let err = validator.validate(&msg).unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
    }

    #[test]
    fn strict_path_validates_against_compiled_schema() {
        let workdir = tempdir().unwrap();
        let remote = workdir.path().join("remote");
        std::fs::create_dir_all(&remote).unwrap();
        init_bare_remote_with_tag(
            &remote,
            "1.0.0",
            "schemas/koji-build.test.complete.json",
            "type: object\nrequired: [artifact]\nproperties:\n  artifact:\n    type: object\n",
        );
        let mirror = workdir.path().join("mirror");
        let catalog = SchemaCatalog::open(&mirror, remote.to_string_lossy()).unwrap();
        let validator = Validator::new(&catalog, ShapeRegistry::new());

        let ok = SpoolMessage {
            spool_id: "1-m".into(),
            broker_msg_id: "m".into(),
            broker_topic: "pipeline.koji-build.test.complete".into(),
            provider_name: "umb".into(),
            provider_ts: 1,
            header_ts: None,
            body: json!({"version": "1.0.0", "artifact": {"type": "koji-build"}}),
            broker_extra: Default::default(),
        };
        validator.validate(&ok).unwrap();

        let bad = SpoolMessage {
            body: json!({"version": "1.0.0"}),
            ..ok
        };
        let err = validator.validate(&bad).unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
    }

    #[test]
    fn non_ci_topic_without_registered_shape_errors() {
        let workdir = tempdir().unwrap();
        let remote = workdir.path().join("remote");
        std::fs::create_dir_all(&remote).unwrap();
        init_bare_remote_with_tag(&remote, "1.0.0", "schemas/x.y.z.json", "type: object\n");
        let mirror = workdir.path().join("mirror");
        let catalog = SchemaCatalog::open(&mirror, remote.to_string_lossy()).unwrap();
        let validator = Validator::new(&catalog, ShapeRegistry::new());

        let msg = SpoolMessage {
            spool_id: "1-m".into(),
            broker_msg_id: "m".into(),
            broker_topic: "org.centos.prod.buildsys.tag".into(),
            provider_name: "umb".into(),
            provider_ts: 1,
            header_ts: None,
            body: json!({"build": {"nvr": "foo-1-1"}}),
            broker_extra: Default::default(),
        };
        let err = validator.validate(&msg).unwrap_err();
        assert_eq!(err.code, ErrorCode::NoValidationSchemaError);
    }

    #[test]
    fn compiled_validator_is_memoized_per_tag_and_path() {
        let workdir = tempdir().unwrap();
        let remote = workdir.path().join("remote");
        std::fs::create_dir_all(&remote).unwrap();
        init_bare_remote_with_tag(
            &remote,
            "1.0.0",
            "schemas/koji-build.test.complete.json",
            "type: object\n",
        );
        let mirror = workdir.path().join("mirror");
        let catalog = SchemaCatalog::open(&mirror, remote.to_string_lossy()).unwrap();
        let validator = Validator::new(&catalog, ShapeRegistry::new());

        let first = validator.compiled_validator("1.0.0", "schemas/koji-build.test.complete.json").unwrap();
        let second = validator.compiled_validator("1.0.0", "schemas/koji-build.test.complete.json").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn denied_issuer_regex_is_case_insensitive() {
        assert!(is_denied_issuer("FreshMaker"));
        assert!(is_denied_issuer("cpaas-bot"));
        assert!(!is_denied_issuer("bodhi"));
    }
}
