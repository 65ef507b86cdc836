//! Per-artifact-family payload transforms, keyed by the dispatch keys
//! `kaijs-dispatch` resolves a topic to (§4.6).
//!
//! Every handler turns one [`SpoolMessage`] into a [`HandlerOutcome`]: the
//! artifact identity, the one-of payload to merge into the document DB, a
//! freshly derived [`KaiState`] to append, and the flattened projections the
//! index writer needs. `NoNeedToProcessError` is the handler's way of saying
//! "this message is real but routine, drop it silently" — it is not a
//! validation failure.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use kaijs_error::{ErrorCode, KaijsError};
use kaijs_model::{
    derive_test_case_name, derive_thread_id, ArtifactPayload, ArtifactType, KaiState, Origin,
    SpoolMessage, Stage, StateKind,
};
use kaijs_xmlrpc::BuildsysClient;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

pub use kaijs_dispatch::handler_keys;

/// What a handler hands back to the loader: the artifact identity, the
/// document-DB payload, the state to append, and the two flattened
/// projections `kaijs-index` turns into [`kaijs_model::ParentDoc`] /
/// [`kaijs_model::ChildDoc`] searchables.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutcome {
    /// The artifact family this message belongs to.
    pub artifact_type: ArtifactType,
    /// The artifact id within its type.
    pub aid: String,
    /// The one-of payload to merge into the artifact document.
    pub payload: ArtifactPayload,
    /// The state entry to append (deduplicated by `msg_id` downstream).
    pub state: KaiState,
    /// Flattened fields for the parent (artifact-level) search document.
    pub parent_searchable: Value,
    /// Flattened fields for the child (per-message) search document.
    pub child_searchable: Value,
    /// Whether this artifact is a scratch build, per §3.3's 60-day TTL.
    /// Always `false` for artifact families that have no scratch concept
    /// (modules, composes, container images, pull requests).
    pub scratch: bool,
}

/// A per-family payload transform. Implementations are pure aside from
/// [`BuildsysTagHandler`], which performs the one external enrichment call
/// this pipeline makes.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Transforms `msg` (already validated against `version`'s schema) into
    /// a [`HandlerOutcome`], or raises `NoNeedToProcessError` to drop it.
    async fn transform(&self, msg: &SpoolMessage, version: &str) -> Result<HandlerOutcome, KaijsError>;
}

/// Builds the `KaiState` for a CI-shaped topic whose last two segments are a
/// recognized `(stage, state)` pair, per §4.6's `make_state` rule.
pub fn make_state(msg: &SpoolMessage, version: &str) -> Result<KaiState, KaijsError> {
    let segments: Vec<&str> = msg.broker_topic.split('.').collect();
    if segments.len() < 2 {
        return Err(KaijsError::new(
            ErrorCode::EnvelopeShapeViolation,
            format!("topic {:?} has too few segments to derive stage/state", msg.broker_topic),
        ));
    }
    let state_seg = segments[segments.len() - 1];
    let stage_seg = segments[segments.len() - 2];
    let stage = Stage::from_topic_segment(stage_seg).ok_or_else(|| {
        KaijsError::new(
            ErrorCode::EnvelopeShapeViolation,
            format!("topic segment {stage_seg:?} is not a known stage"),
        )
        .with_context("topic", msg.broker_topic.clone())
    })?;
    let state = StateKind::from_topic_segment(state_seg).ok_or_else(|| {
        KaijsError::new(
            ErrorCode::EnvelopeShapeViolation,
            format!("topic segment {state_seg:?} is not a known state"),
        )
        .with_context("topic", msg.broker_topic.clone())
    })?;
    make_state_with(stage, state, msg, version)
}

/// Builds the `KaiState` for a topic whose shape doesn't carry a `(stage,
/// state)` pair in its last two segments (tag/complete/automation events):
/// the handler names the synthetic stage/state directly instead of parsing
/// the topic.
fn make_state_with(stage: Stage, state: StateKind, msg: &SpoolMessage, version: &str) -> Result<KaiState, KaijsError> {
    let test_case_name = derive_test_case_name(&msg.body, stage, version)?;
    let thread_id = derive_thread_id(&msg.body, stage, test_case_name.as_deref())?;
    let timestamp = extract_timestamp(&msg.body, msg.provider_ts);
    Ok(KaiState {
        thread_id,
        msg_id: msg.broker_msg_id.clone(),
        version: version.to_string(),
        stage,
        state,
        timestamp,
        origin: Origin {
            creator: "kaijs-loader".into(),
            reason: "broker message".into(),
        },
        test_case_name,
    })
}

fn extract_timestamp(body: &Value, fallback: i64) -> i64 {
    body.get("generated_at")
        .and_then(Value::as_str)
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp())
        .unwrap_or(fallback)
}

fn value_as_id_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Brew/koji build-test topics: generic RPM/module test-stage projection,
/// artifact type read straight from the already-validated `artifact.type`.
pub struct BrewKojiBuildTestHandler;

#[async_trait]
impl Handler for BrewKojiBuildTestHandler {
    async fn transform(&self, msg: &SpoolMessage, version: &str) -> Result<HandlerOutcome, KaijsError> {
        let body = &msg.body;
        let artifact_type = body
            .pointer("/artifact/type")
            .and_then(Value::as_str)
            .and_then(ArtifactType::from_wire)
            .unwrap_or(ArtifactType::BrewBuild);
        let aid = body
            .pointer("/artifact/id")
            .and_then(value_as_id_string)
            .ok_or_else(|| {
                KaijsError::new(ErrorCode::EnvelopeShapeViolation, "test message missing artifact.id")
                    .with_context("topic", msg.broker_topic.clone())
            })?;
        let state = make_state(msg, version)?;
        let nvr = body.pointer("/artifact/nvr").and_then(Value::as_str).unwrap_or_default();
        let scratch = body.pointer("/artifact/scratch").and_then(Value::as_bool).unwrap_or(false);
        let parent_searchable = json!({"type": artifact_type.as_str(), "aid": aid, "nvr": nvr, "scratch": scratch});
        let child_searchable = json!({"stage": state.stage, "state": state.state, "test_case_name": state.test_case_name});
        Ok(HandlerOutcome {
            artifact_type,
            aid,
            payload: ArtifactPayload::RpmBuild(body.clone()),
            state,
            parent_searchable,
            child_searchable,
            scratch,
        })
    }
}

fn rpm_gate_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(supp-)?rhel-[89]\.\d+(\.\d+)?(-z)?-gate$").unwrap())
}

fn module_gate_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(supp-)?rhel-[89]\.\d+(\.\d+)?(-z)?-modules-gate$").unwrap())
}

/// Brew build-tag events: branches on `build.extra.typeinfo.module.*`
/// presence to pick the RPM vs. module gate-tag pattern, dropping any tag
/// event that isn't a recognized gate tag.
pub struct BrewBuildTagHandler;

#[async_trait]
impl Handler for BrewBuildTagHandler {
    async fn transform(&self, msg: &SpoolMessage, version: &str) -> Result<HandlerOutcome, KaijsError> {
        let body = &msg.body;
        let tag = body
            .pointer("/tag/name")
            .and_then(Value::as_str)
            .or_else(|| body.get("tag").and_then(Value::as_str))
            .ok_or_else(|| {
                KaijsError::new(ErrorCode::EnvelopeShapeViolation, "brew-build.tag message missing tag name")
            })?;

        let is_module = body
            .pointer("/build/extra/typeinfo/module/module_build_service_id")
            .is_some();
        let gate_re = if is_module { module_gate_tag_re() } else { rpm_gate_tag_re() };
        if !gate_re.is_match(tag) {
            return Err(KaijsError::new(
                ErrorCode::NoNeedToProcessError,
                format!("tag {tag:?} is not a gate tag"),
            )
            .with_context("topic", msg.broker_topic.clone()));
        }

        let artifact_type = if is_module { ArtifactType::RedhatModule } else { ArtifactType::BrewBuild };
        let aid = body
            .pointer("/build/build_id")
            .or_else(|| body.pointer("/build/id"))
            .and_then(value_as_id_string)
            .ok_or_else(|| {
                KaijsError::new(ErrorCode::EnvelopeShapeViolation, "brew-build.tag message missing build id")
            })?;
        let nvr = body.pointer("/build/nvr").and_then(Value::as_str).unwrap_or_default();
        let state = make_state_with(Stage::Build, StateKind::Complete, msg, version)?;
        let payload = if is_module {
            ArtifactPayload::MbsBuild(body.clone())
        } else {
            ArtifactPayload::RpmBuild(body.clone())
        };
        let parent_searchable = json!({"type": artifact_type.as_str(), "aid": aid, "nvr": nvr, "tag": tag});
        let child_searchable = json!({"stage": state.stage, "state": state.state, "tag": tag});
        Ok(HandlerOutcome {
            artifact_type,
            aid,
            payload,
            state,
            parent_searchable,
            child_searchable,
            scratch: false,
        })
    }
}

/// Brew build-complete events: only container builds are of interest here,
/// everything else is routine RPM-build completion traffic and is dropped.
pub struct BrewBuildCompleteHandler;

#[async_trait]
impl Handler for BrewBuildCompleteHandler {
    async fn transform(&self, msg: &SpoolMessage, version: &str) -> Result<HandlerOutcome, KaijsError> {
        let body = &msg.body;
        let kind = body.pointer("/info/extra/osbs_build/kind").and_then(Value::as_str);
        if kind != Some("container_build") {
            return Err(KaijsError::new(
                ErrorCode::NoNeedToProcessError,
                "brew-build.complete is not a container build",
            )
            .with_context("topic", msg.broker_topic.clone()));
        }
        let aid = body
            .pointer("/info/build_id")
            .or_else(|| body.pointer("/info/id"))
            .and_then(value_as_id_string)
            .ok_or_else(|| {
                KaijsError::new(ErrorCode::EnvelopeShapeViolation, "brew-build.complete missing info.build_id")
            })?;
        let nvr = body.pointer("/info/nvr").and_then(Value::as_str).unwrap_or_default();
        let state = make_state_with(Stage::Build, StateKind::Complete, msg, version)?;
        let parent_searchable = json!({"type": ArtifactType::RedhatContainerImage.as_str(), "aid": aid, "nvr": nvr});
        let child_searchable = json!({"stage": state.stage, "state": state.state});
        Ok(HandlerOutcome {
            artifact_type: ArtifactType::RedhatContainerImage,
            aid,
            payload: ArtifactPayload::RpmBuild(body.clone()),
            state,
            parent_searchable,
            child_searchable,
            scratch: false,
        })
    }
}

/// Koji `buildsys.tag` events: enriches via the one external `getBuild`
/// XML-RPC lookup, retried per [`kaijs_retry::RetryConfig::buildsys_default`]
/// inside the client, and rejects a reply missing the fields a real
/// `koji_build_info` schema would require.
pub struct BuildsysTagHandler {
    client: Arc<dyn BuildsysClient>,
}

impl BuildsysTagHandler {
    /// Builds a handler that enriches through `client`.
    #[must_use]
    pub fn new(client: Arc<dyn BuildsysClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Handler for BuildsysTagHandler {
    async fn transform(&self, msg: &SpoolMessage, version: &str) -> Result<HandlerOutcome, KaijsError> {
        let body = &msg.body;
        let build_id = body
            .get("build_id")
            .and_then(Value::as_u64)
            .ok_or_else(|| KaijsError::new(ErrorCode::EnvelopeShapeViolation, "buildsys.tag missing build_id"))?;

        let info = self.client.get_build(build_id).await?;
        let nvr = info.raw.get("nvr").and_then(Value::as_str).ok_or_else(|| {
            KaijsError::new(
                ErrorCode::ValidationError,
                "getBuild response is missing nvr, fails koji_build_info validation",
            )
        })?;
        let task_id = info.raw.get("task_id").and_then(value_as_id_string).ok_or_else(|| {
            KaijsError::new(
                ErrorCode::ValidationError,
                "getBuild response is missing task_id, fails koji_build_info validation",
            )
        })?;

        let issuer = body.get("owner").and_then(Value::as_str).unwrap_or_default();
        let component = body.get("name").and_then(Value::as_str).unwrap_or_default();
        let scratch = info.raw.get("scratch").and_then(Value::as_bool).unwrap_or(false);

        let aid = task_id.clone();
        let state = make_state_with(Stage::Build, StateKind::Complete, msg, version)?;
        let payload = json!({
            "task_id": task_id,
            "build_id": build_id.to_string(),
            "nvr": nvr,
            "issuer": issuer,
            "component": component,
            "scratch": scratch,
        });
        let parent_searchable = json!({"type": ArtifactType::KojiBuild.as_str(), "aid": aid, "nvr": nvr, "scratch": scratch});
        let child_searchable = json!({"stage": state.stage, "state": state.state});
        Ok(HandlerOutcome {
            artifact_type: ArtifactType::KojiBuild,
            aid,
            payload: ArtifactPayload::RpmBuild(payload),
            state,
            parent_searchable,
            child_searchable,
            scratch,
        })
    }
}

/// Module build service test topics: same shape as
/// [`BrewKojiBuildTestHandler`], defaulting the artifact type to a module
/// when the discriminator is missing.
pub struct MbsTestHandler;

#[async_trait]
impl Handler for MbsTestHandler {
    async fn transform(&self, msg: &SpoolMessage, version: &str) -> Result<HandlerOutcome, KaijsError> {
        let body = &msg.body;
        let artifact_type = body
            .pointer("/artifact/type")
            .and_then(Value::as_str)
            .and_then(ArtifactType::from_wire)
            .unwrap_or(ArtifactType::RedhatModule);
        let aid = body
            .pointer("/artifact/id")
            .and_then(value_as_id_string)
            .ok_or_else(|| KaijsError::new(ErrorCode::EnvelopeShapeViolation, "mbs test message missing artifact.id"))?;
        let state = make_state(msg, version)?;
        let nsvc = body.pointer("/artifact/nsvc").and_then(Value::as_str).unwrap_or_default();
        let parent_searchable = json!({"type": artifact_type.as_str(), "aid": aid, "nsvc": nsvc});
        let child_searchable = json!({"stage": state.stage, "state": state.state, "test_case_name": state.test_case_name});
        Ok(HandlerOutcome {
            artifact_type,
            aid,
            payload: ArtifactPayload::MbsBuild(body.clone()),
            state,
            parent_searchable,
            child_searchable,
            scratch: false,
        })
    }
}

/// Productmd-compose test/build topics.
pub struct ComposeHandler;

#[async_trait]
impl Handler for ComposeHandler {
    async fn transform(&self, msg: &SpoolMessage, version: &str) -> Result<HandlerOutcome, KaijsError> {
        let body = &msg.body;
        let aid = body
            .pointer("/artifact/id")
            .and_then(value_as_id_string)
            .ok_or_else(|| KaijsError::new(ErrorCode::EnvelopeShapeViolation, "compose message missing artifact.id"))?;
        let state = make_state(msg, version)?;
        let compose_id = body
            .pointer("/artifact/compose_id")
            .and_then(Value::as_str)
            .unwrap_or(&aid)
            .to_string();
        let parent_searchable = json!({"type": ArtifactType::ProductmdCompose.as_str(), "aid": aid, "compose_id": compose_id});
        let child_searchable = json!({"stage": state.stage, "state": state.state});
        Ok(HandlerOutcome {
            artifact_type: ArtifactType::ProductmdCompose,
            aid,
            payload: ArtifactPayload::ProductmdCompose(body.clone()),
            state,
            parent_searchable,
            child_searchable,
            scratch: false,
        })
    }
}

const MANIFEST_LIST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

/// Container-image test topics: the artifact id is the manifest-list
/// digest, not a build id.
pub struct ContainerImageTestHandler;

#[async_trait]
impl Handler for ContainerImageTestHandler {
    async fn transform(&self, msg: &SpoolMessage, version: &str) -> Result<HandlerOutcome, KaijsError> {
        let body = &msg.body;
        let digests = body
            .pointer("/artifact/info/extra/image/index/digests")
            .or_else(|| body.pointer("/info/extra/image/index/digests"))
            .ok_or_else(|| {
                KaijsError::new(
                    ErrorCode::EnvelopeShapeViolation,
                    "container image message missing info.extra.image.index.digests",
                )
            })?;
        let aid = digests
            .get(MANIFEST_LIST_MEDIA_TYPE)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                KaijsError::new(ErrorCode::EnvelopeShapeViolation, "no manifest-list digest in image.index.digests")
            })?
            .to_string();
        let state = make_state(msg, version)?;
        let parent_searchable = json!({"type": ArtifactType::RedhatContainerImage.as_str(), "aid": aid});
        let child_searchable = json!({"stage": state.stage, "state": state.state, "test_case_name": state.test_case_name});
        Ok(HandlerOutcome {
            artifact_type: ArtifactType::RedhatContainerImage,
            aid,
            payload: ArtifactPayload::RpmBuild(body.clone()),
            state,
            parent_searchable,
            child_searchable,
            scratch: false,
        })
    }
}

/// Errata-tool automation finished events: extra-light schema, `task_id`
/// may be null.
pub struct ErrataAutomationFinishedHandler;

#[async_trait]
impl Handler for ErrataAutomationFinishedHandler {
    async fn transform(&self, msg: &SpoolMessage, version: &str) -> Result<HandlerOutcome, KaijsError> {
        let body = &msg.body;
        let aid = body
            .pointer("/build/build_id")
            .or_else(|| body.pointer("/build_id"))
            .and_then(value_as_id_string)
            .ok_or_else(|| {
                KaijsError::new(ErrorCode::EnvelopeShapeViolation, "errata automation message missing build_id")
            })?;
        let task_id = body.pointer("/task_id").and_then(value_as_id_string);
        let state = make_state_with(Stage::Gate, StateKind::Complete, msg, version)?;
        let parent_searchable = json!({"type": ArtifactType::BrewBuild.as_str(), "aid": aid});
        let child_searchable = json!({"stage": state.stage, "state": state.state, "task_id": task_id});
        Ok(HandlerOutcome {
            artifact_type: ArtifactType::BrewBuild,
            aid,
            payload: ArtifactPayload::RpmBuild(body.clone()),
            state,
            parent_searchable,
            child_searchable,
            scratch: false,
        })
    }
}

/// Handler map keyed by `kaijs_dispatch::handler_keys`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `key`.
    pub fn register(&mut self, key: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(key.into(), handler);
    }

    /// Looks up the handler registered for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(key)
    }
}

/// Builds the registry covering every handler key `kaijs_dispatch` resolves
/// to, with `buildsys_client` wired into the one enrichment-performing
/// handler.
#[must_use]
pub fn default_registry(buildsys_client: Arc<dyn BuildsysClient>) -> HandlerRegistry {
    let mut r = HandlerRegistry::new();
    r.register(handler_keys::BREW_KOJI_BUILD_TEST, Arc::new(BrewKojiBuildTestHandler));
    r.register(handler_keys::BREW_BUILD_TAG, Arc::new(BrewBuildTagHandler));
    r.register(handler_keys::BREW_BUILD_COMPLETE, Arc::new(BrewBuildCompleteHandler));
    r.register(handler_keys::BUILDSYS_TAG, Arc::new(BuildsysTagHandler::new(buildsys_client)));
    r.register(handler_keys::MBS_TEST, Arc::new(MbsTestHandler));
    r.register(handler_keys::COMPOSE, Arc::new(ComposeHandler));
    r.register(handler_keys::CONTAINER_IMAGE_TEST, Arc::new(ContainerImageTestHandler));
    r.register(handler_keys::ERRATA_AUTOMATION_FINISHED, Arc::new(ErrataAutomationFinishedHandler));
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use kaijs_xmlrpc::MockBuildsysClient;

    fn msg(topic: &str, body: Value) -> SpoolMessage {
        SpoolMessage {
            spool_id: "1-m1".into(),
            broker_msg_id: "m1".into(),
            broker_topic: topic.into(),
            provider_name: "umb".into(),
            provider_ts: 1_700_000_000,
            header_ts: None,
            body,
            broker_extra: Default::default(),
        }
    }

    #[tokio::test]
    async fn brew_koji_build_test_projects_artifact_and_state() {
        let body = json!({
            "artifact": {"type": "brew-build", "id": 111, "nvr": "foo-1-1", "scratch": false},
            "run": {"url": "https://example.com/run/1"},
        });
        let envelope = msg("VirtualTopic.eng.ci.osci.brew-build.test.complete", body);
        let outcome = BrewKojiBuildTestHandler.transform(&envelope, "1.0.0").await.unwrap();
        assert_eq!(outcome.artifact_type, ArtifactType::BrewBuild);
        assert_eq!(outcome.aid, "111");
        assert_eq!(outcome.state.stage, Stage::Test);
        assert_eq!(outcome.state.state, StateKind::Complete);
    }

    #[tokio::test]
    async fn brew_koji_build_test_rejects_missing_artifact_id() {
        let envelope = msg("VirtualTopic.eng.ci.osci.brew-build.test.complete", json!({}));
        let err = BrewKojiBuildTestHandler.transform(&envelope, "1.0.0").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::EnvelopeShapeViolation);
    }

    #[tokio::test]
    async fn brew_build_tag_rpm_gate_tag_is_processed() {
        let body = json!({
            "tag": {"name": "rhel-9.4-gate"},
            "build": {"build_id": 555, "nvr": "bar-2-2"},
            "run": {"url": "https://example.com/run/2"},
        });
        let envelope = msg("org.fedoraproject.prod.buildsys.brew-build.tag", body);
        let outcome = BrewBuildTagHandler.transform(&envelope, "1.0.0").await.unwrap();
        assert_eq!(outcome.artifact_type, ArtifactType::BrewBuild);
        assert_eq!(outcome.aid, "555");
    }

    #[tokio::test]
    async fn brew_build_tag_module_build_uses_module_gate_regex() {
        let body = json!({
            "tag": {"name": "rhel-9.4-modules-gate"},
            "build": {
                "build_id": 556,
                "nvr": "module-2-2",
                "extra": {"typeinfo": {"module": {"module_build_service_id": 99}}}
            },
        });
        let envelope = msg("org.fedoraproject.prod.buildsys.brew-build.tag", body);
        let outcome = BrewBuildTagHandler.transform(&envelope, "1.0.0").await.unwrap();
        assert_eq!(outcome.artifact_type, ArtifactType::RedhatModule);
    }

    #[tokio::test]
    async fn brew_build_tag_non_gate_tag_is_dropped_silently() {
        let body = json!({"tag": {"name": "f40-updates-candidate"}, "build": {"build_id": 1}});
        let envelope = msg("org.fedoraproject.prod.buildsys.brew-build.tag", body);
        let err = BrewBuildTagHandler.transform(&envelope, "1.0.0").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NoNeedToProcessError);
    }

    #[tokio::test]
    async fn brew_build_complete_ignores_non_container_builds() {
        let body = json!({"info": {"build_id": 1, "extra": {"osbs_build": {"kind": "rpm_build"}}}});
        let envelope = msg("org.fedoraproject.prod.buildsys.brew-build.complete", body);
        let err = BrewBuildCompleteHandler.transform(&envelope, "1.0.0").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NoNeedToProcessError);
    }

    #[tokio::test]
    async fn brew_build_complete_processes_container_builds() {
        let body = json!({
            "info": {"build_id": 2, "nvr": "img-1-1", "extra": {"osbs_build": {"kind": "container_build"}}},
        });
        let envelope = msg("org.fedoraproject.prod.buildsys.brew-build.complete", body);
        let outcome = BrewBuildCompleteHandler.transform(&envelope, "1.0.0").await.unwrap();
        assert_eq!(outcome.artifact_type, ArtifactType::RedhatContainerImage);
        assert_eq!(outcome.aid, "2");
    }

    #[tokio::test]
    async fn buildsys_tag_enriches_via_client_and_validates_nvr() {
        let client: Arc<dyn BuildsysClient> = Arc::new(
            MockBuildsysClient::new().with_response(1_728_223, json!({"task_id": 111, "nvr": "enriched-3-3"})),
        );
        let handler = BuildsysTagHandler::new(client);
        let body = json!({"build_id": 1_728_223, "tag": "f33-updates", "owner": "bodhi", "name": "gcompris-qt"});
        let envelope = msg("org.fedoraproject.prod.buildsys.buildsys.tag", body);
        let outcome = handler.transform(&envelope, "1.0.0").await.unwrap();
        assert_eq!(outcome.artifact_type, ArtifactType::KojiBuild);
        assert_eq!(outcome.aid, "111");
        assert_eq!(outcome.parent_searchable["nvr"], json!("enriched-3-3"));
        assert_eq!(outcome.payload, ArtifactPayload::RpmBuild(json!({
            "task_id": "111",
            "build_id": "1728223",
            "nvr": "enriched-3-3",
            "issuer": "bodhi",
            "component": "gcompris-qt",
            "scratch": false,
        })));
    }

    #[tokio::test]
    async fn buildsys_tag_rejects_reply_missing_nvr() {
        let client: Arc<dyn BuildsysClient> =
            Arc::new(MockBuildsysClient::new().with_response(7, json!({"task_id": 70, "build_id": 7})));
        let handler = BuildsysTagHandler::new(client);
        let envelope = msg("org.fedoraproject.prod.buildsys.buildsys.tag", json!({"build_id": 7}));
        let err = handler.transform(&envelope, "1.0.0").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn buildsys_tag_rejects_reply_missing_task_id() {
        let client: Arc<dyn BuildsysClient> =
            Arc::new(MockBuildsysClient::new().with_response(8, json!({"nvr": "foo-1-1"})));
        let handler = BuildsysTagHandler::new(client);
        let envelope = msg("org.fedoraproject.prod.buildsys.buildsys.tag", json!({"build_id": 8}));
        let err = handler.transform(&envelope, "1.0.0").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn container_image_test_uses_manifest_list_digest_as_id() {
        let body = json!({
            "info": {"extra": {"image": {"index": {"digests": {
                MANIFEST_LIST_MEDIA_TYPE: "sha256:abc123",
                "application/vnd.docker.distribution.manifest.v2+json": "sha256:def456",
            }}}}},
            "run": {"url": "https://example.com/run/3"},
        });
        let envelope = msg("VirtualTopic.eng.ci.osci.redhat-container-image.test.complete", body);
        let outcome = ContainerImageTestHandler.transform(&envelope, "1.0.0").await.unwrap();
        assert_eq!(outcome.aid, "sha256:abc123");
    }

    #[tokio::test]
    async fn errata_automation_finished_allows_null_task_id() {
        let body = json!({"build_id": 9, "task_id": null, "run": {"url": "https://example.com/run/4"}});
        let envelope = msg("org.fedoraproject.prod.errata_automation.brew-build.run.finished", body);
        let outcome = ErrataAutomationFinishedHandler.transform(&envelope, "1.0.0").await.unwrap();
        assert_eq!(outcome.aid, "9");
        assert_eq!(outcome.child_searchable["task_id"], Value::Null);
    }

    #[test]
    fn gate_tag_regexes_distinguish_rpm_and_module_forms() {
        assert!(rpm_gate_tag_re().is_match("rhel-8.10-gate"));
        assert!(rpm_gate_tag_re().is_match("supp-rhel-9.2-z-gate"));
        assert!(!rpm_gate_tag_re().is_match("rhel-8.10-modules-gate"));
        assert!(module_gate_tag_re().is_match("rhel-9.2-modules-gate"));
        assert!(!module_gate_tag_re().is_match("f40-updates-candidate"));
    }

    #[test]
    fn default_registry_covers_every_handler_key() {
        let client: Arc<dyn BuildsysClient> = Arc::new(MockBuildsysClient::new());
        let registry = default_registry(client);
        for key in [
            handler_keys::BREW_KOJI_BUILD_TEST,
            handler_keys::BREW_BUILD_TAG,
            handler_keys::BREW_BUILD_COMPLETE,
            handler_keys::BUILDSYS_TAG,
            handler_keys::MBS_TEST,
            handler_keys::COMPOSE,
            handler_keys::CONTAINER_IMAGE_TEST,
            handler_keys::ERRATA_AUTOMATION_FINISHED,
        ] {
            assert!(registry.get(key).is_some(), "missing handler for {key}");
        }
        assert!(registry.get("unknown_key").is_none());
    }
}
