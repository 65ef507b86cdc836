//! Artifact identity and the artifact document stored in the document DB,
//! §3.2–§3.3.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed set of artifact families this pipeline understands, §3.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactType {
    /// A Fedora Koji RPM build.
    KojiBuild,
    /// A CentOS Stream Koji RPM build.
    #[serde(rename = "koji-build-cs")]
    KojiBuildCs,
    /// A Copr RPM build.
    CoprBuild,
    /// A Brew (internal build system) RPM or container build.
    BrewBuild,
    /// A Red Hat module build.
    RedhatModule,
    /// A Fedora module build.
    FedoraModule,
    /// A productmd-described compose.
    ProductmdCompose,
    /// A Red Hat container image build.
    RedhatContainerImage,
    /// A dist-git pull request.
    DistGitPr,
}

impl ArtifactType {
    /// Stable kebab-case wire form, matching the `type` field on an
    /// [`ArtifactDocument`].
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KojiBuild => "koji-build",
            Self::KojiBuildCs => "koji-build-cs",
            Self::CoprBuild => "copr-build",
            Self::BrewBuild => "brew-build",
            Self::RedhatModule => "redhat-module",
            Self::FedoraModule => "fedora-module",
            Self::ProductmdCompose => "productmd-compose",
            Self::RedhatContainerImage => "redhat-container-image",
            Self::DistGitPr => "dist-git-pr",
        }
    }
}

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ArtifactType {
    /// Parses the kebab-case wire form back into an [`ArtifactType`],
    /// inverse of [`Self::as_str`]. Used by declarative-shape validation to
    /// reject an unrecognized `artifact.type` discriminator.
    #[must_use]
    pub fn from_wire(wire: &str) -> Option<Self> {
        match wire {
            "koji-build" => Some(Self::KojiBuild),
            "koji-build-cs" => Some(Self::KojiBuildCs),
            "copr-build" => Some(Self::CoprBuild),
            "brew-build" => Some(Self::BrewBuild),
            "redhat-module" => Some(Self::RedhatModule),
            "fedora-module" => Some(Self::FedoraModule),
            "productmd-compose" => Some(Self::ProductmdCompose),
            "redhat-container-image" => Some(Self::RedhatContainerImage),
            "dist-git-pr" => Some(Self::DistGitPr),
            _ => None,
        }
    }
}

/// Pipeline stage a `kai_state` entry was observed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Build stage.
    Build,
    /// Test stage.
    Test,
    /// Dispatch stage.
    Dispatch,
    /// Promote stage.
    Promote,
    /// Gate stage.
    Gate,
}

impl Stage {
    /// Parses a stage from the second-from-end topic segment, per
    /// `make_state`'s topic-derived construction in §4.6. Unknown segments
    /// fall back to `None` so callers can decide how to treat them.
    #[must_use]
    pub fn from_topic_segment(segment: &str) -> Option<Self> {
        match segment {
            "build" => Some(Self::Build),
            "test" => Some(Self::Test),
            "dispatch" => Some(Self::Dispatch),
            "promote" => Some(Self::Promote),
            "gate" => Some(Self::Gate),
            _ => None,
        }
    }
}

/// Outcome state an artifact's pipeline stage reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    /// Queued for processing.
    Queued,
    /// Currently running.
    Running,
    /// Completed (result may still be pass/fail within the payload).
    Complete,
    /// Errored out.
    Error,
}

impl StateKind {
    /// Parses a state from the last topic segment.
    #[must_use]
    pub fn from_topic_segment(segment: &str) -> Option<Self> {
        match segment {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "complete" => Some(Self::Complete),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Who produced a `kai_state` entry and why, per §3.3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Origin {
    /// Component that produced this state, e.g. `"kaijs-loader"`.
    pub creator: String,
    /// Why the state was recorded, e.g. `"broker message"`.
    pub reason: String,
}

/// One observed `(topic, timestamp, stage, state)` triple appended to an
/// artifact's `states[]`, deduplicated by `msg_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct KaiState {
    /// Correlation id grouping messages from the same CI pipeline run.
    pub thread_id: String,
    /// The broker message id this state was derived from; the dedup key.
    pub msg_id: String,
    /// Schema version of the message that produced this state.
    pub version: String,
    /// Pipeline stage.
    pub stage: Stage,
    /// Outcome at that stage.
    pub state: StateKind,
    /// When the state was generated, seconds since epoch.
    pub timestamp: i64,
    /// Who produced this state and why.
    pub origin: Origin,
    /// Dotted test case name; only present for `test`-stage states.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_case_name: Option<String>,
}

/// The one-of family payload carried by an [`ArtifactDocument`], §3.3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactPayload {
    /// RPM build payload (koji/brew/copr builds).
    RpmBuild(Value),
    /// Module build service payload.
    MbsBuild(Value),
    /// Dist-git pull request payload.
    DistGitPr(Value),
    /// Compose payload.
    ProductmdCompose(Value),
}

/// One document per `(artifact_type, artifact_id)` in the document DB, §3.3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactDocument {
    /// Opaque document-DB identity, assigned on first insert.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "_id")]
    pub id: Option<String>,
    /// Monotonically increasing version, starts at 1, bumped on every
    /// successful update.
    #[serde(rename = "_version")]
    pub version: u64,
    /// Immutable after creation; the artifact id within its type.
    pub aid: String,
    /// Immutable after creation; the artifact type.
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    /// Exactly one of the family payload variants.
    pub payload: ArtifactPayload,
    /// One entry per broker message observed for this artifact, deduped by
    /// `kai_state.msg_id`.
    #[serde(default)]
    pub states: Vec<KaiState>,
    /// TTL hint; set only for scratch builds (60 days) and container images
    /// (182 days).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<i64>,
    /// Last-updated timestamp, bumped alongside `_version`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

/// Seconds-per-day constant used for the two TTL policies in §3.3.
const SECS_PER_DAY: i64 = 86_400;

impl ArtifactDocument {
    /// Creates a brand-new, unpersisted document shell for `(type, aid)`,
    /// matching the `$setOnInsert` shape of find-or-create, §4.7.2.
    #[must_use]
    pub fn new_shell(artifact_type: ArtifactType, aid: impl Into<String>) -> Self {
        Self {
            id: None,
            version: 1,
            aid: aid.into(),
            artifact_type,
            payload: ArtifactPayload::RpmBuild(Value::Null),
            states: Vec::new(),
            expire_at: None,
            updated_at: None,
        }
    }

    /// Appends `state` unless an entry with the same `msg_id` already
    /// exists, enforcing the dedup invariant of §3.3/§8.1.
    pub fn push_state_deduped(&mut self, state: KaiState) {
        if !self.states.iter().any(|s| s.msg_id == state.msg_id) {
            self.states.push(state);
        }
    }

    /// `expire_at` for a scratch build: now + 60 days.
    #[must_use]
    pub fn scratch_expiry(now: i64) -> i64 {
        now + 60 * SECS_PER_DAY
    }

    /// `expire_at` for a container image: now + 182 days.
    #[must_use]
    pub fn container_image_expiry(now: i64) -> i64 {
        now + 182 * SECS_PER_DAY
    }
}
