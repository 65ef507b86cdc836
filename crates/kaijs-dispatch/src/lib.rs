//! Topic→handler dispatch and per-handler version→transform lookup, §4.5.
//!
//! Both registries share the same shape: an ordered list of `(regex, key)`
//! pairs, first-match-wins, registered most-specific-first. Neither registry
//! knows about the handler implementations themselves — they return opaque
//! string keys that `kaijs-handlers` resolves against its own handler map,
//! keeping this crate free of the handler logic it routes to.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use kaijs_error::{ErrorCode, KaijsError};
use regex::Regex;

/// Well-known handler keys for the families §4.5 requires the registry to
/// cover. `kaijs-handlers` keys its handler map by these same strings.
pub mod handler_keys {
    /// Brew/koji build-test topics.
    pub const BREW_KOJI_BUILD_TEST: &str = "brew_koji_build_test";
    /// Brew build tag events (container and module builds, gated by tag name).
    pub const BREW_BUILD_TAG: &str = "brew_build_tag";
    /// Brew build complete events, only acted on for container builds.
    pub const BREW_BUILD_COMPLETE: &str = "brew_build_complete";
    /// Koji `buildsys.tag` events (fedora, centos-stream).
    pub const BUILDSYS_TAG: &str = "buildsys_tag";
    /// Module build service test topics.
    pub const MBS_TEST: &str = "mbs_test";
    /// Compose test/build topics.
    pub const COMPOSE: &str = "compose";
    /// Container-image test topics.
    pub const CONTAINER_IMAGE_TEST: &str = "container_image_test";
    /// Errata-tool automation finished events.
    pub const ERRATA_AUTOMATION_FINISHED: &str = "errata_automation_finished";
}

/// An ordered `(regex, key)` registry: first registered match wins.
#[derive(Debug, Default)]
pub struct DispatchRegistry {
    entries: Vec<(Regex, String)>,
}

impl DispatchRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Registers `pattern → key`. Later registrations are only reached if
    /// no earlier pattern matches, so callers must register most-specific
    /// patterns first.
    pub fn register(&mut self, pattern: &str, key: impl Into<String>) -> Result<(), KaijsError> {
        let re = Regex::new(pattern)
            .map_err(|e| KaijsError::new(ErrorCode::Internal, format!("bad dispatch pattern {pattern}: {e}")))?;
        self.entries.push((re, key.into()));
        Ok(())
    }

    /// Returns the key of the first pattern matching `topic`.
    #[must_use]
    pub fn resolve(&self, topic: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(re, _)| re.is_match(topic))
            .map(|(_, key)| key.as_str())
    }

    /// Resolves `topic`, raising `NoAssociatedHandlerError` if nothing matches.
    pub fn resolve_or_err(&self, topic: &str) -> Result<&str, KaijsError> {
        self.resolve(topic).ok_or_else(|| {
            KaijsError::new(
                ErrorCode::NoAssociatedHandlerError,
                format!("no dispatch handler matches topic {topic}"),
            )
            .with_context("topic", topic)
        })
    }

    /// Number of registered patterns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry has no patterns registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Builds the default topic→handler registry covering every family §4.5
/// requires, in most-specific-first order.
pub fn default_registry() -> Result<DispatchRegistry, KaijsError> {
    let mut r = DispatchRegistry::new();
    r.register(
        r"\.ci\..*\.brew-build\.test\.(complete|queued|running|error)$",
        handler_keys::BREW_KOJI_BUILD_TEST,
    )?;
    r.register(
        r"^org\.centos\.prod\.ci\.koji-build\.test\.",
        handler_keys::BREW_KOJI_BUILD_TEST,
    )?;
    r.register(r"\.brew-build\.tag$", handler_keys::BREW_BUILD_TAG)?;
    r.register(r"\.brew-build\.complete$", handler_keys::BREW_BUILD_COMPLETE)?;
    r.register(r"\.buildsys\.tag$", handler_keys::BUILDSYS_TAG)?;
    r.register(r"\.ci\..*\.redhat-module\.test\.", handler_keys::MBS_TEST)?;
    r.register(
        r"^org\.centos\.prod\.ci\.fedora-module\.test\.",
        handler_keys::MBS_TEST,
    )?;
    r.register(r"\.productmd-compose\.(test|build)\.", handler_keys::COMPOSE)?;
    r.register(
        r"\.ci\..*\.redhat-container-image\.test\.",
        handler_keys::CONTAINER_IMAGE_TEST,
    )?;
    r.register(
        r"\.errata_automation\.brew-build\.run\.finished$",
        handler_keys::ERRATA_AUTOMATION_FINISHED,
    )?;
    Ok(r)
}

/// Per-handler `version → transform` registry: the first regex matching the
/// message version yields the transform key. A catch-all `/^.*$/` is always
/// consulted last, defaulting to `"v1"`.
#[derive(Debug)]
pub struct TransformRegistry {
    entries: Vec<(Regex, String)>,
    default_key: String,
}

impl TransformRegistry {
    /// Creates a registry whose catch-all fallback resolves to `default_key`
    /// (typically `"v1"`).
    #[must_use]
    pub fn new(default_key: impl Into<String>) -> Self {
        Self {
            entries: Vec::new(),
            default_key: default_key.into(),
        }
    }

    /// Registers `version_pattern → transform_key`, checked before the
    /// catch-all default.
    pub fn register(&mut self, version_pattern: &str, transform_key: impl Into<String>) -> Result<(), KaijsError> {
        let re = Regex::new(version_pattern).map_err(|e| {
            KaijsError::new(
                ErrorCode::Internal,
                format!("bad transform version pattern {version_pattern}: {e}"),
            )
        })?;
        self.entries.push((re, transform_key.into()));
        Ok(())
    }

    /// Resolves `version` to a transform key; always succeeds via the
    /// catch-all default.
    #[must_use]
    pub fn resolve(&self, version: &str) -> &str {
        self.entries
            .iter()
            .find(|(re, _)| re.is_match(version))
            .map(|(_, key)| key.as_str())
            .unwrap_or(&self.default_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn most_specific_pattern_wins_over_broader_later_entry() {
        let mut r = DispatchRegistry::new();
        r.register(r"^a\.b\.c$", "specific").unwrap();
        r.register(r"^a\..*$", "broad").unwrap();
        assert_eq!(r.resolve("a.b.c"), Some("specific"));
        assert_eq!(r.resolve("a.x.y"), Some("broad"));
    }

    #[test]
    fn unmatched_topic_raises_no_associated_handler() {
        let r = DispatchRegistry::new();
        let err = r.resolve_or_err("nothing.matches").unwrap_err();
        assert_eq!(err.code, ErrorCode::NoAssociatedHandlerError);
    }

    #[test]
    fn default_registry_covers_every_listed_family() {
        let r = default_registry().unwrap();
        assert_eq!(
            r.resolve("org.fedoraproject.prod.ci.brew-build.test.complete"),
            Some(handler_keys::BREW_KOJI_BUILD_TEST)
        );
        assert_eq!(
            r.resolve("org.centos.prod.ci.koji-build.test.queued"),
            Some(handler_keys::BREW_KOJI_BUILD_TEST)
        );
        assert_eq!(
            r.resolve("org.fedoraproject.prod.buildsys.brew-build.tag"),
            Some(handler_keys::BREW_BUILD_TAG)
        );
        assert_eq!(
            r.resolve("org.fedoraproject.prod.buildsys.brew-build.complete"),
            Some(handler_keys::BREW_BUILD_COMPLETE)
        );
        assert_eq!(
            r.resolve("org.fedoraproject.prod.buildsys.buildsys.tag"),
            Some(handler_keys::BUILDSYS_TAG)
        );
        assert_eq!(
            r.resolve("org.fedoraproject.prod.ci.redhat-module.test.complete"),
            Some(handler_keys::MBS_TEST)
        );
        assert_eq!(
            r.resolve("org.centos.prod.ci.fedora-module.test.complete"),
            Some(handler_keys::MBS_TEST)
        );
        assert_eq!(
            r.resolve("org.fedoraproject.prod.productmd-compose.test.complete"),
            Some(handler_keys::COMPOSE)
        );
        assert_eq!(
            r.resolve("org.fedoraproject.prod.ci.redhat-container-image.test.complete"),
            Some(handler_keys::CONTAINER_IMAGE_TEST)
        );
        assert_eq!(
            r.resolve("org.fedoraproject.prod.errata_automation.brew-build.run.finished"),
            Some(handler_keys::ERRATA_AUTOMATION_FINISHED)
        );
    }

    #[test]
    fn transform_registry_falls_back_to_catch_all_default() {
        let mut t = TransformRegistry::new("v1");
        t.register(r"^2\.", "v2").unwrap();
        assert_eq!(t.resolve("2.3.0"), "v2");
        assert_eq!(t.resolve("1.0.0"), "v1");
        assert_eq!(t.resolve("anything"), "v1");
    }
}
