//! Git-mirror schema catalog (§4.3).
//!
//! Maintains a bare mirror of the schemas repository on disk and resolves
//! `refs/tags/<tag>:<path>` lookups against it. Shells out to the system
//! `git` binary rather than a `git2` binding, following the teacher's own
//! git-wrapper crate.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use kaijs_error::{ErrorCode, KaijsError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default scheduled-refresh interval, §3.7 `schema_refresh_hours` default.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// A Git-mirror-backed catalog of JSON-Schema (and declarative-shape) files.
pub struct SchemaCatalog {
    mirror_dir: PathBuf,
    remote_url: String,
    refresh_interval: Duration,
    last_fetch: Mutex<Option<Instant>>,
    file_cache: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl SchemaCatalog {
    /// Opens (cloning if necessary) a bare mirror of `remote_url` at `mirror_dir`.
    pub fn open(mirror_dir: impl Into<PathBuf>, remote_url: impl Into<String>) -> Result<Self, KaijsError> {
        Self::open_with_refresh_interval(mirror_dir, remote_url, DEFAULT_REFRESH_INTERVAL)
    }

    /// Like [`Self::open`] but with an explicit refresh interval, for tests.
    pub fn open_with_refresh_interval(
        mirror_dir: impl Into<PathBuf>,
        remote_url: impl Into<String>,
        refresh_interval: Duration,
    ) -> Result<Self, KaijsError> {
        let mirror_dir = mirror_dir.into();
        let remote_url = remote_url.into();
        let catalog = Self {
            mirror_dir,
            remote_url,
            refresh_interval,
            last_fetch: Mutex::new(None),
            file_cache: Mutex::new(HashMap::new()),
        };
        catalog.ensure_cloned()?;
        Ok(catalog)
    }

    /// Clones the mirror if it does not already exist; idempotent.
    fn ensure_cloned(&self) -> Result<(), KaijsError> {
        if self.mirror_dir.join("HEAD").exists() {
            tracing::debug!(target: "kaijs::schema", dir = %self.mirror_dir.display(), "mirror already present, skipping clone");
            return Ok(());
        }

        if let Some(parent) = self.mirror_dir.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err("create mirror parent dir", &e))?;
        }

        tracing::info!(target: "kaijs::schema", url = %self.remote_url, dir = %self.mirror_dir.display(), "cloning schema mirror");
        run_git(
            None,
            &[
                "clone",
                "--mirror",
                &self.remote_url,
                &self.mirror_dir.to_string_lossy(),
            ],
        )?;
        *self.last_fetch.lock().expect("lock poisoned") = Some(Instant::now());
        Ok(())
    }

    /// Fetches with prune if the configured refresh interval has elapsed
    /// since the last fetch (or if no fetch has happened yet this process).
    pub fn refresh_if_stale(&self) -> Result<bool, KaijsError> {
        let due = {
            let guard = self.last_fetch.lock().expect("lock poisoned");
            match *guard {
                Some(at) => at.elapsed() >= self.refresh_interval,
                None => true,
            }
        };
        if !due {
            return Ok(false);
        }

        tracing::info!(target: "kaijs::schema", dir = %self.mirror_dir.display(), "refreshing schema mirror");
        run_git(Some(&self.mirror_dir), &["fetch", "--prune"])?;
        *self.last_fetch.lock().expect("lock poisoned") = Some(Instant::now());
        self.file_cache.lock().expect("lock poisoned").clear();
        Ok(true)
    }

    /// Resolves `refs/tags/<tag>:<path>` and returns the raw file bytes,
    /// memoized per `(tag, path)`.
    pub fn get_file(&self, tag: &str, path: &str) -> Result<Vec<u8>, KaijsError> {
        let key = (tag.to_string(), path.to_string());
        if let Some(cached) = self.file_cache.lock().expect("lock poisoned").get(&key) {
            return Ok(cached.clone());
        }

        let spec = format!("{tag}:{path}");
        let out = Command::new("git")
            .arg("-C")
            .arg(&self.mirror_dir)
            .args(["cat-file", "-p", &spec])
            .output()
            .map_err(|e| io_err("spawn git cat-file", &e))?;

        if !out.status.success() {
            return Err(KaijsError::new(
                ErrorCode::NoValidationSchemaError,
                format!("schema not found at {spec}"),
            )
            .with_context("tag", tag)
            .with_context("path", path));
        }

        self.file_cache
            .lock()
            .expect("lock poisoned")
            .insert(key, out.stdout.clone());
        Ok(out.stdout)
    }

    /// Root directory of the mirror, for diagnostics.
    #[must_use]
    pub fn mirror_dir(&self) -> &Path {
        &self.mirror_dir
    }
}

fn run_git(dir: Option<&Path>, args: &[&str]) -> Result<String, KaijsError> {
    let mut cmd = Command::new("git");
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    cmd.args(args);

    let out = cmd
        .output()
        .map_err(|e| io_err(&format!("spawn git {args:?}"), &e))?;

    if !out.status.success() {
        return Err(KaijsError::new(
            ErrorCode::Internal,
            format!(
                "git {args:?} failed (code={:?}): {}",
                out.status.code(),
                String::from_utf8_lossy(&out.stderr)
            ),
        ));
    }

    Ok(String::from_utf8_lossy(&out.stdout).to_string())
}

fn io_err(action: &str, err: &std::io::Error) -> KaijsError {
    KaijsError::new(ErrorCode::Internal, format!("{action}: {err}"))
        .with_source(std::io::Error::new(err.kind(), err.to_string()))
}
