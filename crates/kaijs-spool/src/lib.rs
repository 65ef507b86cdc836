//! Durable single-producer/single-consumer file-backed queue, §4.2.
//!
//! Envelopes are stored one file per message under `<root>/active`. A
//! consumer claims the oldest file by renaming it into `<root>/claim`;
//! `commit` deletes it, `rollback` renames it back. A crash between claim
//! and commit leaves the file sitting in `claim/`, which [`Spool::open`]
//! folds back into `active/` on the next startup — the at-least-once
//! delivery guarantee of §4.2.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use kaijs_error::{ErrorCode, KaijsError};
use kaijs_model::SpoolMessage;
use std::fs;
use std::path::{Path, PathBuf};

const ACTIVE_DIR: &str = "active";
const CLAIM_DIR: &str = "claim";

/// Default bound on how many filenames a single scan of `active/` may
/// enumerate before picking the oldest, per §4.2 ("claim no more than
/// `N=32` filenames per scan").
pub const DEFAULT_SCAN_BATCH: usize = 32;

/// A durable file-backed FIFO queue rooted at a directory on disk.
#[derive(Debug, Clone)]
pub struct Spool {
    root: PathBuf,
    scan_batch: usize,
}

/// A claimed envelope awaiting `commit` or `rollback`.
///
/// Dropping a `Claim` without calling either leaves the file in `claim/`;
/// it will be recovered into `active/` the next time [`Spool::open`] runs,
/// matching the crash-recovery behavior of §4.2. This is deliberate: an
/// in-flight claim that the process never resolves (e.g. a panic) must not
/// silently lose the envelope.
#[derive(Debug)]
pub struct Claim {
    message: SpoolMessage,
    claim_path: PathBuf,
    active_path: PathBuf,
}

impl Claim {
    /// The claimed envelope.
    #[must_use]
    pub fn message(&self) -> &SpoolMessage {
        &self.message
    }

    /// Consumes the envelope, discarding the claim file. Effects the
    /// message produced must already be durable before calling this.
    ///
    /// # Errors
    /// Returns [`ErrorCode::NoValidationSchemaError`]... no — returns a
    /// [`KaijsError`] with [`ErrorCode`] Internal wrapping the underlying
    /// I/O error if the claim file cannot be removed.
    pub fn commit(self) -> Result<SpoolMessage, KaijsError> {
        fs::remove_file(&self.claim_path).map_err(|e| {
            KaijsError::new(ErrorCode::Internal, "failed to commit spool claim")
                .with_context("path", self.claim_path.display().to_string())
                .with_source(e)
        })?;
        Ok(self.message)
    }

    /// Returns the envelope to `active/`, to be retried on a later pop.
    ///
    /// # Errors
    /// Returns a [`KaijsError`] if the file cannot be renamed back.
    pub fn rollback(self) -> Result<(), KaijsError> {
        fs::rename(&self.claim_path, &self.active_path).map_err(|e| {
            KaijsError::new(ErrorCode::Internal, "failed to rollback spool claim")
                .with_context("path", self.claim_path.display().to_string())
                .with_source(e)
        })
    }
}

impl Spool {
    /// Opens (creating if necessary) a spool rooted at `root`, with the
    /// default scan batch size of [`DEFAULT_SCAN_BATCH`].
    ///
    /// Any file left in `claim/` from a previous crash is folded back into
    /// `active/` before this returns.
    ///
    /// # Errors
    /// Returns a [`KaijsError`] if the directories cannot be created or the
    /// recovery pass fails.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, KaijsError> {
        Self::open_with_scan_batch(root, DEFAULT_SCAN_BATCH)
    }

    /// Like [`Spool::open`], but with an explicit scan batch size.
    ///
    /// # Errors
    /// Returns a [`KaijsError`] if the directories cannot be created or the
    /// recovery pass fails.
    pub fn open_with_scan_batch(
        root: impl Into<PathBuf>,
        scan_batch: usize,
    ) -> Result<Self, KaijsError> {
        let root = root.into();
        let spool = Self { root, scan_batch };
        fs::create_dir_all(spool.active_dir()).map_err(|e| io_err("create active dir", &e))?;
        fs::create_dir_all(spool.claim_dir()).map_err(|e| io_err("create claim dir", &e))?;
        spool.recover_claimed()?;
        Ok(spool)
    }

    fn active_dir(&self) -> PathBuf {
        self.root.join(ACTIVE_DIR)
    }

    fn claim_dir(&self) -> PathBuf {
        self.root.join(CLAIM_DIR)
    }

    /// Moves every file sitting in `claim/` back into `active/`. Called on
    /// every [`Spool::open`]; the claim directory's mere existence of files
    /// at startup is the at-least-once recovery signal described in §4.2.
    fn recover_claimed(&self) -> Result<(), KaijsError> {
        let entries = fs::read_dir(self.claim_dir()).map_err(|e| io_err("read claim dir", &e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_err("read claim dir entry", &e))?;
            let file_name = entry.file_name();
            let dest = self.active_dir().join(&file_name);
            if dest.exists() {
                // Duplicate spool_id recovered twice; keep the active copy,
                // drop the stale claim-side duplicate.
                let _ = fs::remove_file(entry.path());
                continue;
            }
            fs::rename(entry.path(), dest).map_err(|e| io_err("recover claimed file", &e))?;
            tracing::info!(target: "kaijs::spool", file = %file_name.to_string_lossy(), "recovered in-flight envelope from claim dir");
        }
        Ok(())
    }

    /// Appends `message` to the active queue, written atomically (write to
    /// a temp file, then rename into place).
    ///
    /// # Errors
    /// Returns a [`KaijsError`] on any I/O or serialization failure.
    pub fn push(&self, message: &SpoolMessage) -> Result<(), KaijsError> {
        let file_name = format!("{}.json", message.spool_id);
        let dest = self.active_dir().join(&file_name);
        let tmp = self
            .active_dir()
            .join(format!(".{}.tmp-{}", file_name, uuid::Uuid::new_v4()));

        let json = serde_json::to_vec(message).map_err(|e| {
            KaijsError::new(ErrorCode::Internal, "failed to serialize envelope").with_source(e)
        })?;
        fs::write(&tmp, json).map_err(|e| io_err("write temp envelope file", &e))?;
        fs::rename(&tmp, &dest).map_err(|e| io_err("rename envelope into active dir", &e))?;
        Ok(())
    }

    /// Claims the oldest envelope (by filename, which sorts chronologically
    /// because `spool_id` is prefixed by unix seconds) among at most
    /// `scan_batch` filenames, moving it into `claim/`.
    ///
    /// Returns `Ok(None)` when the active directory is empty.
    ///
    /// # Errors
    /// Returns a [`KaijsError`] on any I/O, deserialization, or rename
    /// failure.
    pub fn tpop(&self) -> Result<Option<Claim>, KaijsError> {
        let entries = fs::read_dir(self.active_dir()).map_err(|e| io_err("read active dir", &e))?;

        let mut names: Vec<String> = Vec::with_capacity(self.scan_batch);
        for entry in entries {
            let entry = entry.map_err(|e| io_err("read active dir entry", &e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue; // in-progress temp file from a concurrent push
            }
            names.push(name);
            if names.len() >= self.scan_batch {
                break;
            }
        }

        let Some(oldest) = names.into_iter().min() else {
            return Ok(None);
        };

        let active_path = self.active_dir().join(&oldest);
        let claim_path = self.claim_dir().join(&oldest);
        fs::rename(&active_path, &claim_path).map_err(|e| io_err("claim envelope file", &e))?;

        let bytes = fs::read(&claim_path).map_err(|e| io_err("read claimed envelope", &e))?;
        let message: SpoolMessage = serde_json::from_slice(&bytes).map_err(|e| {
            KaijsError::new(ErrorCode::Internal, "failed to parse claimed envelope")
                .with_context("path", claim_path.display().to_string())
                .with_source(e)
        })?;

        Ok(Some(Claim {
            message,
            claim_path,
            active_path,
        }))
    }

    /// Number of envelopes currently sitting in `active/`.
    ///
    /// # Errors
    /// Returns a [`KaijsError`] if the directory cannot be read.
    pub fn length(&self) -> Result<usize, KaijsError> {
        let entries = fs::read_dir(self.active_dir()).map_err(|e| io_err("read active dir", &e))?;
        let count = entries
            .filter_map(Result::ok)
            .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
            .count();
        Ok(count)
    }

    /// Removes every file from both `active/` and `claim/`.
    ///
    /// # Errors
    /// Returns a [`KaijsError`] if either directory cannot be cleared.
    pub fn clear(&self) -> Result<(), KaijsError> {
        for dir in [self.active_dir(), self.claim_dir()] {
            let entries = fs::read_dir(&dir).map_err(|e| io_err("read dir to clear", &e))?;
            for entry in entries.filter_map(Result::ok) {
                let _ = fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    /// Root directory backing this spool.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn io_err(context: &str, e: &std::io::Error) -> KaijsError {
    KaijsError::new(ErrorCode::Internal, format!("spool I/O error: {context}"))
        .with_context("os_error", e.to_string())
}
