//! Unified error taxonomy with stable error codes for the kaijs ingestion pipeline.
//!
//! Every error that crosses a loader or listener boundary carries an
//! [`ErrorCode`] (a machine-readable, stable string tag), a human-readable
//! message, an optional cause chain, and arbitrary key-value context. The
//! [`disposition`] function is the single source of truth mapping a code to
//! the commit/rollback/fatal-exit policy described in the error handling
//! design: call sites consult it instead of re-deriving policy ad hoc.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Envelope/JSON-Schema validation errors.
    Validation,
    /// Topic→handler dispatch errors.
    Dispatch,
    /// Per-family handler errors.
    Handler,
    /// File-backed spool errors.
    Spool,
    /// Document-database writer errors.
    DocDb,
    /// Search-index writer errors.
    Index,
    /// Schema-catalog errors.
    Schema,
    /// Broker connectivity errors.
    Broker,
    /// Configuration errors.
    Config,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Dispatch => "dispatch",
            Self::Handler => "handler",
            Self::Spool => "spool",
            Self::DocDb => "doc_db",
            Self::Index => "index",
            Self::Schema => "schema",
            Self::Broker => "broker",
            Self::Config => "config",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serializes to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases. These mirror the error
/// kinds table of the error handling design, one variant per row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Broker body could not be parsed as JSON.
    MalformedBody,
    /// Envelope is missing a required `SpoolMessage` field.
    EnvelopeShapeViolation,
    /// `body.version` missing or empty on a CI topic.
    WrongVersionError,
    /// No schema key matches the envelope's topic.
    NoValidationSchemaError,
    /// Strict or relaxed schema validation failed.
    ValidationError,
    /// No dispatch regex matches the envelope's topic.
    NoAssociatedHandlerError,
    /// Handler declined to process this message.
    NoNeedToProcessError,
    /// No thread id could be derived for this envelope.
    NoThreadIdError,
    /// Assembled artifact document exceeds the document-size limit.
    ToLargeDocumentError,
    /// Optimistic-concurrency retry budget exhausted.
    OccExhausted,
    /// Broker, document-DB, or search-index connection was lost.
    ConnectionLost,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MalformedBody | Self::EnvelopeShapeViolation => ErrorCategory::Validation,
            Self::WrongVersionError | Self::NoValidationSchemaError | Self::ValidationError => {
                ErrorCategory::Validation
            }
            Self::NoAssociatedHandlerError => ErrorCategory::Dispatch,
            Self::NoNeedToProcessError | Self::NoThreadIdError => ErrorCategory::Handler,
            Self::ToLargeDocumentError | Self::OccExhausted => ErrorCategory::DocDb,
            Self::ConnectionLost => ErrorCategory::Broker,
            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation of the code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedBody => "MALFORMED_BODY",
            Self::EnvelopeShapeViolation => "ENVELOPE_SHAPE_VIOLATION",
            Self::WrongVersionError => "WRONG_VERSION_ERROR",
            Self::NoValidationSchemaError => "NO_VALIDATION_SCHEMA_ERROR",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::NoAssociatedHandlerError => "NO_ASSOCIATED_HANDLER_ERROR",
            Self::NoNeedToProcessError => "NO_NEED_TO_PROCESS_ERROR",
            Self::NoThreadIdError => "NO_THREAD_ID_ERROR",
            Self::ToLargeDocumentError => "TO_LARGE_DOCUMENT_ERROR",
            Self::OccExhausted => "OCC_EXHAUSTED",
            Self::ConnectionLost => "CONNECTION_LOST",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Disposition
// ---------------------------------------------------------------------------

/// What the loader should do with an envelope after a given error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Commit (drop) the envelope silently; no sink write.
    Commit,
    /// Commit the envelope and record it to the invalid-messages sink.
    CommitInvalid,
    /// Roll the envelope back; it will be retried on the next pop.
    Rollback,
    /// Stop the process with the given exit code.
    FatalExit(i32),
}

/// Maps an [`ErrorCode`] to its [`Disposition`] per the error handling design.
///
/// This is the single place that encodes the commit/rollback/invalid-sink/
/// fatal-exit routing table; callers must not re-derive this policy locally.
#[must_use]
pub fn disposition(code: ErrorCode) -> Disposition {
    match code {
        ErrorCode::MalformedBody => Disposition::Commit,
        ErrorCode::EnvelopeShapeViolation => Disposition::Commit,
        ErrorCode::WrongVersionError
        | ErrorCode::NoValidationSchemaError
        | ErrorCode::ValidationError
        | ErrorCode::NoThreadIdError => Disposition::CommitInvalid,
        ErrorCode::NoAssociatedHandlerError => Disposition::CommitInvalid,
        ErrorCode::NoNeedToProcessError => Disposition::Commit,
        ErrorCode::ToLargeDocumentError => Disposition::CommitInvalid,
        ErrorCode::OccExhausted => Disposition::FatalExit(1),
        ErrorCode::ConnectionLost => Disposition::FatalExit(1),
        ErrorCode::Internal => Disposition::Rollback,
    }
}

// ---------------------------------------------------------------------------
// KaijsError
// ---------------------------------------------------------------------------

/// Unified kaijs error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Builder usage
///
/// ```
/// use kaijs_error::{ErrorCode, KaijsError};
///
/// let err = KaijsError::new(ErrorCode::NoThreadIdError, "no pipeline.id, thread_id, or run.url")
///     .with_context("broker_msg_id", "abc-123");
/// ```
pub struct KaijsError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl KaijsError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialization
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Shorthand for `disposition(self.code)`.
    #[must_use]
    pub fn disposition(&self) -> Disposition {
        disposition(self.code)
    }
}

impl fmt::Debug for KaijsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("KaijsError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for KaijsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for KaijsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serializable snapshot of a [`KaijsError`] (without the opaque source),
/// suitable for writing to the `validation-errors` collection or an
/// `invalid-messages` index document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KaijsErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&KaijsError> for KaijsErrorDto {
    fn from(err: &KaijsError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

/// Exit code used by a binary when [`Disposition::FatalExit`] is hit without
/// a more specific broker-level exit code available (see `kaijs-broker` for
/// the `11`/`12`/`21`/`22`/`31` broker-fatal codes).
pub const DEFAULT_FATAL_EXIT_CODE: i32 = 1;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    const ALL_CODES: &[ErrorCode] = &[
        ErrorCode::MalformedBody,
        ErrorCode::EnvelopeShapeViolation,
        ErrorCode::WrongVersionError,
        ErrorCode::NoValidationSchemaError,
        ErrorCode::ValidationError,
        ErrorCode::NoAssociatedHandlerError,
        ErrorCode::NoNeedToProcessError,
        ErrorCode::NoThreadIdError,
        ErrorCode::ToLargeDocumentError,
        ErrorCode::OccExhausted,
        ErrorCode::ConnectionLost,
        ErrorCode::Internal,
    ];

    #[test]
    fn basic_construction() {
        let err = KaijsError::new(ErrorCode::Internal, "boom");
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "boom");
        assert!(err.source.is_none());
        assert!(err.context.is_empty());
    }

    #[test]
    fn display_without_context() {
        let err = KaijsError::new(ErrorCode::NoThreadIdError, "no anchor");
        assert_eq!(err.to_string(), "[NO_THREAD_ID_ERROR] no anchor");
    }

    #[test]
    fn display_with_context() {
        let err = KaijsError::new(ErrorCode::ToLargeDocumentError, "too big")
            .with_context("size_bytes", 20_000_000u64);
        let s = err.to_string();
        assert!(s.starts_with("[TO_LARGE_DOCUMENT_ERROR] too big"));
        assert!(s.contains("size_bytes"));
        assert!(s.contains("20000000"));
    }

    #[test]
    fn debug_with_source() {
        let src = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err = KaijsError::new(ErrorCode::Internal, "init failed").with_source(src);
        let dbg = format!("{err:?}");
        assert!(dbg.contains("source"));
        assert!(dbg.contains("file missing"));
    }

    #[test]
    fn every_code_has_a_category_and_roundtrips_json() {
        for code in ALL_CODES {
            let _ = code.category();
            let s = serde_json::to_string(code).unwrap();
            let back: ErrorCode = serde_json::from_str(&s).unwrap();
            assert_eq!(*code, back);
        }
    }

    #[test]
    fn as_str_is_screaming_snake_case() {
        for code in ALL_CODES {
            assert!(code.as_str().chars().all(|c| c.is_ascii_uppercase() || c == '_'));
        }
    }

    #[test]
    fn disposition_table_matches_error_handling_design() {
        assert_eq!(disposition(ErrorCode::MalformedBody), Disposition::Commit);
        assert_eq!(
            disposition(ErrorCode::WrongVersionError),
            Disposition::CommitInvalid
        );
        assert_eq!(
            disposition(ErrorCode::NoAssociatedHandlerError),
            Disposition::CommitInvalid
        );
        assert_eq!(
            disposition(ErrorCode::NoNeedToProcessError),
            Disposition::Commit
        );
        assert_eq!(
            disposition(ErrorCode::OccExhausted),
            Disposition::FatalExit(1)
        );
        assert_eq!(
            disposition(ErrorCode::ConnectionLost),
            Disposition::FatalExit(1)
        );
    }

    #[test]
    fn dto_roundtrips_without_source() {
        let err = KaijsError::new(ErrorCode::ValidationError, "bad shape")
            .with_context("field", "body.version");
        let dto: KaijsErrorDto = (&err).into();
        let s = serde_json::to_string(&dto).unwrap();
        let back: KaijsErrorDto = serde_json::from_str(&s).unwrap();
        assert_eq!(dto, back);
        assert!(dto.source_message.is_none());
    }
}
