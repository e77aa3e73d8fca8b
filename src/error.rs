//! Error kinds shared across the transfer engine.
//!
//! One flat enum: every layer surfaces the same kinds so the retry policy
//! and the CLI exit-code mapping can classify a failure without peeling
//! layer-specific wrappers.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// A failed transfer operation.
#[derive(Debug, Error)]
pub enum Error {
    /// 404 on an object or sidecar whose absence has semantic meaning.
    #[error("not found: {0}")]
    NotFound(String),

    /// Non-2xx HTTP response. 5xx and 400 are retriable; other 4xx are not.
    #[error("http {status}: {message}")]
    Http { status: u16, message: String },

    /// Request dispatch failed before a status line was seen (connect
    /// failure, connection reset, SDK timeout). Retriable.
    #[error("transport: {0}")]
    Transport(String),

    /// No bytes moved for the configured stall window. Retriable, and the
    /// download path resumes with a ranged request instead of restarting.
    #[error("no bytes transferred for {0} seconds")]
    StallTimeout(u64),

    /// Computed plaintext MD5 disagrees with the `md5sum` sidecar.
    #[error("md5 mismatch for {path}: expected {expected}, got {got}")]
    Md5Mismatch {
        path: String,
        expected: String,
        got: String,
    },

    /// Signature or permission failure (401/403). Never retried.
    #[error("access denied (http {status})")]
    Auth { status: u16 },

    /// Missing or invalid configuration. Fatal before any I/O.
    #[error("configuration: {0}")]
    Config(String),

    /// Local filesystem error. Fatal for the affected transfer.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// GPG non-zero exit, decrypt failure, or missing passphrase.
    #[error("crypto: {0}")]
    Crypto(String),

    /// The run was cancelled (Ctrl-C or the bulk abort gate).
    #[error("cancelled")]
    Cancelled,

    /// A failure tagged with the pipeline phase it occurred in
    /// (`put_parts`, `put_meta`, `get_file`).
    #[error("{phase}: {source}")]
    InPhase {
        phase: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Construct an `http` error, folding auth statuses into their own kind.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        match status {
            401 | 403 => Error::Auth { status },
            _ => Error::Http {
                status,
                message: message.into(),
            },
        }
    }

    /// Tag this error with the pipeline phase it occurred in.
    pub fn in_phase(self, phase: &'static str) -> Self {
        Error::InPhase {
            phase,
            source: Box::new(self),
        }
    }

    /// Whether the retry loop may re-attempt after this error. S3 throws
    /// transient 400s, so 400 is retriable alongside 5xx.
    pub fn retriable(&self) -> bool {
        match self {
            Error::Http { status, .. } => *status >= 500 || *status == 400,
            Error::Transport(_) => true,
            Error::StallTimeout(_) => true,
            Error::Md5Mismatch { .. } => true,
            Error::InPhase { source, .. } => source.retriable(),
            _ => false,
        }
    }

    /// Whether this error is a 404 in disguise, at any wrapping depth.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::InPhase { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Whether the stalled transfer can continue from its current offset.
    pub fn is_stall(&self) -> bool {
        match self {
            Error::StallTimeout(_) => true,
            Error::InPhase { source, .. } => source.is_stall(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(Error::http(500, "boom").retriable());
        assert!(Error::http(503, "unavailable").retriable());
        assert!(Error::http(400, "flaky").retriable());
        assert!(!Error::http(404, "gone").retriable());
        assert!(!Error::http(403, "denied").retriable());
        assert!(Error::StallTimeout(30).retriable());
        assert!(Error::Md5Mismatch {
            path: "p".into(),
            expected: "a".into(),
            got: "b".into()
        }
        .retriable());
        assert!(!Error::NotFound("p".into()).retriable());
        assert!(!Error::Config("missing bucket".into()).retriable());
    }

    #[test]
    fn test_auth_statuses_fold_into_auth_kind() {
        assert!(matches!(Error::http(403, "x"), Error::Auth { status: 403 }));
        assert!(matches!(Error::http(401, "x"), Error::Auth { status: 401 }));
        assert!(matches!(Error::http(500, "x"), Error::Http { .. }));
    }

    #[test]
    fn test_phase_tag_preserves_classification() {
        let e = Error::http(502, "bad gateway").in_phase("put_parts");
        assert!(e.retriable());
        assert_eq!(e.to_string(), "put_parts: http 502: bad gateway");

        let e = Error::NotFound("meta/k/md5sum".into()).in_phase("get_file");
        assert!(e.is_not_found());
        assert!(!e.retriable());
    }
}
