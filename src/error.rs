//! Typed error taxonomy for every component in the core.
//!
//! Mirrors the exception hierarchy of the source toolkit: a single base
//! error surfaces one variant family per kind so callers can match on
//! `XnatError::Upload(_)` etc. without string-sniffing messages.

use std::fmt;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum XnatError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Dicom(#[from] DicomError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("missing required environment variables: {0}")]
    MissingCredentials(String),
    #[error("invalid configuration value for '{field}': {value} ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

impl ConfigurationError {
    pub fn missing_credentials(missing: &[&str]) -> Self {
        Self::MissingCredentials(missing.join(", "))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("authentication failed against {server}")]
    Authentication { server: String },
    #[error("cannot reach {server}: {source}")]
    ServerUnreachable {
        server: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("session already released")]
    SessionExpired,
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid {identifier_type} '{value}': {reason}")]
    InvalidIdentifier {
        identifier_type: String,
        value: String,
        reason: String,
    },
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid port {port}: must be in range 1-65535")]
    InvalidPort { port: i64 },
    #[error("invalid path '{}': {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("{resource_type} '{identifier}' not found{}", project.as_ref().map(|p| format!(" in project {p}")).unwrap_or_default())]
    NotFound {
        resource_type: String,
        identifier: String,
        project: Option<String>,
    },
    #[error("{resource_type} '{identifier}' already exists")]
    AlreadyExists {
        resource_type: String,
        identifier: String,
    },
    #[error("access denied to {resource_type} '{identifier}'")]
    AccessDenied {
        resource_type: String,
        identifier: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("archive upload failed for '{archive_path}': {reason}")]
    Archive { archive_path: String, reason: String },
    #[error("DICOM upload failed for session '{session}' ({files_failed}/{files_processed} files failed): {message}")]
    Dicom {
        message: String,
        session: String,
        files_processed: usize,
        files_failed: usize,
    },
    #[error("resource upload failed for '{resource}' file '{file}': {reason}")]
    Resource {
        resource: String,
        file: String,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("session download failed for {project}/{subject}/{session}: {reason}")]
    Session {
        project: String,
        subject: String,
        session: String,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("batch operation '{operation}' finished with {succeeded} succeeded, {failed} failed: {}", errors.join("; "))]
    BatchPartialFailure {
        operation: String,
        succeeded: usize,
        failed: usize,
        errors: Vec<String>,
    },
    #[error("catalog refresh failed: {0}")]
    CatalogRefresh(String),
    #[error("rename failed: {0}")]
    Rename(String),
    #[error("delete failed: {0}")]
    Delete(String),
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("operation timed out")]
    Timeout,
    #[error("'{operation}' exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        #[source]
        last_error: anyhow::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DicomError {
    #[error("failed to parse DICOM file '{}': {reason}", path.display())]
    Parse { path: PathBuf, reason: String },
    #[error("C-STORE failed against {host}:{port} ({sent}/{total} sent, {failed} failed)")]
    StoreFailure {
        host: String,
        port: u16,
        total: usize,
        sent: usize,
        failed: usize,
    },
    #[error("C-ECHO failed against {host}:{port}")]
    EchoFailed { host: String, port: u16 },
}

/// A transport-level failure that the retry engine (C5) may retry.
///
/// Classification lives on the error *type*, never on a string match
/// against the message: a reset, a timeout, a broken pipe and a generic
/// I/O failure are each their own variant.
#[derive(Debug)]
pub enum TransientKind {
    ConnectionReset,
    Timeout,
    ChunkedEncoding,
    BrokenPipe,
    Io,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransientKind::ConnectionReset => "connection reset",
            TransientKind::Timeout => "timeout",
            TransientKind::ChunkedEncoding => "chunked encoding error",
            TransientKind::BrokenPipe => "broken pipe",
            TransientKind::Io => "I/O error",
        };
        f.write_str(s)
    }
}

/// Classify a `reqwest::Error` as transient (retryable) or not.
///
/// Mirrors the reference's catch list of `ConnectionError`, `Timeout`,
/// `ChunkedEncodingError`, `ConnectionResetError`, `BrokenPipeError`,
/// `OSError` — implemented here as a type-level check on `reqwest::Error`
/// and its underlying `std::io::Error` source, not a string match.
pub fn classify_reqwest_error(err: &reqwest::Error) -> Option<TransientKind> {
    if err.is_timeout() {
        return Some(TransientKind::Timeout);
    }
    if err.is_connect() {
        return Some(TransientKind::ConnectionReset);
    }
    if let Some(io_err) = find_io_error(err) {
        use std::io::ErrorKind;
        return Some(match io_err.kind() {
            ErrorKind::ConnectionReset => TransientKind::ConnectionReset,
            ErrorKind::BrokenPipe => TransientKind::BrokenPipe,
            ErrorKind::UnexpectedEof => TransientKind::ChunkedEncoding,
            _ => TransientKind::Io,
        });
    }
    if err.is_body() || err.is_decode() {
        return Some(TransientKind::ChunkedEncoding);
    }
    None
}

fn find_io_error(err: &reqwest::Error) -> Option<&std::io::Error> {
    let mut source: &(dyn std::error::Error + 'static) = err;
    loop {
        if let Some(io_err) = source.downcast_ref::<std::io::Error>() {
            return Some(io_err);
        }
        source = source.source()?;
    }
}
