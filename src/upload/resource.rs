//! Resource Uploader (C11) plus the two operations that ride alongside it
//! on the same HTTP surface: scan-scoped resource upload and import of an
//! already-built archive.
//!
//! All four operations ensure the subject/experiment exist first (an
//! idempotent PUT-or-create against the project/subject/experiment
//! service) before touching files.

use std::path::Path;

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};

use crate::archive::{build_archive, ArchiveFormat};
use crate::error::{classify_reqwest_error, ConnectionError, TransientKind, UploadError, XnatError};
use crate::error_tracker::ConsecutiveErrorTracker;
use crate::http::{RequestBody, Session};
use crate::progress::{AuditRecordBuilder, SharedAuditSink};
use crate::retry::{retry, Attempt, RetryPolicy};
use crate::validators::validate_resource_label;

fn encode_segment(value: &str) -> String {
    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
}

/// PUT-or-create the subject and experiment. 200/201 and 409 (already
/// exists) are all treated as success; anything else is a hard failure.
async fn ensure_experiment_exists(
    session: &Session,
    project: &str,
    subject: &str,
    experiment: &str,
) -> Result<(), XnatError> {
    let subject_path = format!(
        "/data/projects/{}/subjects/{}",
        encode_segment(project),
        encode_segment(subject)
    );
    put_idempotent(session, &subject_path).await?;

    let experiment_path = format!("{subject_path}/experiments/{}", encode_segment(experiment));
    put_idempotent(session, &experiment_path).await
}

async fn put_idempotent(session: &Session, path: &str) -> Result<(), XnatError> {
    let response = session
        .request(reqwest::Method::PUT, path, &[], &[], RequestBody::None, None)
        .await
        .map_err(crate::error::XnatError::Connection)?;
    match response.status().as_u16() {
        200 | 201 | 409 => Ok(()),
        status => Err(XnatError::Resource(crate::error::ResourceError::AccessDenied {
            resource_type: "experiment".to_string(),
            identifier: format!("{path} ({status})"),
        })),
    }
}

async fn read_whole_file(path: &Path) -> Result<Vec<u8>, String> {
    tokio::fs::read(path).await.map_err(|e| e.to_string())
}

/// Mode 1: PUT a single file into an experiment-scoped resource.
pub async fn upload_resource_file(
    session: &Session,
    project: &str,
    subject: &str,
    experiment: &str,
    resource_label: &str,
    local_path: &Path,
    remote_name: Option<&str>,
    audit: &SharedAuditSink,
) -> Result<(), XnatError> {
    validate_resource_label(resource_label)?;
    ensure_experiment_exists(session, project, subject, experiment).await?;

    let remote_name = remote_name
        .map(str::to_string)
        .or_else(|| local_path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .ok_or_else(|| {
            XnatError::Upload(UploadError::Resource {
                resource: resource_label.to_string(),
                file: local_path.display().to_string(),
                reason: "local path has no file name".to_string(),
            })
        })?;

    let bytes = read_whole_file(local_path).await.map_err(|reason| {
        XnatError::Upload(UploadError::Resource {
            resource: resource_label.to_string(),
            file: local_path.display().to_string(),
            reason,
        })
    })?;
    let size = bytes.len() as u64;

    let path = format!(
        "/data/projects/{}/subjects/{}/experiments/{}/resources/{}/files/{}",
        encode_segment(project),
        encode_segment(subject),
        encode_segment(experiment),
        encode_segment(resource_label),
        encode_segment(&remote_name)
    );

    let result = put_file_bytes(session, &path, "?inbody=true", bytes, "application/octet-stream")
        .await
        .map_err(|e| e.to_string());
    record_audit(audit, "resource-upload", project, subject, experiment, &remote_name, size, &result);
    result.map_err(|reason| {
        XnatError::Upload(UploadError::Resource {
            resource: resource_label.to_string(),
            file: remote_name,
            reason,
        })
    })
}

/// Mode 2: recursively walk a local directory, PUTting each regular file
/// with a path-relative arcname. Individual failures do not abort the
/// walk; they accumulate into the returned counts and are logged with
/// the rate-limited consecutive-failure discipline (C12).
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectoryUploadResult {
    pub uploaded: usize,
    pub failed: usize,
}

pub async fn upload_directory_as_resource(
    session: &Session,
    project: &str,
    subject: &str,
    experiment: &str,
    resource_label: &str,
    local_dir: &Path,
) -> Result<DirectoryUploadResult, XnatError> {
    validate_resource_label(resource_label)?;
    ensure_experiment_exists(session, project, subject, experiment).await?;

    let tracker = ConsecutiveErrorTracker::new();
    let mut result = DirectoryUploadResult::default();

    for entry in walkdir::WalkDir::new(local_dir).follow_links(false) {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_file() {
            continue;
        }
        let full_path = entry.path();
        let rel = full_path
            .strip_prefix(local_dir)
            .unwrap_or(full_path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");

        let bytes = match read_whole_file(full_path).await {
            Ok(b) => b,
            Err(_) => {
                result.failed += 1;
                if tracker.record_error() {
                    tracing::warn!("failed to read {} for resource upload", full_path.display());
                }
                continue;
            }
        };

        let path = format!(
            "/data/projects/{}/subjects/{}/experiments/{}/resources/{}/files/{}",
            encode_segment(project),
            encode_segment(subject),
            encode_segment(experiment),
            encode_segment(resource_label),
            encode_segment(&rel)
        );
        match put_file_bytes(session, &path, "?inbody=true", bytes, "application/octet-stream").await {
            Ok(()) => {
                result.uploaded += 1;
                if let Some(absorbed) = tracker.record_success() {
                    tracing::info!("resource upload recovered after {absorbed} consecutive failures");
                }
            }
            Err(e) => {
                result.failed += 1;
                if tracker.record_error() {
                    tracing::warn!("failed to upload {rel}: {e}");
                }
            }
        }
    }
    Ok(result)
}

/// Mode 3: zip the directory (same rules as C3) and PUT with
/// `extract=true`, wrapped in the retry engine since it targets a stable
/// subject/session. The temp zip is always removed on exit.
pub async fn upload_resource_zip_with_extract(
    session: &Session,
    project: &str,
    subject: &str,
    experiment: &str,
    resource_label: &str,
    local_dir: &Path,
    audit: &SharedAuditSink,
) -> Result<(), XnatError> {
    validate_resource_label(resource_label)?;
    ensure_experiment_exists(session, project, subject, experiment).await?;

    let files: Vec<_> = walkdir::WalkDir::new(local_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();

    let temp_zip = std::env::temp_dir().join(format!("xnat-resource-{}.zip", uuid::Uuid::new_v4()));
    let zip_name = format!("{resource_label}.zip");
    let build_result = {
        let local_dir = local_dir.to_path_buf();
        let temp_zip = temp_zip.clone();
        tokio::task::spawn_blocking(move || build_archive(&files, &local_dir, ArchiveFormat::Zip, &temp_zip))
            .await
            .expect("zip worker panicked")
    };

    let outcome = match build_result {
        Ok(size) => {
            let upload = retry("resource-zip-upload", RetryPolicy::default(), || {
                let session = session;
                let temp_zip = temp_zip.clone();
                let path = format!(
                    "/data/projects/{}/subjects/{}/experiments/{}/resources/{}/files/{}",
                    encode_segment(project),
                    encode_segment(subject),
                    encode_segment(experiment),
                    encode_segment(resource_label),
                    encode_segment(&zip_name)
                );
                async move {
                    match tokio::fs::read(&temp_zip).await {
                        Ok(bytes) => {
                            match put_file_bytes(session, &path, "?inbody=true&extract=true", bytes, "application/zip")
                                .await
                            {
                                Ok(()) => Attempt::Ok(()),
                                Err(e) => match e.transient_kind() {
                                    Some(kind) => {
                                        tracing::warn!("resource zip upload hit a transient {kind}, retrying");
                                        Attempt::Transient(anyhow::anyhow!(e.to_string()))
                                    }
                                    None => Attempt::Permanent(anyhow::anyhow!(e.to_string())),
                                },
                            }
                        }
                        Err(e) => Attempt::Permanent(anyhow::anyhow!(e.to_string())),
                    }
                }
            })
            .await;
            match upload {
                Ok(()) => Ok(size),
                Err(e) => Err(e.to_string()),
            }
        }
        Err(e) => Err(e.to_string()),
    };

    let _ = std::fs::remove_file(&temp_zip);

    let size = outcome.as_ref().ok().copied().unwrap_or(0);
    let status: Result<(), String> = outcome.as_ref().map(|_| ()).map_err(|e| e.clone());
    record_audit(audit, "resource-zip-upload", project, subject, experiment, &zip_name, size, &status);
    outcome.map(|_| ()).map_err(|reason| {
        XnatError::Upload(UploadError::Resource {
            resource: resource_label.to_string(),
            file: zip_name,
            reason,
        })
    })
}

/// Scan-scoped resource upload: PUT a single file into
/// `…/scans/<id>/resources/<label>/files/<name>`.
pub async fn upload_scan_resource_file(
    session: &Session,
    project: &str,
    subject: &str,
    experiment: &str,
    scan_id: &str,
    resource_label: &str,
    local_path: &Path,
    remote_name: Option<&str>,
    audit: &SharedAuditSink,
) -> Result<(), XnatError> {
    validate_resource_label(resource_label)?;
    crate::validators::validate_scan_id(scan_id)?;
    ensure_experiment_exists(session, project, subject, experiment).await?;

    let remote_name = remote_name
        .map(str::to_string)
        .or_else(|| local_path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .ok_or_else(|| {
            XnatError::Upload(UploadError::Resource {
                resource: resource_label.to_string(),
                file: local_path.display().to_string(),
                reason: "local path has no file name".to_string(),
            })
        })?;
    let bytes = read_whole_file(local_path).await.map_err(|reason| {
        XnatError::Upload(UploadError::Resource {
            resource: resource_label.to_string(),
            file: local_path.display().to_string(),
            reason,
        })
    })?;
    let size = bytes.len() as u64;

    let path = format!(
        "/data/projects/{}/subjects/{}/experiments/{}/scans/{}/resources/{}/files/{}",
        encode_segment(project),
        encode_segment(subject),
        encode_segment(experiment),
        encode_segment(scan_id),
        encode_segment(resource_label),
        encode_segment(&remote_name)
    );

    let result = put_file_bytes(session, &path, "?inbody=true", bytes, "application/octet-stream")
        .await
        .map_err(|e| e.to_string());
    record_audit(audit, "scan-resource-upload", project, subject, experiment, &remote_name, size, &result);
    result.map_err(|reason| {
        XnatError::Upload(UploadError::Resource {
            resource: resource_label.to_string(),
            file: remote_name,
            reason,
        })
    })
}

/// Import an already-built archive (single file, not a batch fan-out)
/// through the same `/data/services/import` surface C6 uses.
#[allow(clippy::too_many_arguments)]
pub async fn import_prebuilt_archive(
    session: &Session,
    project: &str,
    subject: &str,
    experiment: &str,
    archive_path: &Path,
    import_handler: &str,
    overwrite: crate::validators::OverwriteMode,
    direct_archive: bool,
    audit: &SharedAuditSink,
) -> Result<(), XnatError> {
    ensure_experiment_exists(session, project, subject, experiment).await?;

    let bytes = tokio::fs::read(archive_path).await.map_err(|e| {
        XnatError::Upload(UploadError::Archive {
            archive_path: archive_path.display().to_string(),
            reason: e.to_string(),
        })
    })?;
    let size = bytes.len() as u64;
    let content_type = ArchiveFormat::content_type_for_path(archive_path).to_string();

    let query: Vec<(String, String)> = vec![
        ("import-handler".to_string(), import_handler.to_string()),
        ("project".to_string(), project.to_string()),
        ("subject".to_string(), subject.to_string()),
        ("session".to_string(), experiment.to_string()),
        ("overwrite".to_string(), overwrite.as_str().to_string()),
        ("Direct-Archive".to_string(), direct_archive.to_string()),
        ("inbody".to_string(), "true".to_string()),
    ];
    let query_refs: Vec<(&str, &str)> = query.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

    let response = session
        .request(
            reqwest::Method::POST,
            "/data/services/import",
            &query_refs,
            &[],
            RequestBody::Bytes { bytes, content_type },
            None,
        )
        .await
        .map_err(XnatError::Connection)?;

    let status = response.status();
    let archive_name = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let result: Result<(), String> = if status.as_u16() == 200 {
        Ok(())
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(format!("Status {}: {}", status.as_u16(), body.chars().take(200).collect::<String>()))
    };
    record_audit(audit, "prebuilt-archive-import", project, subject, experiment, &archive_name, size, &result);
    result.map_err(|reason| {
        XnatError::Upload(UploadError::Archive {
            archive_path: archive_path.display().to_string(),
            reason,
        })
    })
}

/// Why a resource PUT failed, kept distinct from a plain string so a
/// caller wrapping the call in the retry engine (C5) can classify a
/// connection-level failure by its underlying `reqwest::Error` type
/// instead of matching on the rendered message.
enum PutFileError {
    Connection(ConnectionError),
    Status { status: u16, body: String },
}

impl std::fmt::Display for PutFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PutFileError::Connection(e) => write!(f, "{e}"),
            PutFileError::Status { status, body } => write!(f, "Status {status}: {body}"),
        }
    }
}

impl PutFileError {
    /// Classify the underlying transport failure, if any. `None` covers
    /// both a non-2xx HTTP status (not itself transient, per §4.5) and a
    /// connection error whose source wasn't a `reqwest::Error` we can
    /// inspect.
    fn transient_kind(&self) -> Option<TransientKind> {
        match self {
            PutFileError::Connection(ConnectionError::ServerUnreachable { source, .. }) => {
                source.downcast_ref::<reqwest::Error>().and_then(classify_reqwest_error)
            }
            _ => None,
        }
    }
}

async fn put_file_bytes(
    session: &Session,
    path: &str,
    query_suffix: &str,
    bytes: Vec<u8>,
    content_type: &str,
) -> Result<(), PutFileError> {
    let full_path = format!("{path}{query_suffix}");
    let response = session
        .request(
            reqwest::Method::PUT,
            &full_path,
            &[],
            &[],
            RequestBody::Bytes { bytes, content_type: content_type.to_string() },
            None,
        )
        .await
        .map_err(PutFileError::Connection)?;
    match response.status().as_u16() {
        200 | 201 => Ok(()),
        status => {
            let body = response.text().await.unwrap_or_default();
            Err(PutFileError::Status { status, body: body.chars().take(200).collect() })
        }
    }
}

fn record_audit(
    audit: &SharedAuditSink,
    operation: &str,
    project: &str,
    subject: &str,
    experiment: &str,
    name: &str,
    size: u64,
    result: &Result<(), String>,
) {
    let record = AuditRecordBuilder::new(operation, "system")
        .target(Some(project), Some(subject), Some(experiment))
        .detail("name", name)
        .detail("bytes", size)
        .finish(result.is_ok(), result.as_ref().err().cloned());
    audit.record(record);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_segment_escapes_path_separators() {
        assert_eq!(encode_segment("weird label/with space"), "weird%20label%2Fwith%20space");
    }

    #[test]
    fn http_status_failure_is_not_transient() {
        let err = PutFileError::Status { status: 500, body: "broken".to_string() };
        assert!(err.transient_kind().is_none());
        assert_eq!(err.to_string(), "Status 500: broken");
    }

    #[test]
    fn session_expired_is_not_transient() {
        let err = PutFileError::Connection(ConnectionError::SessionExpired);
        assert!(err.transient_kind().is_none());
    }
}
