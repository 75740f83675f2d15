//! Import Uploader (C6): the highest-concurrency pipeline in the core.
//!
//! Scan -> split -> archive fan-out -> upload fan-out -> aggregate ->
//! cleanup, with a stage barrier between archiving and uploading (archive
//! pool drains completely before the upload pool starts, per the
//! concurrency model). Each upload worker opens and releases its own
//! HTTP session so a server that ties throughput to the session, or an
//! auth failure on one worker, never touches its siblings.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;

use crate::archive::{build_archive, ArchiveFormat};
use crate::batch::{split_into_batches, Batch};
use crate::error::{UploadError, ValidationError, XnatError};
use crate::http::{Connection, RequestBody, Session};
use crate::progress::{AuditRecordBuilder, Phase, ProgressEvent, SharedAuditSink, SharedProgressSink};
use crate::validators::OverwriteMode;
use crate::walker::discover_dicom_files;

/// Everything a single import run needs. `direct_archive` has no default
/// per the design note on the source's ambiguous defaults — callers must
/// choose explicitly.
pub struct ImportRequest {
    pub connection: Connection,
    pub source_dir: PathBuf,
    pub project: String,
    pub subject: String,
    pub session: String,
    pub num_batches: i64,
    pub upload_workers: usize,
    pub archive_workers: usize,
    pub archive_format: ArchiveFormat,
    pub import_handler: String,
    pub overwrite: OverwriteMode,
    pub overwrite_files: bool,
    pub quarantine: bool,
    pub trigger_pipelines: bool,
    pub rename: bool,
    pub direct_archive: bool,
    pub ignore_unparsable: bool,
    pub include_extensionless: bool,
}

impl ImportRequest {
    pub fn import_handler_default() -> &'static str {
        "DICOM-zip"
    }
}

/// Outcome of uploading one batch's archive.
#[derive(Debug, Clone)]
pub struct UploadResult {
    pub batch_id: usize,
    pub success: bool,
    pub duration_seconds: f64,
    pub file_count: usize,
    pub archive_bytes: u64,
    pub error: Option<String>,
}

/// Outcome of a whole import run. `success <=> batches_failed == 0`.
#[derive(Debug, Clone)]
pub struct UploadSummary {
    pub success: bool,
    pub total_files: usize,
    pub total_bytes: u64,
    pub duration_seconds: f64,
    pub batches_succeeded: usize,
    pub batches_failed: usize,
    pub errors: Vec<String>,
}

impl UploadSummary {
    fn empty_source() -> Self {
        Self {
            success: false,
            total_files: 0,
            total_bytes: 0,
            duration_seconds: 0.0,
            batches_succeeded: 0,
            batches_failed: 0,
            errors: vec!["No DICOM files found".to_string()],
        }
    }

    fn from_results(results: &[UploadResult], total_files: usize, duration_seconds: f64) -> Self {
        let total_bytes = results.iter().map(|r| r.archive_bytes).sum();
        let batches_succeeded = results.iter().filter(|r| r.success).count();
        let batches_failed = results.len() - batches_succeeded;
        let errors = results
            .iter()
            .filter(|r| !r.success)
            .map(|r| {
                format!(
                    "Batch {}: {}",
                    r.batch_id + 1,
                    r.error.as_deref().unwrap_or("unknown error")
                )
            })
            .collect();
        Self {
            success: batches_failed == 0,
            total_files,
            total_bytes,
            duration_seconds,
            batches_succeeded,
            batches_failed,
            errors,
        }
    }
}

/// Run the full import pipeline. Errors here are reserved for conditions
/// that prevent even attempting an upload (a missing source root); every
/// other failure mode is folded into the returned [`UploadSummary`].
pub async fn run_import(
    request: ImportRequest,
    progress: SharedProgressSink,
    audit: SharedAuditSink,
) -> Result<UploadSummary, XnatError> {
    let started = Instant::now();
    let user = request.connection.username.clone();

    progress.emit(ProgressEvent::new(Phase::Scanning, "scanning source directory"));
    let files = discover_dicom_files(&request.source_dir, request.include_extensionless)
        .map_err(XnatError::Validation)?;

    if files.is_empty() {
        let summary = UploadSummary::empty_source();
        emit_completion_audit(&audit, &request, &user, &summary, started);
        progress.emit(ProgressEvent::new(Phase::Error, "No DICOM files found").failed(vec![
            "No DICOM files found".to_string(),
        ]));
        return Ok(summary);
    }
    let total_files = files.len();

    let batches = split_into_batches(&files, request.num_batches);
    progress.emit(
        ProgressEvent::new(Phase::Archiving, format!("split into {} batches", batches.len()))
            .with_progress(0, batches.len()),
    );

    let run_dir = std::env::temp_dir().join(format!("xnat-import-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&run_dir).map_err(|e| {
        XnatError::Upload(UploadError::Archive {
            archive_path: run_dir.display().to_string(),
            reason: e.to_string(),
        })
    })?;

    let archive_result = archive_batches(&request, &batches, &run_dir, progress.clone()).await;
    let archived = match archive_result {
        Ok(archived) => archived,
        Err(e) => {
            let _ = std::fs::remove_dir_all(&run_dir);
            let summary = UploadSummary {
                success: false,
                total_files,
                total_bytes: 0,
                duration_seconds: started.elapsed().as_secs_f64(),
                batches_succeeded: 0,
                batches_failed: batches.len(),
                errors: vec![e.to_string()],
            };
            emit_completion_audit(&audit, &request, &user, &summary, started);
            return Ok(summary);
        }
    };

    let results = upload_archives(&request, archived, progress.clone()).await;
    let _ = std::fs::remove_dir_all(&run_dir);

    let summary = UploadSummary::from_results(&results, total_files, started.elapsed().as_secs_f64());
    if summary.success {
        progress.emit(ProgressEvent::new(Phase::Complete, "import complete").with_progress(
            summary.batches_succeeded,
            summary.batches_succeeded + summary.batches_failed,
        ));
    } else {
        progress.emit(
            ProgressEvent::new(Phase::Error, "import finished with failures")
                .failed(summary.errors.clone()),
        );
    }
    emit_completion_audit(&audit, &request, &user, &summary, started);
    Ok(summary)
}

fn emit_completion_audit(
    audit: &SharedAuditSink,
    request: &ImportRequest,
    user: &str,
    summary: &UploadSummary,
    started: Instant,
) {
    let record = AuditRecordBuilder::new("import", user)
        .target(Some(&request.project), Some(&request.subject), Some(&request.session))
        .duration_ms(started.elapsed().as_millis() as u64)
        .detail("total_files", summary.total_files)
        .detail("batches_succeeded", summary.batches_succeeded)
        .detail("batches_failed", summary.batches_failed)
        .finish(
            summary.success,
            (!summary.success).then(|| summary.errors.join("; ")),
        );
    audit.record(record);
}

struct ArchivedBatch {
    batch_id: usize,
    path: PathBuf,
    file_count: usize,
    bytes: u64,
}

async fn archive_batches(
    request: &ImportRequest,
    batches: &[Batch],
    run_dir: &std::path::Path,
    progress: SharedProgressSink,
) -> Result<Vec<ArchivedBatch>, ValidationError> {
    let pool_size = request.archive_workers.max(1).min(batches.len().max(1));
    let semaphore = Arc::new(Semaphore::new(pool_size));
    let total = batches.len();
    let source_dir = request.source_dir.clone();
    let format = request.archive_format;

    let mut tasks = Vec::with_capacity(batches.len());
    for batch in batches {
        let semaphore = semaphore.clone();
        let source_dir = source_dir.clone();
        let dest_path = run_dir.join(format!("batch_{}.{}", batch.id, format.extension()));
        let files = batch.files.clone();
        let file_count = files.len();
        let batch_id = batch.id;
        let progress = progress.clone();
        let correlation = crate::correlation::inherit();

        tasks.push(tokio::spawn(crate::correlation::with_id(correlation, move || async move {
            let _permit = semaphore.acquire_owned().await.expect("archive semaphore closed");
            let dest_path_clone = dest_path.clone();
            let bytes = tokio::task::spawn_blocking(move || {
                build_archive(&files, &source_dir, format, &dest_path_clone)
            })
            .await
            .expect("archive worker panicked")
            .map_err(|e| ValidationError::InvalidPath {
                path: dest_path.clone(),
                reason: e.to_string(),
            })?;

            progress.emit(
                ProgressEvent::new(Phase::Archiving, format!("archived batch {batch_id}"))
                    .with_batch(batch_id)
                    .with_progress(batch_id + 1, total),
            );

            Ok::<ArchivedBatch, ValidationError>(ArchivedBatch {
                batch_id,
                path: dest_path,
                file_count,
                bytes,
            })
        })));
    }

    let mut archived = Vec::with_capacity(tasks.len());
    for task in tasks {
        archived.push(task.await.expect("archive task panicked")?);
    }
    archived.sort_by_key(|a| a.batch_id);
    Ok(archived)
}

async fn upload_archives(
    request: &ImportRequest,
    archived: Vec<ArchivedBatch>,
    progress: SharedProgressSink,
) -> Vec<UploadResult> {
    let pool_size = request.upload_workers.max(1).min(archived.len().max(1));
    let semaphore = Arc::new(Semaphore::new(pool_size));
    let total = archived.len();

    let mut tasks = Vec::with_capacity(archived.len());
    for batch in archived {
        let semaphore = semaphore.clone();
        let connection = request.connection.clone();
        let project = request.project.clone();
        let subject = request.subject.clone();
        let session = request.session.clone();
        let import_handler = request.import_handler.clone();
        let overwrite = request.overwrite;
        let overwrite_files = request.overwrite_files;
        let quarantine = request.quarantine;
        let trigger_pipelines = request.trigger_pipelines;
        let rename = request.rename;
        let direct_archive = request.direct_archive;
        let ignore_unparsable = request.ignore_unparsable;
        let progress = progress.clone();
        let correlation = crate::correlation::inherit();

        tasks.push(tokio::spawn(crate::correlation::with_id(correlation, move || async move {
            let _permit = semaphore.acquire_owned().await.expect("upload semaphore closed");
            let started = Instant::now();

            let outcome = upload_one_batch(
                connection,
                &project,
                &subject,
                &session,
                &import_handler,
                overwrite,
                overwrite_files,
                quarantine,
                trigger_pipelines,
                rename,
                direct_archive,
                ignore_unparsable,
                &batch.path,
            )
            .await;

            let result = UploadResult {
                batch_id: batch.batch_id,
                success: outcome.is_ok(),
                duration_seconds: started.elapsed().as_secs_f64(),
                file_count: batch.file_count,
                archive_bytes: batch.bytes,
                error: outcome.err(),
            };

            let event = ProgressEvent::new(
                Phase::Uploading,
                format!("batch {} {}", result.batch_id, if result.success { "uploaded" } else { "failed" }),
            )
            .with_batch(result.batch_id)
            .with_progress(0, total);
            progress.emit(match &result.error {
                Some(error) => event.failed(vec![error.clone()]),
                None => event,
            });

            result
        })));
    }

    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        results.push(task.await.expect("upload task panicked"));
    }
    results
}

#[allow(clippy::too_many_arguments)]
async fn upload_one_batch(
    connection: Connection,
    project: &str,
    subject: &str,
    session: &str,
    import_handler: &str,
    overwrite: OverwriteMode,
    overwrite_files: bool,
    quarantine: bool,
    trigger_pipelines: bool,
    rename: bool,
    direct_archive: bool,
    ignore_unparsable: bool,
    archive_path: &std::path::Path,
) -> Result<(), String> {
    let http_session = Session::open(connection)
        .await
        .map_err(|e| e.to_string())?;

    let result = send_archive(
        &http_session,
        project,
        subject,
        session,
        import_handler,
        overwrite,
        overwrite_files,
        quarantine,
        trigger_pipelines,
        rename,
        direct_archive,
        ignore_unparsable,
        archive_path,
    )
    .await;

    http_session.release().await;
    result
}

#[allow(clippy::too_many_arguments)]
async fn send_archive(
    http_session: &Session,
    project: &str,
    subject: &str,
    session: &str,
    import_handler: &str,
    overwrite: OverwriteMode,
    overwrite_files: bool,
    quarantine: bool,
    trigger_pipelines: bool,
    rename: bool,
    direct_archive: bool,
    ignore_unparsable: bool,
    archive_path: &std::path::Path,
) -> Result<(), String> {
    let content_type = ArchiveFormat::content_type_for_path(archive_path).to_string();
    let file = tokio::fs::File::open(archive_path)
        .await
        .map_err(|e| e.to_string())?;
    let stream = tokio_util::io::ReaderStream::new(file);
    let body = reqwest::Body::wrap_stream(stream);

    let query: Vec<(String, String)> = vec![
        ("import-handler".to_string(), import_handler.to_string()),
        ("project".to_string(), project.to_string()),
        ("subject".to_string(), subject.to_string()),
        ("session".to_string(), session.to_string()),
        ("overwrite".to_string(), overwrite.as_str().to_string()),
        ("overwrite_files".to_string(), overwrite_files.to_string()),
        ("quarantine".to_string(), quarantine.to_string()),
        ("triggerPipelines".to_string(), trigger_pipelines.to_string()),
        ("rename".to_string(), rename.to_string()),
        ("Direct-Archive".to_string(), direct_archive.to_string()),
        ("Ignore-Unparsable".to_string(), ignore_unparsable.to_string()),
        ("inbody".to_string(), "true".to_string()),
    ];
    let query_refs: Vec<(&str, &str)> = query.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

    let response = http_session
        .request(
            reqwest::Method::POST,
            "/data/services/import",
            &query_refs,
            &[],
            RequestBody::Stream { body, content_type },
            None,
        )
        .await
        .map_err(|e| match &e {
            crate::error::ConnectionError::ServerUnreachable { source, .. }
                if source.downcast_ref::<reqwest::Error>().map(|r| r.is_timeout()).unwrap_or(false) =>
            {
                "Upload timed out".to_string()
            }
            other => other.to_string(),
        })?;

    let status = response.status();
    if status.as_u16() == 200 {
        Ok(())
    } else {
        let body = response.text().await.unwrap_or_default();
        let prefix: String = body.chars().take(200).collect();
        Err(format!("Status {}: {}", status.as_u16(), prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_for_empty_source_reports_failure() {
        let summary = UploadSummary::empty_source();
        assert!(!summary.success);
        assert_eq!(summary.total_files, 0);
        assert_eq!(summary.errors, vec!["No DICOM files found".to_string()]);
    }

    #[test]
    fn summary_accounting_matches_results() {
        let results = vec![
            UploadResult {
                batch_id: 0,
                success: true,
                duration_seconds: 1.0,
                file_count: 2,
                archive_bytes: 100,
                error: None,
            },
            UploadResult {
                batch_id: 1,
                success: false,
                duration_seconds: 1.0,
                file_count: 1,
                archive_bytes: 50,
                error: Some("Status 500: broken".to_string()),
            },
        ];
        let summary = UploadSummary::from_results(&results, 3, 2.0);
        assert!(!summary.success);
        assert_eq!(summary.batches_succeeded, 1);
        assert_eq!(summary.batches_failed, 1);
        assert_eq!(summary.errors, vec!["Batch 2: Status 500: broken".to_string()]);
    }
}
