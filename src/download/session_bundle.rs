//! Streaming download primitives (scans bundle, enumerated resources,
//! assessor/reconstruction resources) and the session-level orchestrator
//! that composes them into `out_dir/<session>/`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::TryStreamExt;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio_util::io::StreamReader;

use crate::error::{DownloadError, XnatError};
use crate::http::{ResourceRow, ResultSetEnvelope, Session};
use crate::progress::{AuditRecordBuilder, Phase, ProgressEvent, SharedAuditSink, SharedProgressSink};

const READ_CHUNK_BYTES: usize = 1024 * 1024;
const PROGRESS_LOG_THRESHOLD_BYTES: u64 = 5 * 1024 * 1024;

fn encode_segment(value: &str) -> String {
    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
}

/// Replace `/` and space with `_`, per the resources-bundle filename rule.
fn sanitize_label(label: &str) -> String {
    label.replace(['/', ' '], "_")
}

/// Stream a GET response's body into `dest_path` in 1 MB reads, logging
/// progress at 5 MB cumulative thresholds. Returns the total bytes
/// written.
async fn stream_response_to_file(
    response: reqwest::Response,
    dest_path: &Path,
    label: &str,
) -> std::io::Result<u64> {
    let byte_stream = response
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    let mut reader = StreamReader::new(byte_stream);
    let mut file = tokio::fs::File::create(dest_path).await?;

    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    let mut total: u64 = 0;
    let mut last_logged: u64 = 0;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        total += n as u64;
        if total - last_logged >= PROGRESS_LOG_THRESHOLD_BYTES {
            tracing::debug!("{label}: downloaded {total} bytes");
            last_logged = total;
        }
    }
    file.flush().await?;
    Ok(total)
}

/// GET `path` with `query` and stream the response body to `dest_path`.
/// Any non-2xx status is surfaced as a [`DownloadError`] for the driver to
/// classify.
async fn fetch_to_file(
    session: &Session,
    path: &str,
    query: &[(&str, &str)],
    dest_path: &Path,
    session_triple: (&str, &str, &str),
    label: &str,
) -> Result<u64, DownloadError> {
    let download_err = |reason: String| DownloadError::Session {
        project: session_triple.0.to_string(),
        subject: session_triple.1.to_string(),
        session: session_triple.2.to_string(),
        reason,
    };

    let response = session
        .get(path, query)
        .await
        .map_err(|e| download_err(e.to_string()))?;
    if !response.status().is_success() {
        return Err(download_err(format!(
            "GET {path} returned status {}",
            response.status().as_u16()
        )));
    }

    stream_response_to_file(response, dest_path, label)
        .await
        .map_err(|e| download_err(e.to_string()))
}

/// GET `.../experiments/<e>/scans/ALL/files?format=zip` -> `scans.zip`.
pub async fn download_scans_bundle(
    session: &Session,
    project: &str,
    subject: &str,
    experiment: &str,
    out_dir: &Path,
) -> Result<PathBuf, DownloadError> {
    let path = format!(
        "/data/projects/{}/subjects/{}/experiments/{}/scans/ALL/files",
        encode_segment(project),
        encode_segment(subject),
        encode_segment(experiment)
    );
    let dest = out_dir.join("scans.zip");
    fetch_to_file(
        session,
        &path,
        &[("format", "zip")],
        &dest,
        (project, subject, experiment),
        "scans.zip",
    )
    .await?;
    Ok(dest)
}

/// Enumerate session-level resource labels via the object API
/// (`.../resources?format=json`, `label` column), falling back to mining
/// `/resources/<label>/files` out of a free-form `URI` when `label` is
/// absent from a row.
pub async fn list_resource_labels(
    session: &Session,
    project: &str,
    subject: &str,
    experiment: &str,
) -> Result<Vec<String>, DownloadError> {
    let path = format!(
        "/data/projects/{}/subjects/{}/experiments/{}/resources",
        encode_segment(project),
        encode_segment(subject),
        encode_segment(experiment)
    );
    let download_err = |reason: String| DownloadError::Session {
        project: project.to_string(),
        subject: subject.to_string(),
        session: experiment.to_string(),
        reason,
    };

    let response = session
        .get(&path, &[("format", "json")])
        .await
        .map_err(|e| download_err(e.to_string()))?;
    if !response.status().is_success() {
        return Err(download_err(format!(
            "GET {path} returned status {}",
            response.status().as_u16()
        )));
    }

    let envelope: ResultSetEnvelope<ResourceRow> = response
        .json()
        .await
        .map_err(|e| download_err(e.to_string()))?;

    let uri_pattern = regex::Regex::new(r"/resources/([^/]+)/files").unwrap();
    let mut labels = Vec::new();
    for row in envelope.into_rows() {
        if let Some(label) = row.label.filter(|l| !l.is_empty()) {
            labels.push(label);
            continue;
        }
        if let Some(uri) = row.uri {
            if let Some(captures) = uri_pattern.captures(&uri) {
                labels.push(captures[1].to_string());
            }
        }
    }
    Ok(labels)
}

/// Download every session-level resource label into
/// `resources_<sanitized-label>.zip`.
pub async fn download_session_resources(
    session: &Session,
    project: &str,
    subject: &str,
    experiment: &str,
    out_dir: &Path,
) -> Result<Vec<PathBuf>, DownloadError> {
    let labels = list_resource_labels(session, project, subject, experiment).await?;
    let mut downloaded = Vec::with_capacity(labels.len());
    for label in labels {
        let path = format!(
            "/data/projects/{}/subjects/{}/experiments/{}/resources/{}/files",
            encode_segment(project),
            encode_segment(subject),
            encode_segment(experiment),
            encode_segment(&label)
        );
        let filename = format!("resources_{}.zip", sanitize_label(&label));
        let dest = out_dir.join(&filename);
        fetch_to_file(
            session,
            &path,
            &[("format", "zip")],
            &dest,
            (project, subject, experiment),
            &filename,
        )
        .await?;
        downloaded.push(dest);
    }
    Ok(downloaded)
}

/// The two supplementary bundle kinds, which may legitimately be empty
/// for a session: a fetch failure is not an error at this layer, it is
/// simply omitted and logged at debug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupplementaryKind {
    Assessors,
    Reconstructions,
}

impl SupplementaryKind {
    fn path_segment(&self) -> &'static str {
        match self {
            SupplementaryKind::Assessors => "assessors",
            SupplementaryKind::Reconstructions => "reconstructions",
        }
    }

    fn filename(&self) -> &'static str {
        match self {
            SupplementaryKind::Assessors => "assessor_resources.zip",
            SupplementaryKind::Reconstructions => "recon_resources.zip",
        }
    }
}

/// GET `.../<kind>/ALL/resources/ALL/files?format=zip`. Returns `None`
/// (rather than an error) on any failure, since an empty assessor or
/// reconstruction set is a legitimate session state.
pub async fn download_supplementary_bundle(
    session: &Session,
    project: &str,
    subject: &str,
    experiment: &str,
    out_dir: &Path,
    kind: SupplementaryKind,
) -> Option<PathBuf> {
    let path = format!(
        "/data/projects/{}/subjects/{}/experiments/{}/{}/ALL/resources/ALL/files",
        encode_segment(project),
        encode_segment(subject),
        encode_segment(experiment),
        kind.path_segment()
    );
    let dest = out_dir.join(kind.filename());
    match fetch_to_file(
        session,
        &path,
        &[("format", "zip")],
        &dest,
        (project, subject, experiment),
        kind.filename(),
    )
    .await
    {
        Ok(_) => Some(dest),
        Err(e) => {
            tracing::debug!("skipping {}: {e}", kind.filename());
            let _ = std::fs::remove_file(&dest);
            None
        }
    }
}

/// Everything a session-level download needs.
pub struct DownloadSessionRequest {
    pub connection: crate::http::Connection,
    pub project: String,
    pub subject: String,
    pub session: String,
    pub out_dir: PathBuf,
    pub include_assessors: bool,
    pub include_recons: bool,
    pub parallel: bool,
    pub max_workers: usize,
}

/// Outcome of a session-level download.
#[derive(Debug, Clone)]
pub struct SessionDownloadResult {
    pub session_dir: PathBuf,
    pub scans: PathBuf,
    pub resources: Vec<PathBuf>,
    pub assessors: Option<PathBuf>,
    pub reconstructions: Option<PathBuf>,
}

enum DownloadTask {
    Scans,
    Resources,
    Assessors,
    Reconstructions,
}

enum TaskOutcome {
    Scans(Result<PathBuf, DownloadError>),
    Resources(Result<Vec<PathBuf>, DownloadError>),
    Assessors(Option<PathBuf>),
    Reconstructions(Option<PathBuf>),
}

async fn run_task(
    session: Arc<Session>,
    project: String,
    subject: String,
    experiment: String,
    out_dir: PathBuf,
    task: DownloadTask,
) -> TaskOutcome {
    match task {
        DownloadTask::Scans => {
            TaskOutcome::Scans(download_scans_bundle(&session, &project, &subject, &experiment, &out_dir).await)
        }
        DownloadTask::Resources => TaskOutcome::Resources(
            download_session_resources(&session, &project, &subject, &experiment, &out_dir).await,
        ),
        DownloadTask::Assessors => TaskOutcome::Assessors(
            download_supplementary_bundle(
                &session,
                &project,
                &subject,
                &experiment,
                &out_dir,
                SupplementaryKind::Assessors,
            )
            .await,
        ),
        DownloadTask::Reconstructions => TaskOutcome::Reconstructions(
            download_supplementary_bundle(
                &session,
                &project,
                &subject,
                &experiment,
                &out_dir,
                SupplementaryKind::Reconstructions,
            )
            .await,
        ),
    }
}

/// Create `out_dir/<session>/`, fan out across scans/resources/optional
/// assessors/reconstructions (parallel pool sized
/// `min(max_workers, len(tasks))` when `parallel && len(tasks) > 1`, else
/// serial), and emit a completion audit record.
pub async fn download_session(
    request: DownloadSessionRequest,
    progress: SharedProgressSink,
    audit: SharedAuditSink,
) -> Result<SessionDownloadResult, XnatError> {
    let started = std::time::Instant::now();
    let session_dir = request.out_dir.join(&request.session);
    std::fs::create_dir_all(&session_dir).map_err(|e| {
        XnatError::Download(DownloadError::Session {
            project: request.project.clone(),
            subject: request.subject.clone(),
            session: request.session.clone(),
            reason: e.to_string(),
        })
    })?;

    progress.emit(ProgressEvent::new(Phase::Downloading, "opening download session"));
    let http_session = Arc::new(Session::open(request.connection.clone()).await.map_err(XnatError::Connection)?);

    let mut tasks = vec![DownloadTask::Scans, DownloadTask::Resources];
    if request.include_assessors {
        tasks.push(DownloadTask::Assessors);
    }
    if request.include_recons {
        tasks.push(DownloadTask::Reconstructions);
    }
    let total_tasks = tasks.len();

    let mut outcomes = Vec::with_capacity(tasks.len());
    if request.parallel && tasks.len() > 1 {
        let pool_size = request.max_workers.max(1).min(tasks.len());
        let semaphore = Arc::new(Semaphore::new(pool_size));
        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            let semaphore = semaphore.clone();
            let session = http_session.clone();
            let project = request.project.clone();
            let subject = request.subject.clone();
            let experiment = request.session.clone();
            let out_dir = session_dir.clone();
            let progress = progress.clone();
            let correlation = crate::correlation::inherit();

            handles.push(tokio::spawn(crate::correlation::with_id(correlation, move || async move {
                let _permit = semaphore.acquire_owned().await.expect("download semaphore closed");
                let outcome = run_task(session, project, subject, experiment, out_dir, task).await;
                progress.emit(
                    ProgressEvent::new(Phase::Downloading, "download task finished")
                        .with_progress(1, total_tasks),
                );
                outcome
            })));
        }
        for handle in handles {
            outcomes.push(handle.await.expect("download task panicked"));
        }
    } else {
        for task in tasks {
            let outcome = run_task(
                http_session.clone(),
                request.project.clone(),
                request.subject.clone(),
                request.session.clone(),
                session_dir.clone(),
                task,
            )
            .await;
            progress.emit(
                ProgressEvent::new(Phase::Downloading, "download task finished")
                    .with_progress(outcomes.len() + 1, total_tasks),
            );
            outcomes.push(outcome);
        }
    }

    // Every spawned task above has completed and dropped its clone, so this
    // should always hold the sole reference. Release is best-effort anyway
    // (errors swallowed per the session contract), so a stray extra
    // reference just means the session times out server-side instead.
    match Arc::try_unwrap(http_session) {
        Ok(session) => session.release().await,
        Err(_) => tracing::warn!("download session had outstanding references at release time"),
    }

    let mut scans = None;
    let mut resources = Vec::new();
    let mut assessors = None;
    let mut reconstructions = None;
    let mut errors = Vec::new();

    for outcome in outcomes {
        match outcome {
            TaskOutcome::Scans(Ok(path)) => scans = Some(path),
            TaskOutcome::Scans(Err(e)) => errors.push(e.to_string()),
            TaskOutcome::Resources(Ok(paths)) => resources = paths,
            TaskOutcome::Resources(Err(e)) => errors.push(e.to_string()),
            TaskOutcome::Assessors(path) => assessors = path,
            TaskOutcome::Reconstructions(path) => reconstructions = path,
        }
    }

    let success = errors.is_empty() && scans.is_some();
    let record = AuditRecordBuilder::new("session-download", &request.connection.username)
        .target(Some(&request.project), Some(&request.subject), Some(&request.session))
        .duration_ms(started.elapsed().as_millis() as u64)
        .detail("resources_downloaded", resources.len())
        .detail("assessors_downloaded", assessors.is_some())
        .detail("reconstructions_downloaded", reconstructions.is_some())
        .finish(success, (!errors.is_empty()).then(|| errors.join("; ")));
    audit.record(record);

    let scans = scans.ok_or_else(|| {
        XnatError::Download(DownloadError::Session {
            project: request.project.clone(),
            subject: request.subject.clone(),
            session: request.session.clone(),
            reason: errors.join("; "),
        })
    })?;

    progress.emit(ProgressEvent::new(Phase::Complete, "download complete"));
    Ok(SessionDownloadResult {
        session_dir,
        scans,
        resources,
        assessors,
        reconstructions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_label_replaces_slashes_and_spaces() {
        assert_eq!(sanitize_label("DICOM raw/extra"), "DICOM_raw_extra");
    }

    #[test]
    fn supplementary_kind_filenames_match_spec() {
        assert_eq!(SupplementaryKind::Assessors.filename(), "assessor_resources.zip");
        assert_eq!(SupplementaryKind::Reconstructions.filename(), "recon_resources.zip");
    }
}
