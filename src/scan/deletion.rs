//! Scan Deletion Engine (C10): list -> plan -> (optionally) execute, with
//! per-item error accounting and a bounded-parallel delete pool. The
//! listing session is opened once and shared across delete workers
//! (object-API operations reuse a single long-lived token on the driving
//! task, unlike the import uploader's per-batch sessions).

use std::collections::HashMap;
use std::sync::Arc;

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use regex::Regex;
use tokio::sync::Semaphore;

use crate::error::{OperationError, XnatError};
use crate::http::{Connection, ResultSetEnvelope, ScanRow, Session};
use crate::progress::{AuditRecordBuilder, SharedAuditSink};
use crate::validators::validate_scan_id;

/// Scan deletion's worker pool is capped at 10 regardless of how many
/// targets there are.
const MAX_PARALLEL_DELETES: usize = 10;

fn encode_segment(value: &str) -> String {
    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
}

/// Fetch the live scan listing and return deduplicated ids, preferring the
/// explicit `ID` column and falling back to regex-mining `/scans/(\d+)`
/// out of a free-form `URI` column.
async fn list_scan_ids(
    session: &Session,
    project: &str,
    subject: &str,
    experiment: &str,
) -> Result<Vec<String>, XnatError> {
    let path = format!(
        "/data/projects/{}/subjects/{}/experiments/{}/scans",
        encode_segment(project),
        encode_segment(subject),
        encode_segment(experiment)
    );
    let response = session
        .get(&path, &[("format", "json")])
        .await
        .map_err(XnatError::Connection)?;
    if !response.status().is_success() {
        return Err(XnatError::Operation(OperationError::Delete(format!(
            "GET {path} returned status {}",
            response.status().as_u16()
        ))));
    }

    let envelope: ResultSetEnvelope<ScanRow> = response
        .json()
        .await
        .map_err(|e| XnatError::Operation(OperationError::Delete(e.to_string())))?;

    let uri_pattern = Regex::new(r"/scans/(\d+)").unwrap();
    let mut seen = std::collections::HashSet::new();
    let mut ids = Vec::new();
    for row in envelope.into_rows() {
        let id = row
            .id
            .filter(|v| !v.is_empty())
            .or_else(|| row.uri.as_deref().and_then(|uri| uri_pattern.captures(uri)).map(|c| c[1].to_string()));
        if let Some(id) = id {
            if seen.insert(id.clone()) {
                ids.push(id);
            }
        }
    }
    Ok(ids)
}

/// The outcome of the planning step: which scans will be deleted, and
/// which caller-supplied ids were skipped because they aren't present in
/// the live listing.
#[derive(Debug, Clone, Default)]
pub struct DeletionPlan {
    pub to_delete: Vec<String>,
    pub skipped: Vec<String>,
}

/// Plan a deletion run. `explicit_ids: None` means "delete everything in
/// the live listing"; `Some(ids)` validates each id and partitions it
/// into `to_delete` (present in `live_ids`) or `skipped` (not present).
fn plan_deletion(explicit_ids: Option<&[String]>, live_ids: &[String]) -> Result<DeletionPlan, XnatError> {
    match explicit_ids {
        None => Ok(DeletionPlan {
            to_delete: live_ids.to_vec(),
            skipped: Vec::new(),
        }),
        Some(ids) => {
            let mut plan = DeletionPlan::default();
            for id in ids {
                validate_scan_id(id)?;
                if live_ids.contains(id) {
                    plan.to_delete.push(id.clone());
                } else {
                    plan.skipped.push(id.clone());
                }
            }
            Ok(plan)
        }
    }
}

async fn delete_one_scan(
    session: &Session,
    project: &str,
    subject: &str,
    experiment: &str,
    scan_id: &str,
) -> Result<(), String> {
    let path = format!(
        "/data/projects/{}/subjects/{}/experiments/{}/scans/{}",
        encode_segment(project),
        encode_segment(subject),
        encode_segment(experiment),
        encode_segment(scan_id)
    );
    let response = session
        .delete(&path, &[("delete_files", "true")])
        .await
        .map_err(|e| e.to_string())?;
    if response.status().is_success() {
        Ok(())
    } else {
        Err(format!("status {}", response.status().as_u16()))
    }
}

/// Everything a scan-deletion run needs.
pub struct ScanDeletionRequest {
    pub connection: Connection,
    pub project: String,
    pub subject: String,
    pub session: String,
    /// `None` deletes every scan in the live listing; `Some(ids)` deletes
    /// (or skips) only the named ids.
    pub scan_ids: Option<Vec<String>>,
    pub dry_run: bool,
    pub parallel: bool,
    pub max_workers: usize,
}

/// Result of a scan-deletion run.
#[derive(Debug, Clone)]
pub struct ScanDeletionResult {
    pub deleted: Vec<String>,
    pub failed: HashMap<String, String>,
    pub skipped: Vec<String>,
    pub dry_run: bool,
}

/// List -> plan -> (unless `dry_run`) execute. The listing/delete session
/// is opened once, shared read-only across delete workers, and released
/// on return.
pub async fn run_scan_deletion(
    request: ScanDeletionRequest,
    audit: SharedAuditSink,
) -> Result<ScanDeletionResult, XnatError> {
    let started = std::time::Instant::now();
    let session = Session::open(request.connection.clone()).await.map_err(XnatError::Connection)?;

    let live_ids = list_scan_ids(&session, &request.project, &request.subject, &request.session).await?;
    let plan = match plan_deletion(request.scan_ids.as_deref(), &live_ids) {
        Ok(plan) => plan,
        Err(e) => {
            session.release().await;
            return Err(e);
        }
    };

    if request.dry_run {
        session.release().await;
        let result = ScanDeletionResult {
            deleted: Vec::new(),
            failed: HashMap::new(),
            skipped: plan.skipped,
            dry_run: true,
        };
        emit_audit(&audit, &request, &result, started);
        return Ok(result);
    }

    let session = Arc::new(session);
    let pool_size = request.max_workers.min(MAX_PARALLEL_DELETES).max(1).min(plan.to_delete.len().max(1));

    let mut results: Vec<(String, Result<(), String>)> = Vec::with_capacity(plan.to_delete.len());
    if request.parallel && plan.to_delete.len() > 1 {
        let semaphore = Arc::new(Semaphore::new(pool_size));
        let mut handles = Vec::with_capacity(plan.to_delete.len());
        for scan_id in plan.to_delete {
            let semaphore = semaphore.clone();
            let session = session.clone();
            let project = request.project.clone();
            let subject = request.subject.clone();
            let experiment = request.session.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("delete semaphore closed");
                let outcome = delete_one_scan(&session, &project, &subject, &experiment, &scan_id).await;
                (scan_id, outcome)
            }));
        }
        for handle in handles {
            results.push(handle.await.expect("delete task panicked"));
        }
    } else {
        for scan_id in plan.to_delete {
            let outcome = delete_one_scan(&session, &request.project, &request.subject, &request.session, &scan_id).await;
            results.push((scan_id, outcome));
        }
    }

    match Arc::try_unwrap(session) {
        Ok(session) => session.release().await,
        Err(_) => tracing::warn!("scan-deletion session had outstanding references at release time"),
    }

    let mut deleted = Vec::new();
    let mut failed = HashMap::new();
    for (id, outcome) in results {
        match outcome {
            Ok(()) => deleted.push(id),
            Err(reason) => {
                failed.insert(id, reason);
            }
        }
    }

    let result = ScanDeletionResult {
        deleted,
        failed,
        skipped: plan.skipped,
        dry_run: false,
    };
    emit_audit(&audit, &request, &result, started);
    Ok(result)
}

fn emit_audit(
    audit: &SharedAuditSink,
    request: &ScanDeletionRequest,
    result: &ScanDeletionResult,
    started: std::time::Instant,
) {
    let success = result.failed.is_empty();
    let record = AuditRecordBuilder::new("scan-delete", &request.connection.username)
        .target(Some(&request.project), Some(&request.subject), Some(&request.session))
        .duration_ms(started.elapsed().as_millis() as u64)
        .detail("deleted", result.deleted.len())
        .detail("failed", result.failed.len())
        .detail("skipped", result.skipped.len())
        .detail("dry_run", result.dry_run)
        .finish(
            success,
            (!success)
                .then(|| result.failed.iter().map(|(id, reason)| format!("{id}: {reason}")).collect::<Vec<_>>().join("; ")),
        );
    audit.record(record);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_ids_partition_into_delete_and_skip() {
        let live = vec!["1".to_string(), "2".to_string(), "3".to_string()];
        let plan = plan_deletion(Some(&["1".to_string(), "5".to_string()]), &live).unwrap();
        assert_eq!(plan.to_delete, vec!["1".to_string()]);
        assert_eq!(plan.skipped, vec!["5".to_string()]);
    }

    #[test]
    fn none_deletes_everything_in_the_live_listing() {
        let live = vec!["1".to_string(), "2".to_string()];
        let plan = plan_deletion(None, &live).unwrap();
        assert_eq!(plan.to_delete, live);
        assert!(plan.skipped.is_empty());
    }

    #[test]
    fn invalid_explicit_id_is_rejected() {
        let live = vec!["1".to_string()];
        let err = plan_deletion(Some(&["bad id!".to_string()]), &live);
        assert!(err.is_err());
    }
}
