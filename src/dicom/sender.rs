//! DICOM Sender (C-STORE) (C7).
//!
//! One association per batch, held open for the batch's lifetime inside
//! `spawn_blocking` since the association and every C-STORE exchange on
//! it are synchronous at the OS socket level (mirrors the reference
//! client's `send_files_blocking`, which wraps the whole association
//! lifecycle in one blocking call).

use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dicom_core::value::{PrimitiveValue, Value};
use dicom_core::{DataElement, Tag, VR};
use dicom_object::open_file;
use dicom_ul::association::client::{ClientAssociation, ClientAssociationOptions};
use smallvec::smallvec;
use tokio::sync::Semaphore;

use crate::batch::{split_into_batches, Batch};
use crate::error::{DicomError, XnatError};
use crate::progress::{AuditRecordBuilder, Phase, ProgressEvent, SharedAuditSink, SharedProgressSink};

/// SOP class for C-ECHO verification.
const VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";

/// Vendor-specific storage context required by some scanners (Open
/// Question 3 in the design notes): hard-coded, but named so a future
/// caller can see and extend the catalog without spelunking.
pub const VENDOR_STORAGE_CONTEXT_UID: &str = "1.3.12.2.1107.5.9.1";

const TRANSFER_SYNTAXES: &[&str] = &[
    "1.2.840.10008.1.2.1", // Explicit VR Little Endian
    "1.2.840.10008.1.2",   // Implicit VR Little Endian
];

/// The standard storage SOP class catalog proposed on every batch
/// association, alongside [`VENDOR_STORAGE_CONTEXT_UID`].
const STORAGE_SOP_CLASSES: &[&str] = &[
    "1.2.840.10008.5.1.4.1.1.1",   // Computed Radiography Image Storage
    "1.2.840.10008.5.1.4.1.1.1.1", // Digital X-Ray Image Storage
    "1.2.840.10008.5.1.4.1.1.2",   // CT Image Storage
    "1.2.840.10008.5.1.4.1.1.3.1", // Ultrasound Multi-frame Image Storage
    "1.2.840.10008.5.1.4.1.1.4",   // MR Image Storage
    "1.2.840.10008.5.1.4.1.1.4.1", // Enhanced MR Image Storage
    "1.2.840.10008.5.1.4.1.1.6.1", // Ultrasound Image Storage
    "1.2.840.10008.5.1.4.1.1.7",   // Secondary Capture Image Storage
    "1.2.840.10008.5.1.4.1.1.20",  // Nuclear Medicine Image Storage
    "1.2.840.10008.5.1.4.1.1.128", // PET Image Storage
];

const COMMAND_FIELD_C_STORE_RQ: u16 = 0x0001;
const COMMAND_FIELD_C_ECHO_RQ: u16 = 0x0030;

pub struct DicomSenderConfig {
    pub dicom_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub called_aet: String,
    pub calling_aet: String,
    pub num_batches: i64,
    pub cleanup: bool,
    pub socket_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DicomStoreSummary {
    pub total_files: usize,
    pub sent: usize,
    pub failed: usize,
    pub log_directory: PathBuf,
    pub workspace_directory: PathBuf,
    pub success: bool,
}

/// Run the pre-flight C-ECHO, then send every batch in parallel (one
/// association per batch).
pub async fn run_dicom_send(
    config: DicomSenderConfig,
    files: Vec<PathBuf>,
    progress: SharedProgressSink,
    audit: SharedAuditSink,
) -> Result<DicomStoreSummary, XnatError> {
    progress.emit(ProgressEvent::new(Phase::Scanning, "verifying association with C-ECHO"));
    preflight_echo(&config).await?;

    let workspace = std::env::temp_dir().join(format!("xnat-dicom-{}", uuid::Uuid::new_v4()));
    let log_dir = workspace.join("logs");
    std::fs::create_dir_all(&log_dir).map_err(|e| {
        tracing::error!("failed to create DICOM workspace {}: {e}", log_dir.display());
        XnatError::Dicom(DicomError::StoreFailure {
            host: config.host.clone(),
            port: config.port,
            total: files.len(),
            sent: 0,
            failed: files.len(),
        })
    })?;

    let total_files = files.len();
    let batches = split_into_batches(&files, config.num_batches);

    let semaphore = Arc::new(Semaphore::new(batches.len().max(1)));
    let mut tasks = Vec::with_capacity(batches.len());
    for batch in &batches {
        let semaphore = semaphore.clone();
        let batch = batch.clone();
        let host = config.host.clone();
        let port = config.port;
        let called_aet = config.called_aet.clone();
        let calling_aet = config.calling_aet.clone();
        let timeout = config.socket_timeout;
        let log_dir = log_dir.clone();
        let progress = progress.clone();
        let total_batches = batches.len();
        let correlation = crate::correlation::inherit();

        tasks.push(tokio::spawn(crate::correlation::with_id(correlation, move || async move {
            let _permit = semaphore.acquire_owned().await.expect("dicom semaphore closed");
            let batch_id = batch.id;
            let result = tokio::task::spawn_blocking(move || {
                send_batch_blocking(&batch, &host, port, &called_aet, &calling_aet, timeout, &log_dir)
            })
            .await
            .expect("dicom worker panicked");

            progress.emit(
                ProgressEvent::new(
                    Phase::Uploading,
                    format!(
                        "batch {batch_id} sent {}/{}",
                        result.as_ref().map(|r| r.sent).unwrap_or(0),
                        result.as_ref().map(|r| r.total).unwrap_or(0)
                    ),
                )
                .with_batch(batch_id)
                .with_progress(batch_id + 1, total_batches),
            );
            result
        })));
    }

    let mut sent = 0usize;
    let mut failed = 0usize;
    for task in tasks {
        match task.await.expect("dicom task join failed") {
            Ok(batch_result) => {
                sent += batch_result.sent;
                failed += batch_result.failed;
            }
            Err(batch_result) => {
                sent += batch_result.sent;
                failed += batch_result.failed;
            }
        }
    }

    let success = failed == 0;
    if config.cleanup {
        let _ = std::fs::remove_dir_all(&workspace);
    }

    let record = AuditRecordBuilder::new("dicom-send", &config.calling_aet)
        .detail("total_files", total_files)
        .detail("sent", sent)
        .detail("failed", failed)
        .finish(success, (!success).then(|| format!("{failed} of {total_files} files failed")));
    audit.record(record);

    Ok(DicomStoreSummary {
        total_files,
        sent,
        failed,
        log_directory: log_dir,
        workspace_directory: workspace,
        success,
    })
}

async fn preflight_echo(config: &DicomSenderConfig) -> Result<(), XnatError> {
    let host = config.host.clone();
    let port = config.port;
    let called_aet = config.called_aet.clone();
    let calling_aet = config.calling_aet.clone();
    let timeout = config.socket_timeout;

    let ok = tokio::task::spawn_blocking(move || echo_blocking(&host, port, &called_aet, &calling_aet, timeout))
        .await
        .expect("echo worker panicked");

    if ok {
        Ok(())
    } else {
        Err(XnatError::Dicom(DicomError::EchoFailed { host: config.host.clone(), port: config.port }))
    }
}

fn echo_blocking(host: &str, port: u16, called_aet: &str, calling_aet: &str, timeout: Duration) -> bool {
    let address = format!("{host}:{port}");
    let options = ClientAssociationOptions::new()
        .calling_ae_title(calling_aet)
        .called_ae_title(called_aet)
        .with_presentation_context(VERIFICATION_SOP_CLASS, TRANSFER_SYNTAXES.to_vec());

    let association = match options.establish_with(&address) {
        Ok(assoc) => assoc,
        Err(e) => {
            tracing::warn!("C-ECHO association rejected/aborted: {e}");
            return false;
        }
    };

    let accepted = association
        .presentation_contexts()
        .iter()
        .any(|pc| pc.result.is_ok());
    if !accepted {
        tracing::warn!("C-ECHO: server did not accept the verification presentation context");
        let _ = association.release();
        return false;
    }

    let pc_id = association
        .presentation_contexts()
        .iter()
        .find(|pc| pc.result.is_ok())
        .map(|pc| pc.id);

    let ok = match pc_id {
        Some(pc_id) => {
            let command = build_echo_command(1);
            match association.cstore(pc_id, &command, &[]) {
                Ok(response) => match parse_cstore_status(&response) {
                    Ok(0x0000) => true,
                    Ok(status) => {
                        tracing::warn!("C-ECHO returned non-zero status {status:#06x}");
                        false
                    }
                    Err(e) => {
                        tracing::warn!("C-ECHO response could not be parsed: {e}");
                        false
                    }
                },
                Err(e) => {
                    tracing::warn!("C-ECHO request failed: {e}");
                    false
                }
            }
        }
        None => false,
    };

    let _ = if timeout.is_zero() { association.abort() } else { association.release() };
    ok
}

fn build_echo_command(message_id: u16) -> Vec<u8> {
    let mut obj = dicom_object::InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        Tag(0x0000, 0x0002),
        VR::UI,
        Value::Primitive(PrimitiveValue::from(VERIFICATION_SOP_CLASS)),
    ));
    obj.put(DataElement::new(
        Tag(0x0000, 0x0100),
        VR::US,
        Value::Primitive(PrimitiveValue::U16(smallvec![COMMAND_FIELD_C_ECHO_RQ])),
    ));
    obj.put(DataElement::new(
        Tag(0x0000, 0x0110),
        VR::US,
        Value::Primitive(PrimitiveValue::U16(smallvec![message_id])),
    ));
    let mut buffer = Vec::new();
    let _ = obj.write_dataset_with_ts(
        &mut buffer,
        &dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
    );
    buffer
}

struct BatchOutcome {
    total: usize,
    sent: usize,
    failed: usize,
}

#[allow(clippy::too_many_arguments)]
fn send_batch_blocking(
    batch: &Batch,
    host: &str,
    port: u16,
    called_aet: &str,
    calling_aet: &str,
    timeout: Duration,
    log_dir: &Path,
) -> Result<BatchOutcome, BatchOutcome> {
    let log_path = log_dir.join(format!("{:03}.log", batch.id));
    let mut log_lines: Vec<String> = Vec::new();

    let address = format!("{host}:{port}");
    let mut options = ClientAssociationOptions::new()
        .calling_ae_title(calling_aet)
        .called_ae_title(called_aet);
    for sop_class in STORAGE_SOP_CLASSES {
        options = options.with_presentation_context(*sop_class, TRANSFER_SYNTAXES.to_vec());
    }
    options = options.with_presentation_context(VENDOR_STORAGE_CONTEXT_UID, TRANSFER_SYNTAXES.to_vec());

    let association = match options.establish_with(&address) {
        Ok(assoc) => assoc,
        Err(e) => {
            log_lines.push(format!("Association rejected/aborted: {e}"));
            write_log(&log_path, &log_lines);
            return Err(BatchOutcome { total: batch.files.len(), sent: 0, failed: batch.files.len() });
        }
    };

    let mut sent = 0usize;
    let mut failed = 0usize;
    for (idx, path) in batch.files.iter().enumerate() {
        match send_one_file(&association, path, idx as u16 + 1) {
            Ok(()) => {
                sent += 1;
                log_lines.push(format!("Sent {}", path.display()));
            }
            Err(SendFileError::Parse(reason)) => {
                failed += 1;
                log_lines.push(format!("Skip non-DICOM {}: {}", path.display(), reason));
            }
            Err(SendFileError::Refused { status }) => {
                failed += 1;
                log_lines.push(format!(
                    "Store refused {} status={status:#06x}",
                    path.display()
                ));
            }
            Err(SendFileError::Protocol(reason)) => {
                failed += 1;
                log_lines.push(format!("Store failed {}: {}", path.display(), reason));
            }
        }
    }

    let _ = association.release();
    write_log(&log_path, &log_lines);

    let outcome = BatchOutcome { total: batch.files.len(), sent, failed };
    if failed == 0 {
        Ok(outcome)
    } else {
        Err(outcome)
    }
}

fn write_log(path: &Path, lines: &[String]) {
    let _ = std::fs::write(path, lines.join("\n"));
}

/// Why a single file failed to store, distinguished so the per-batch log
/// records the true cause instead of a single generic message.
enum SendFileError {
    /// File could not be read as DICOM at all.
    Parse(String),
    /// Association/transport failure sending or receiving the DIMSE
    /// message itself.
    Protocol(String),
    /// The SCP accepted the association and the request but replied
    /// with a non-zero C-STORE-RSP status.
    Refused { status: u16 },
}

impl From<String> for SendFileError {
    fn from(reason: String) -> Self {
        SendFileError::Parse(reason)
    }
}

fn send_one_file(
    association: &ClientAssociation<TcpStream>,
    path: &Path,
    message_id: u16,
) -> Result<(), SendFileError> {
    let mut obj = open_file(path).map_err(|e| SendFileError::Parse(e.to_string()))?;

    let sop_class_uid = resolve_or_repair(&mut obj, Tag(0x0008, 0x0016), |meta| {
        meta.media_storage_sop_class_uid.clone()
    })?;
    let sop_instance_uid = resolve_or_repair(&mut obj, Tag(0x0008, 0x0018), |meta| {
        meta.media_storage_sop_instance_uid.clone()
    })?;

    let pc_id = association
        .presentation_contexts()
        .iter()
        .find(|pc| pc.abstract_syntax == sop_class_uid && pc.result.is_ok())
        .or_else(|| association.presentation_contexts().iter().find(|pc| pc.result.is_ok()))
        .map(|pc| pc.id)
        .ok_or_else(|| SendFileError::Parse("no accepted presentation context for this SOP class".to_string()))?;

    let mut dataset_buffer = Vec::new();
    obj.write_dataset_with_ts(
        &mut dataset_buffer,
        &dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
    )
    .map_err(|e| SendFileError::Protocol(e.to_string()))?;

    let mut command_obj = dicom_object::InMemDicomObject::new_empty();
    command_obj.put(DataElement::new(
        Tag(0x0000, 0x0002),
        VR::UI,
        Value::Primitive(PrimitiveValue::Str(sop_class_uid.clone().into())),
    ));
    command_obj.put(DataElement::new(
        Tag(0x0000, 0x0100),
        VR::US,
        Value::Primitive(PrimitiveValue::U16(smallvec![COMMAND_FIELD_C_STORE_RQ])),
    ));
    command_obj.put(DataElement::new(
        Tag(0x0000, 0x0110),
        VR::US,
        Value::Primitive(PrimitiveValue::U16(smallvec![message_id])),
    ));
    command_obj.put(DataElement::new(
        Tag(0x0000, 0x0700),
        VR::US,
        Value::Primitive(PrimitiveValue::U16(smallvec![0x0000])),
    ));
    command_obj.put(DataElement::new(
        Tag(0x0000, 0x1000),
        VR::UI,
        Value::Primitive(PrimitiveValue::Str(sop_instance_uid.into())),
    ));
    let mut command_buffer = Vec::new();
    command_obj
        .write_dataset_with_ts(
            &mut command_buffer,
            &dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
        )
        .map_err(|e| SendFileError::Protocol(e.to_string()))?;

    let response = association
        .cstore(pc_id, &command_buffer, &dataset_buffer)
        .map_err(|e| SendFileError::Protocol(e.to_string()))?;

    let status = parse_cstore_status(&response).map_err(SendFileError::Protocol)?;
    if status != 0x0000 {
        return Err(SendFileError::Refused { status });
    }
    Ok(())
}

/// Decode the C-STORE-RSP command set and read the Status element
/// (0000,0900).
fn parse_cstore_status(response: &[u8]) -> Result<u16, String> {
    let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let command = dicom_object::InMemDicomObject::read_dataset_with_ts(response, &ts).map_err(|e| e.to_string())?;
    command
        .element(Tag(0x0000, 0x0900))
        .map_err(|e| e.to_string())?
        .to_int::<u16>()
        .map_err(|e| e.to_string())
}

/// Return the dataset-level UID for `tag`, repairing it from the
/// file-meta table (`MediaStorageSOPClassUID` / `...InstanceUID`) when the
/// dataset element is absent, per the SOP UID repair rule.
fn resolve_or_repair(
    obj: &mut dicom_object::InMemDicomObject,
    tag: Tag,
    from_meta: impl Fn(&dicom_object::meta::FileMetaTable) -> String,
) -> Result<String, String> {
    if let Ok(element) = obj.element(tag) {
        if let Ok(value) = element.to_str() {
            if !value.trim().is_empty() {
                return Ok(value.trim().to_string());
            }
        }
    }
    let repaired = from_meta(obj.meta());
    if repaired.is_empty() {
        return Err(format!("missing {tag} and no file-meta fallback"));
    }
    Ok(repaired)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_context_matches_spec_constant() {
        assert_eq!(VENDOR_STORAGE_CONTEXT_UID, "1.3.12.2.1107.5.9.1");
    }

    #[test]
    fn echo_command_targets_verification_sop_class() {
        let buffer = build_echo_command(1);
        assert!(!buffer.is_empty());
    }
}
