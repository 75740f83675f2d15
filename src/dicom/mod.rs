//! DICOM networking (C7): C-STORE sender with C-ECHO pre-flight.

mod sender;

pub use sender::{run_dicom_send, DicomSenderConfig, DicomStoreSummary, VENDOR_STORAGE_CONTEXT_UID};
