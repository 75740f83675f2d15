//! Upload drivers: the batched REST importer (C6) and the resource/
//! scan-resource/prebuilt-archive uploaders (C11).

mod importer;
mod resource;

pub use importer::{run_import, ImportRequest, UploadResult, UploadSummary};
pub use resource::{
    import_prebuilt_archive, upload_directory_as_resource, upload_resource_file,
    upload_resource_zip_with_extract, upload_scan_resource_file, DirectoryUploadResult,
};
