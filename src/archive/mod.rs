//! Archiver (C3) and Archive Extractor (C9).
//!
//! Building and extracting are kept in separate submodules since they run
//! at opposite ends of the pipeline (upload-side vs download-side) but
//! share the archive-format plumbing and the zip-slip guard.

mod builder;
mod extractor;

pub use builder::{build_archive, ArchiveFormat};
pub use extractor::{extract_session_archives, ExtractedArchive};
