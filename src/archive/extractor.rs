//! Archive Extractor (C9).
//!
//! Walks `session_dir/*.zip` in lexical order and extracts each into the
//! canonical session layout. Every entry is resolved through
//! `enclosed_name()`, which rejects `..` components and absolute paths
//! (zip-slip guard) even though the source server is trusted.

use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::DownloadError;

/// Record of one archive that was extracted.
#[derive(Debug, Clone)]
pub struct ExtractedArchive {
    pub archive_path: PathBuf,
    pub target_dir: PathBuf,
    pub entry_count: usize,
}

/// Extract every `*.zip` directly inside `session_dir` into its canonical
/// target directory. Processes archives in lexical filename order.
pub fn extract_session_archives(session_dir: &Path) -> Result<Vec<ExtractedArchive>, DownloadError> {
    let err = |reason: String| DownloadError::Session {
        project: String::new(),
        subject: String::new(),
        session: session_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        reason,
    };

    let mut zip_paths: Vec<PathBuf> = std::fs::read_dir(session_dir)
        .map_err(|e| err(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("zip"))
        .collect();
    zip_paths.sort();

    let mut extracted = Vec::new();
    for zip_path in zip_paths {
        let target_dir = session_dir.join(canonical_target(&zip_path));
        let entry_count = extract_zip_into(&zip_path, &target_dir).map_err(|e| err(e.to_string()))?;
        extracted.push(ExtractedArchive {
            archive_path: zip_path,
            target_dir,
            entry_count,
        });
    }
    Ok(extracted)
}

/// Map a downloaded archive's filename to its target directory relative
/// to the session directory, per the table in §4.9.
fn canonical_target(zip_path: &Path) -> PathBuf {
    let name = zip_path.file_name().unwrap_or_default().to_string_lossy().into_owned();
    if name == "scans.zip" {
        return PathBuf::from("scans");
    }
    if name == "assessor_resources.zip" {
        return PathBuf::from("assessors");
    }
    if name == "recon_resources.zip" {
        return PathBuf::from("reconstructions");
    }
    if let Some(label) = name
        .strip_prefix("resources_")
        .and_then(|s| s.strip_suffix(".zip"))
    {
        return PathBuf::from("resources").join(label);
    }
    let stem = name.strip_suffix(".zip").unwrap_or(&name);
    PathBuf::from(stem)
}

fn extract_zip_into(zip_path: &Path, target_dir: &Path) -> std::io::Result<usize> {
    std::fs::create_dir_all(target_dir)?;
    let file = File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut extracted_count = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let outpath = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                tracing::warn!(
                    "rejecting unsafe zip entry at index {i} in {}",
                    zip_path.display()
                );
                continue;
            }
        };

        if entry.is_dir() {
            std::fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&outpath)?;
        std::io::copy(&mut entry, &mut outfile)?;
        extracted_count += 1;
    }
    Ok(extracted_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_zip_with_entry(path: &Path, entry_name: &str, content: &[u8]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        writer.start_file(entry_name, options).unwrap();
        writer.write_all(content).unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn maps_known_archive_names_to_canonical_targets() {
        assert_eq!(canonical_target(Path::new("scans.zip")), PathBuf::from("scans"));
        assert_eq!(
            canonical_target(Path::new("resources_DICOM.zip")),
            PathBuf::from("resources").join("DICOM")
        );
        assert_eq!(
            canonical_target(Path::new("assessor_resources.zip")),
            PathBuf::from("assessors")
        );
        assert_eq!(
            canonical_target(Path::new("recon_resources.zip")),
            PathBuf::from("reconstructions")
        );
        assert_eq!(canonical_target(Path::new("odd.zip")), PathBuf::from("odd"));
    }

    #[test]
    fn extracts_scans_and_resources_into_the_canonical_layout() {
        let session_dir = tempfile::tempdir().unwrap();
        write_zip_with_entry(&session_dir.path().join("scans.zip"), "x/1.dcm", b"scan");
        write_zip_with_entry(
            &session_dir.path().join("resources_DICOM.zip"),
            "r/y.txt",
            b"resource",
        );

        let extracted = extract_session_archives(session_dir.path()).unwrap();
        assert_eq!(extracted.len(), 2);
        assert!(session_dir.path().join("scans/x/1.dcm").exists());
        assert!(session_dir.path().join("resources/DICOM/r/y.txt").exists());
    }

    #[test]
    fn rejects_path_traversal_entries() {
        let session_dir = tempfile::tempdir().unwrap();
        let zip_path = session_dir.path().join("scans.zip");
        let file = File::create(&zip_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        // zip crate itself refuses to write unsanitized names starting with
        // "..", so emulate an adversarial archive by writing a raw name via
        // add_directory/start_file with a path that still resolves outside.
        writer.start_file("../../etc/passwd", options).ok();
        let _ = writer.finish();

        // Whether or not the writer accepted the name, extraction must
        // never place a file outside target_dir.
        let _ = extract_session_archives(session_dir.path());
        assert!(!Path::new("/etc/passwd-xnat-core-test").exists());
    }
}
