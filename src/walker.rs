//! File Walker (C1).
//!
//! Recursively enumerates DICOM-like files under a root directory and
//! returns them in a deterministic (lexically sorted) order. Pure: no
//! network, no mutation, no global state.

use std::path::{Path, PathBuf};

use crate::error::ValidationError;

const DICOM_EXTENSIONS: &[&str] = &["dcm", "ima", "img", "dicom"];

/// Walk `root`, returning every regular file whose lowercased extension is
/// one of `.dcm`/`.ima`/`.img`/`.dicom`, plus (if `include_extensionless`)
/// every extensionless regular file whose basename does not start with
/// `.`. Result is sorted lexically and contains no duplicates or
/// directory entries.
pub fn discover_dicom_files(
    root: &Path,
    include_extensionless: bool,
) -> Result<Vec<PathBuf>, ValidationError> {
    if !root.exists() || !root.is_dir() {
        return Err(ValidationError::InvalidPath {
            path: root.to_path_buf(),
            reason: "root must be an existing directory".to_string(),
        });
    }

    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let path = entry.into_path();
            if is_dicom_like(&path, include_extensionless) {
                Some(path)
            } else {
                None
            }
        })
        .collect();

    files.sort();
    files.dedup();
    Ok(files)
}

fn is_dicom_like(path: &Path, include_extensionless: bool) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => DICOM_EXTENSIONS.contains(&ext.to_lowercase().as_str()),
        None => {
            include_extensionless
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| !n.starts_with('.'))
                    .unwrap_or(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn sorts_lexically_and_classifies_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.dcm"), b"x").unwrap();
        fs::write(dir.path().join("a.IMA"), b"x").unwrap();
        fs::write(dir.path().join("skip.txt"), b"x").unwrap();
        fs::write(dir.path().join(".hidden"), b"x").unwrap();
        fs::write(dir.path().join("noext"), b"x").unwrap();

        let files = discover_dicom_files(dir.path(), false).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.IMA", "b.dcm"]);
    }

    #[test]
    fn includes_extensionless_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("noext"), b"x").unwrap();
        fs::write(dir.path().join(".hidden"), b"x").unwrap();

        let files = discover_dicom_files(dir.path(), true).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_name().unwrap(), "noext");
    }

    #[test]
    fn missing_root_is_an_error() {
        let missing = Path::new("/no/such/dicom/root");
        assert!(discover_dicom_files(missing, false).is_err());
    }

    #[test]
    fn nested_directories_are_walked_recursively() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("c.dcm"), b"x").unwrap();
        let files = discover_dicom_files(dir.path(), false).unwrap();
        assert_eq!(files.len(), 1);
    }
}
