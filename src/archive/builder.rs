//! Archiver (C3).
//!
//! Builds a single archive (tar or zip) from a batch's files, writing
//! entries at `arcname = relpath(file, base_dir)` in POSIX form. The
//! archive is written straight to `dest_path`; the caller (the import
//! pipeline's temp-directory cleanup) owns removing it.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::UploadError;

/// Archive container format for a batch upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    Zip,
}

impl ArchiveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::Zip => "zip",
        }
    }

    /// `Content-Type` header for the upload, derived from the archive's
    /// file extension per §4.6 (`.tar`/`.tar.gz`/`.tgz` -> x-tar; else zip).
    pub fn content_type_for_path(path: &Path) -> &'static str {
        let ext = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_lowercase();
        if ext.ends_with(".tar") || ext.ends_with(".tar.gz") || ext.ends_with(".tgz") {
            "application/x-tar"
        } else {
            "application/zip"
        }
    }
}

/// Build an archive of `files` (all expected to live under `base_dir`) at
/// `dest_path`, in `format`. Returns the resulting archive size in bytes.
pub fn build_archive(
    files: &[PathBuf],
    base_dir: &Path,
    format: ArchiveFormat,
    dest_path: &Path,
) -> Result<u64, UploadError> {
    let archive_err = |reason: String| UploadError::Archive {
        archive_path: dest_path.display().to_string(),
        reason,
    };

    match format {
        ArchiveFormat::Tar => build_tar(files, base_dir, dest_path).map_err(archive_err)?,
        ArchiveFormat::Zip => build_zip(files, base_dir, dest_path).map_err(archive_err)?,
    }

    std::fs::metadata(dest_path)
        .map(|m| m.len())
        .map_err(|e| archive_err(e.to_string()))
}

fn posix_arcname(file: &Path, base_dir: &Path) -> std::io::Result<String> {
    let rel = file.strip_prefix(base_dir).unwrap_or(file);
    let joined = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    Ok(joined)
}

fn build_tar(files: &[PathBuf], base_dir: &Path, dest_path: &Path) -> std::io::Result<()> {
    let file = File::create(dest_path)?;
    let mut builder = tar::Builder::new(BufWriter::new(file));
    for path in files {
        let arcname = posix_arcname(path, base_dir)?;
        builder.append_path_with_name(path, arcname)?;
    }
    builder.into_inner()?.flush()
}

fn build_zip(files: &[PathBuf], base_dir: &Path, dest_path: &Path) -> std::io::Result<()> {
    let file = File::create(dest_path)?;
    let mut writer = zip::ZipWriter::new(BufWriter::new(file));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .large_file(true);

    for path in files {
        let arcname = posix_arcname(path, base_dir)?;
        writer
            .start_file(arcname, options)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let mut source = File::open(path)?;
        std::io::copy(&mut source, &mut writer)?;
    }
    writer
        .finish()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
        .flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn setup_batch() -> (tempfile::TempDir, Vec<PathBuf>) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.dcm"), b"alpha").unwrap();
        std::fs::write(dir.path().join("sub").join("b.dcm"), b"beta").unwrap();
        let files = vec![dir.path().join("a.dcm"), dir.path().join("sub").join("b.dcm")];
        (dir, files)
    }

    #[test]
    fn tar_round_trips_relative_posix_paths() {
        let (dir, files) = setup_batch();
        let dest = dir.path().join("batch_0.tar");
        let size = build_archive(&files, dir.path(), ArchiveFormat::Tar, &dest).unwrap();
        assert!(size > 0);

        let out = tempfile::tempdir().unwrap();
        let mut archive = tar::Archive::new(File::open(&dest).unwrap());
        let mut names = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_path_buf();
            names.push(path.to_string_lossy().replace('\\', "/"));
            entry.unpack_in(out.path()).unwrap();
        }
        names.sort();
        assert_eq!(names, vec!["a.dcm", "sub/b.dcm"]);
        assert!(out.path().join("a.dcm").exists());
        assert!(out.path().join("sub/b.dcm").exists());
    }

    #[test]
    fn zip_round_trips_a_single_file_batch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("only.dcm"), b"solo").unwrap();
        let files = vec![dir.path().join("only.dcm")];
        let dest = dir.path().join("batch_0.zip");

        let size = build_archive(&files, dir.path(), ArchiveFormat::Zip, &dest).unwrap();
        assert!(size > 0);

        let mut archive = zip::ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        assert_eq!(archive.len(), 1);
        let mut entry = archive.by_index(0).unwrap();
        assert_eq!(entry.name(), "only.dcm");
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        assert_eq!(content, "solo");
    }

    #[test]
    fn content_type_follows_extension() {
        assert_eq!(
            ArchiveFormat::content_type_for_path(Path::new("batch_0.tar")),
            "application/x-tar"
        );
        assert_eq!(
            ArchiveFormat::content_type_for_path(Path::new("batch_0.zip")),
            "application/zip"
        );
    }
}
