//! Pure edge validators (C13).
//!
//! Every driver operation calls these at its boundary; deep-layer
//! functions assume their inputs have already passed through here.
//! Nothing in this module performs I/O except the path-existence checks,
//! which only `stat` the filesystem.

use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::ValidationError;

const DEFAULT_MAX_IDENTIFIER_LEN: usize = 64;
const MAX_AE_TITLE_LEN: usize = 16;
const MAX_SCAN_ID_LEN: usize = 32;

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// `[A-Za-z0-9_-]{1,max_length}`.
pub fn validate_identifier(value: &str, max_length: usize) -> Result<String, ValidationError> {
    validate_identifier_kind(value, max_length, "identifier")
}

fn validate_identifier_kind(
    value: &str,
    max_length: usize,
    kind: &str,
) -> Result<String, ValidationError> {
    if value.is_empty() || value.len() > max_length || !value.chars().all(is_identifier_char) {
        return Err(ValidationError::InvalidIdentifier {
            identifier_type: kind.to_string(),
            value: value.to_string(),
            reason: format!(
                "must match [A-Za-z0-9_-]{{1,{max_length}}}"
            ),
        });
    }
    Ok(value.to_string())
}

/// Project/subject/session identifier, default max 64 chars.
pub fn validate_xnat_identifier(value: &str) -> Result<String, ValidationError> {
    validate_identifier(value, DEFAULT_MAX_IDENTIFIER_LEN)
}

/// Resource label: same charset, max 64, additionally rejects path
/// separators (already implied by the charset, kept explicit per spec).
pub fn validate_resource_label(value: &str) -> Result<String, ValidationError> {
    if value.contains('/') || value.contains('\\') {
        return Err(ValidationError::InvalidIdentifier {
            identifier_type: "resource label".to_string(),
            value: value.to_string(),
            reason: "must not contain path separators".to_string(),
        });
    }
    validate_identifier_kind(value, DEFAULT_MAX_IDENTIFIER_LEN, "resource label")
}

/// Scan identifier: same charset, max 32 chars.
pub fn validate_scan_id(value: &str) -> Result<String, ValidationError> {
    validate_identifier_kind(value, MAX_SCAN_ID_LEN, "scan id")
}

/// AE Title: 1-16 printable ASCII chars excluding backslash.
pub fn validate_ae_title(value: &str) -> Result<String, ValidationError> {
    let ok = !value.is_empty()
        && value.len() <= MAX_AE_TITLE_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_graphic() || c == ' ')
        && !value.contains('\\');
    if !ok {
        return Err(ValidationError::InvalidIdentifier {
            identifier_type: "AE title".to_string(),
            value: value.to_string(),
            reason: "must be 1-16 printable ASCII chars excluding backslash".to_string(),
        });
    }
    Ok(value.to_string())
}

/// Server URL: non-empty, scheme http/https, non-empty host; trailing
/// slashes stripped.
pub fn validate_server_url(url: &str) -> Result<String, ValidationError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::InvalidUrl {
            url: url.to_string(),
            reason: "must not be empty".to_string(),
        });
    }
    let parsed = reqwest::Url::parse(trimmed).map_err(|e| ValidationError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(ValidationError::InvalidUrl {
            url: url.to_string(),
            reason: "scheme must be http or https".to_string(),
        });
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(ValidationError::InvalidUrl {
            url: url.to_string(),
            reason: "host must not be empty".to_string(),
        });
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

/// Port: integer in [1, 65535]; `allow_null` lets a `None` through as-is.
pub fn validate_port(port: Option<i64>, allow_null: bool) -> Result<Option<u16>, ValidationError> {
    match port {
        None if allow_null => Ok(None),
        None => Err(ValidationError::InvalidPort { port: 0 }),
        Some(p) if (1..=65535).contains(&p) => Ok(Some(p as u16)),
        Some(p) => Err(ValidationError::InvalidPort { port: p }),
    }
}

/// Timeout in seconds: must be positive and no more than 30 days.
pub fn validate_timeout(seconds: i64) -> Result<u64, ValidationError> {
    const MAX_SECONDS: i64 = 30 * 24 * 60 * 60;
    if seconds <= 0 || seconds > MAX_SECONDS {
        return Err(ValidationError::InvalidPath {
            path: PathBuf::new(),
            reason: format!("timeout must be in 1..={MAX_SECONDS} seconds, got {seconds}"),
        });
    }
    Ok(seconds as u64)
}

/// Worker-count knob: must be at least 1.
pub fn validate_workers(workers: i64) -> Result<usize, ValidationError> {
    if workers < 1 {
        return Err(ValidationError::InvalidPath {
            path: PathBuf::new(),
            reason: format!("worker count must be >= 1, got {workers}"),
        });
    }
    Ok(workers as usize)
}

/// Overwrite mode: one of `none`/`append`/`delete`, case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwriteMode {
    None,
    Append,
    Delete,
}

impl OverwriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverwriteMode::None => "none",
            OverwriteMode::Append => "append",
            OverwriteMode::Delete => "delete",
        }
    }
}

pub fn validate_overwrite_mode(value: &str) -> Result<OverwriteMode, ValidationError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "none" => Ok(OverwriteMode::None),
        "append" => Ok(OverwriteMode::Append),
        "delete" => Ok(OverwriteMode::Delete),
        other => Err(ValidationError::InvalidIdentifier {
            identifier_type: "overwrite mode".to_string(),
            value: other.to_string(),
            reason: "must be one of none, append, delete".to_string(),
        }),
    }
}

/// Path must exist.
pub fn validate_path_exists(path: &Path) -> Result<PathBuf, ValidationError> {
    if !path.exists() {
        return Err(ValidationError::InvalidPath {
            path: path.to_path_buf(),
            reason: "path does not exist".to_string(),
        });
    }
    Ok(path.to_path_buf())
}

/// Path must exist and be writable (best-effort check: a directory must
/// permit creating and removing a probe file; a file must not be
/// readonly).
pub fn validate_path_writable(path: &Path) -> Result<PathBuf, ValidationError> {
    validate_path_exists(path)?;
    if path.is_dir() {
        let probe = path.join(format!(".xnat-core-writetest-{}", std::process::id()));
        match std::fs::File::create(&probe) {
            Ok(_) => {
                let _ = std::fs::remove_file(&probe);
                Ok(path.to_path_buf())
            }
            Err(e) => Err(ValidationError::InvalidPath {
                path: path.to_path_buf(),
                reason: format!("not writable: {e}"),
            }),
        }
    } else {
        let metadata = std::fs::metadata(path).map_err(|e| ValidationError::InvalidPath {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if metadata.permissions().readonly() {
            return Err(ValidationError::InvalidPath {
                path: path.to_path_buf(),
                reason: "file is readonly".to_string(),
            });
        }
        Ok(path.to_path_buf())
    }
}

/// Validate that a path is suitable as an archive source: must exist and
/// be a directory.
pub fn validate_archive_path(path: &Path) -> Result<PathBuf, ValidationError> {
    validate_path_exists(path)?;
    if !path.is_dir() {
        return Err(ValidationError::InvalidPath {
            path: path.to_path_buf(),
            reason: "must be a directory".to_string(),
        });
    }
    Ok(path.to_path_buf())
}

/// Compile a regex pattern, surfacing compile errors as a ValidationError.
pub fn validate_regex(pattern: &str) -> Result<Regex, ValidationError> {
    Regex::new(pattern).map_err(|e| ValidationError::InvalidIdentifier {
        identifier_type: "regex pattern".to_string(),
        value: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a caller-supplied comma-separated list of scan ids: trimmed,
/// empty entries dropped, order preserved, duplicates preserved. Distinct
/// from C10's listing-step dedup, which operates on the *live* server
/// listing rather than the caller's input.
pub fn parse_scan_ids_input(raw: &str) -> Result<Vec<String>, ValidationError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(validate_scan_id)
        .collect()
}

/// Parse a comma-separated list of project identifiers, validating each.
pub fn parse_project_list(raw: &str) -> Result<Vec<String>, ValidationError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(validate_xnat_identifier)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_idempotence() {
        let raw = "  subject_01  ".trim();
        assert_eq!(
            validate_xnat_identifier(raw).unwrap(),
            validate_xnat_identifier(&validate_xnat_identifier(raw).unwrap()).unwrap()
        );
    }

    #[test]
    fn identifier_boundary_lengths() {
        let at_max = "a".repeat(64);
        assert!(validate_xnat_identifier(&at_max).is_ok());
        let over_max = "a".repeat(65);
        assert!(validate_xnat_identifier(&over_max).is_err());
    }

    #[test]
    fn url_normalization_strips_trailing_slashes() {
        let base = validate_server_url("https://xnat.example.org").unwrap();
        for k in 0..4 {
            let with_slashes = format!("https://xnat.example.org{}", "/".repeat(k));
            assert_eq!(validate_server_url(&with_slashes).unwrap(), base);
        }
    }

    #[test]
    fn url_rejects_bad_scheme_and_empty_host() {
        assert!(validate_server_url("ftp://example.org").is_err());
        assert!(validate_server_url("").is_err());
    }

    #[test]
    fn port_boundaries() {
        assert!(validate_port(Some(0), false).is_err());
        assert!(validate_port(Some(65536), false).is_err());
        assert!(validate_port(Some(1), false).is_ok());
        assert!(validate_port(Some(65535), false).is_ok());
    }

    #[test]
    fn overwrite_mode_is_case_insensitive() {
        assert_eq!(validate_overwrite_mode("DELETE").unwrap(), OverwriteMode::Delete);
        assert!(validate_overwrite_mode("bogus").is_err());
    }

    #[test]
    fn scan_ids_input_preserves_order_and_duplicates() {
        let parsed = parse_scan_ids_input(" 1, 2,1 ,,3").unwrap();
        assert_eq!(parsed, vec!["1", "2", "1", "3"]);
    }

    #[test]
    fn ae_title_rejects_backslash_and_overlength() {
        assert!(validate_ae_title("GOOD_AET").is_ok());
        assert!(validate_ae_title("BAD\\AET").is_err());
        assert!(validate_ae_title(&"A".repeat(17)).is_err());
    }
}
