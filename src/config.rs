//! Environment-variable configuration (§6, §10).
//!
//! Deliberately separate from [`crate::validators`]: this module only
//! parses raw process state into typed fields with the permissive
//! boolean/integer fallback rules the source config loader uses; it does
//! not enforce the identifier/URL/port invariants C13 owns. A CLI wires a
//! [`Connection`](crate::http::Connection) from here and then runs it
//! through the validators at the edge.

use std::collections::HashMap;
use std::path::Path;

use crate::error::ConfigurationError;

/// Required + optional server/auth settings read from the environment.
#[derive(Debug, Clone)]
pub struct XnatEnvConfig {
    pub server: String,
    pub username: String,
    pub password: String,
    pub verify_tls: bool,
    pub http_connect_timeout: u64,
    pub http_read_timeout: u64,
    pub dicom_host: Option<String>,
    pub dicom_port: Option<u16>,
    pub dicom_called_aet: Option<String>,
    pub dicom_calling_aet: Option<String>,
}

const DEFAULT_CONNECT_TIMEOUT: u64 = 120;
const DEFAULT_READ_TIMEOUT: u64 = 604_800; // 7 days

impl XnatEnvConfig {
    /// Load from the process environment, optionally overlaying a `.env`
    /// file first.
    ///
    /// `dotenv_path`: `Some(path)` loads that file and lets it override
    /// already-set process variables; `None` looks for `.env` in the
    /// current directory and only fills in variables not already set.
    pub fn load(dotenv_path: Option<&Path>) -> Result<Self, ConfigurationError> {
        match dotenv_path {
            Some(path) => apply_dotenv(path, true),
            None => {
                let cwd_env = Path::new(".env");
                if cwd_env.exists() {
                    apply_dotenv(cwd_env, false);
                }
            }
        }

        let mut missing: Vec<&'static str> = Vec::new();
        let server = required_var("XNAT_SERVER", &mut missing);
        let username = required_var("XNAT_USERNAME", &mut missing);
        let password = required_var("XNAT_PASSWORD", &mut missing);
        if !missing.is_empty() {
            return Err(ConfigurationError::missing_credentials(&missing));
        }

        let dicom_port = match std::env::var("XNAT_DICOM_PORT") {
            Ok(raw) if !raw.trim().is_empty() => {
                Some(raw.trim().parse::<u16>().map_err(|_| {
                    ConfigurationError::InvalidValue {
                        field: "XNAT_DICOM_PORT".to_string(),
                        value: raw.clone(),
                        reason: "must be an integer in 1-65535".to_string(),
                    }
                })?)
            }
            _ => None,
        };

        Ok(Self {
            server: server.unwrap(),
            username: username.unwrap(),
            password: password.unwrap(),
            verify_tls: bool_var("XNAT_VERIFY_TLS", true),
            http_connect_timeout: int_var("XNAT_HTTP_CONNECT_TIMEOUT", DEFAULT_CONNECT_TIMEOUT),
            http_read_timeout: int_var("XNAT_HTTP_READ_TIMEOUT", DEFAULT_READ_TIMEOUT),
            dicom_host: optional_var("XNAT_DICOM_HOST"),
            dicom_port,
            dicom_called_aet: optional_var("XNAT_DICOM_CALLED_AET"),
            dicom_calling_aet: optional_var("XNAT_DICOM_CALLING_AET"),
        })
    }
}

fn required_var(name: &'static str, missing: &mut Vec<&'static str>) -> Option<String> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => Some(v),
        _ => {
            missing.push(name);
            None
        }
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Parse a boolean env var permissively: `1/true/yes/y/on` (case
/// insensitive, trimmed) is true, `0/false/no/n/off` is false, anything
/// else (including absence) falls back to `default` rather than erroring.
fn bool_var(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => parse_bool(&raw).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Parse an integer env var; an unparsable value falls back to `default`.
fn int_var(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

/// Load a `.env`-style file (`KEY=VALUE` per line, `#` comments, blank
/// lines skipped) into the process environment.
///
/// `override_existing`: when true, values in the file replace
/// already-set process variables; when false, only variables that are
/// not already set are filled in.
fn apply_dotenv(path: &Path, override_existing: bool) {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return;
    };
    for (key, value) in parse_dotenv(&contents) {
        if override_existing || std::env::var(&key).is_err() {
            std::env::set_var(key, value);
        }
    }
}

fn parse_dotenv(contents: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_string();
        let mut value = value.trim().to_string();
        if (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
            || (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
        {
            value = value[1..value.len() - 1].to_string();
        }
        out.insert(key, value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_dotenv_lines() {
        let contents = "XNAT_SERVER=https://example.org\n# comment\n\nXNAT_USERNAME=\"alice\"\n";
        let parsed = parse_dotenv(contents);
        assert_eq!(parsed.get("XNAT_SERVER").unwrap(), "https://example.org");
        assert_eq!(parsed.get("XNAT_USERNAME").unwrap(), "alice");
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn bool_parsing_is_permissive_with_fallback() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool(" off "), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
