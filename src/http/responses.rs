//! Explicit record types for the duck-typed JSON shapes the core
//! consumes, replacing the dynamic "nested map" style of the source (§9).

use serde::Deserialize;

/// `GET /xapi/siteConfig/buildInfo`.
#[derive(Debug, Deserialize)]
pub struct BuildInfoResponse {
    pub version: Option<String>,
}

impl BuildInfoResponse {
    pub fn version_or_unknown(&self) -> String {
        self.version.clone().unwrap_or_else(|| "unknown".to_string())
    }
}

/// The `{"ResultSet": {"Result": [...]}}` envelope every XNAT tabular
/// listing endpoint returns.
#[derive(Debug, Deserialize)]
pub struct ResultSetEnvelope<T> {
    #[serde(rename = "ResultSet")]
    pub result_set: ResultSetBody<T>,
}

#[derive(Debug, Deserialize)]
pub struct ResultSetBody<T> {
    #[serde(rename = "Result")]
    pub result: Vec<T>,
}

impl<T> ResultSetEnvelope<T> {
    pub fn into_rows(self) -> Vec<T> {
        self.result_set.result
    }
}

/// `GET /data/projects/<p>/subjects?columns=ID,label&format=json`.
#[derive(Debug, Deserialize)]
pub struct SubjectRow {
    #[serde(rename = "ID")]
    pub id: String,
    pub label: Option<String>,
}

/// `GET /data/projects/<p>/subjects/<s>/experiments?format=json`.
#[derive(Debug, Deserialize)]
pub struct ExperimentRow {
    #[serde(rename = "ID")]
    pub id: String,
    pub label: Option<String>,
}

/// `GET /data/.../scans?format=json`. The server sometimes answers with an
/// explicit `ID` column and sometimes with a free-form `URI` that must be
/// regex-mined for the scan id (C10's listing strategy).
#[derive(Debug, Deserialize)]
pub struct ScanRow {
    #[serde(rename = "ID")]
    pub id: Option<String>,
    #[serde(rename = "URI")]
    pub uri: Option<String>,
}

/// `GET /data/.../resources?format=json`. Used by the downloader (C8) to
/// enumerate session-level resource labels before fetching each one.
#[derive(Debug, Deserialize)]
pub struct ResourceRow {
    pub label: Option<String>,
    #[serde(rename = "URI")]
    pub uri: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_result_set_envelope() {
        let json = r#"{"ResultSet":{"Result":[{"ID":"XNAT_S001","label":"sub-01"}]}}"#;
        let parsed: ResultSetEnvelope<SubjectRow> = serde_json::from_str(json).unwrap();
        let rows = parsed.into_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "XNAT_S001");
        assert_eq!(rows[0].label.as_deref(), Some("sub-01"));
    }

    #[test]
    fn build_info_falls_back_to_unknown() {
        let parsed: BuildInfoResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.version_or_unknown(), "unknown");
    }

    #[test]
    fn scan_row_tolerates_uri_only_rows() {
        let json = r#"{"URI":"/archive/experiments/E1/scans/3"}"#;
        let row: ScanRow = serde_json::from_str(json).unwrap();
        assert!(row.id.is_none());
        assert_eq!(row.uri.as_deref(), Some("/archive/experiments/E1/scans/3"));
    }
}
