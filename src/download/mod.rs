//! Downloader (C8): streaming per-URL downloads plus session-level
//! fan-out across scan bundles, enumerated resources, and optional
//! assessor/reconstruction bundles.

mod session_bundle;

pub use session_bundle::{download_session, DownloadSessionRequest, SessionDownloadResult};
