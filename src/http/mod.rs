//! HTTP transport (C4): connection configuration, session lifecycle, and
//! the server's JSON response shapes.

mod connection;
mod responses;
mod session;

pub use connection::Connection;
pub use responses::{
    BuildInfoResponse, ExperimentRow, ResourceRow, ResultSetEnvelope, ScanRow, SubjectRow,
};
pub use session::{with_session, RequestBody, Session};
