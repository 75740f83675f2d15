//! Connection (C4 target configuration).
//!
//! An immutable record describing where and how to reach the server.
//! Cheap to clone: the underlying `reqwest::Client` connection pool is
//! reference-counted internally by `reqwest`, matching the source's
//! pattern of re-authenticating per worker off a shared configuration.

use std::time::Duration;

use super::responses::BuildInfoResponse;
use crate::error::ConnectionError;

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Connection {
    pub server: String,
    pub username: String,
    credential: String,
    pub verify_tls: bool,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Connection {
    /// `server` must already be validated (no trailing slash, http/https)
    /// by [`crate::validators::validate_server_url`].
    pub fn new(
        server: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
        verify_tls: bool,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self {
            server: server.into(),
            username: username.into(),
            credential: credential.into(),
            verify_tls,
            connect_timeout,
            read_timeout,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.server, path)
    }

    /// Build a `reqwest::Client` honoring `verify_tls` and the
    /// connect/read timeouts. `read_timeout` becomes the client default;
    /// individual requests may override it with `.timeout(...)`.
    pub(super) fn build_client(&self) -> Result<reqwest::Client, ConnectionError> {
        reqwest::Client::builder()
            .danger_accept_invalid_certs(!self.verify_tls)
            .connect_timeout(self.connect_timeout)
            .timeout(self.read_timeout)
            .build()
            .map_err(|e| ConnectionError::ServerUnreachable {
                server: self.server.clone(),
                source: e.into(),
            })
    }

    pub(super) fn basic_auth_header(&self) -> (String, String) {
        (self.username.clone(), self.credential.clone())
    }

    /// `GET /xapi/siteConfig/buildInfo` with a short (30s, 30s) timeout.
    /// Does not require an open [`super::Session`] — basic auth on this
    /// one request is enough.
    pub async fn health_check(&self) -> Result<String, ConnectionError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!self.verify_tls)
            .connect_timeout(HEALTH_CHECK_TIMEOUT)
            .timeout(HEALTH_CHECK_TIMEOUT)
            .build()
            .map_err(|e| ConnectionError::ServerUnreachable {
                server: self.server.clone(),
                source: e.into(),
            })?;

        let response = client
            .get(self.url("/xapi/siteConfig/buildInfo"))
            .basic_auth(&self.username, Some(&self.credential))
            .send()
            .await
            .map_err(|e| ConnectionError::ServerUnreachable {
                server: self.server.clone(),
                source: e.into(),
            })?;

        match response.status().as_u16() {
            200 => {
                let body: BuildInfoResponse = response.json().await.map_err(|e| {
                    ConnectionError::ServerUnreachable {
                        server: self.server.clone(),
                        source: e.into(),
                    }
                })?;
                Ok(body.version_or_unknown())
            }
            401 | 403 => Err(ConnectionError::Authentication { server: self.server.clone() }),
            status => Err(ConnectionError::ServerUnreachable {
                server: self.server.clone(),
                source: anyhow::anyhow!("unexpected status {status}"),
            }),
        }
    }
}

