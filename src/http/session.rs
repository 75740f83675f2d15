//! HTTP Session (C4).
//!
//! One server-issued token, created on first request and released on
//! close. One-shot: after `release()` the session is closed and further
//! use is rejected with [`ConnectionError::SessionExpired`].

use std::time::Duration;

use reqwest::Method;
use serde_json::Value;

use super::connection::Connection;
use crate::error::ConnectionError;

/// Body variants a request can carry.
pub enum RequestBody {
    None,
    Json(Value),
    /// A fully-buffered byte body (small uploads, e.g. a single resource
    /// file).
    Bytes { bytes: Vec<u8>, content_type: String },
    /// A streamed body backed by an `AsyncRead` (archives, large
    /// resource uploads) — never buffered into memory.
    Stream {
        body: reqwest::Body,
        content_type: String,
    },
}

pub struct Session {
    connection: Connection,
    client: reqwest::Client,
    token: String,
    closed: bool,
}

fn looks_like_html(body: &str) -> bool {
    let lowered = body.trim().to_ascii_lowercase();
    lowered.starts_with("<!doctype") || lowered.starts_with("<html")
}

impl Session {
    /// `POST /data/JSESSION` with basic auth. A 200 response with an
    /// HTML body is treated as an authentication failure (the server
    /// returned a login page rather than a token).
    pub async fn open(connection: Connection) -> Result<Self, ConnectionError> {
        let client = connection.build_client()?;
        let (username, password) = connection.basic_auth_header();

        let response = client
            .post(connection.url("/data/JSESSION"))
            .basic_auth(&username, Some(&password))
            .send()
            .await
            .map_err(|e| ConnectionError::ServerUnreachable {
                server: connection.server.clone(),
                source: e.into(),
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ConnectionError::ServerUnreachable {
                server: connection.server.clone(),
                source: e.into(),
            })?;

        if status.as_u16() != 200 {
            return Err(ConnectionError::Authentication { server: connection.server.clone() });
        }
        if looks_like_html(&body) {
            return Err(ConnectionError::Authentication { server: connection.server.clone() });
        }

        Ok(Self {
            connection,
            client,
            token: body.trim().to_string(),
            closed: false,
        })
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::SessionExpired);
        }
        Ok(())
    }

    fn request_builder(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        timeout_override: Option<(Duration, Duration)>,
    ) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, self.connection.url(path))
            .header(reqwest::header::COOKIE, format!("JSESSIONID={}", self.token))
            .query(query);
        if let Some((_connect, read)) = timeout_override {
            builder = builder.timeout(read);
        }
        builder
    }

    /// Issue an authenticated request. `timeout_override` lets a caller
    /// narrow the default `(connect_timeout, read_timeout)` for a
    /// specific call (e.g. a quick existence check).
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        headers: &[(&str, &str)],
        body: RequestBody,
        timeout_override: Option<(Duration, Duration)>,
    ) -> Result<reqwest::Response, ConnectionError> {
        self.ensure_open()?;

        let mut builder = self.request_builder(method, path, query, timeout_override);
        for (key, value) in headers {
            builder = builder.header(*key, *value);
        }

        builder = match body {
            RequestBody::None => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Bytes { bytes, content_type } => {
                builder.header(reqwest::header::CONTENT_TYPE, content_type).body(bytes)
            }
            RequestBody::Stream { body, content_type } => {
                builder.header(reqwest::header::CONTENT_TYPE, content_type).body(body)
            }
        };

        builder.send().await.map_err(|e| ConnectionError::ServerUnreachable {
            server: self.connection.server.clone(),
            source: e.into(),
        })
    }

    pub async fn get(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<reqwest::Response, ConnectionError> {
        self.request(Method::GET, path, query, &[], RequestBody::None, None).await
    }

    pub async fn delete(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<reqwest::Response, ConnectionError> {
        self.request(Method::DELETE, path, query, &[], RequestBody::None, None).await
    }

    /// `DELETE /data/JSESSION`. Best-effort: errors are swallowed, the
    /// session is marked closed regardless.
    pub async fn release(mut self) {
        if self.closed {
            return;
        }
        let _ = self
            .client
            .delete(self.connection.url("/data/JSESSION"))
            .header(reqwest::header::COOKIE, format!("JSESSIONID={}", self.token))
            .send()
            .await;
        self.closed = true;
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

/// Run `f` against a freshly-opened session, then release the session
/// regardless of whether `f` succeeded. This is the scoped-acquisition
/// idiom for the session token: every caller that needs "open, use,
/// always release" should go through here rather than managing
/// open/release by hand.
pub async fn with_session<T, F, Fut>(connection: Connection, f: F) -> Result<T, ConnectionError>
where
    F: FnOnce(Session) -> (Session, Fut),
    Fut: std::future::Future<Output = Result<T, ConnectionError>>,
{
    let session = Session::open(connection).await?;
    let (session, fut) = f(session);
    let result = fut.await;
    session.release().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_login_page_is_detected() {
        assert!(looks_like_html("<!DOCTYPE html><html>login</html>"));
        assert!(looks_like_html("  <html><body>nope</body></html>"));
        assert!(!looks_like_html("SESSIONTOKENDEADBEEF"));
    }
}
