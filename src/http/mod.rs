//! Thin HTTP transport over `reqwest`.
//!
//! Every call returns a [`Response`] instead of a `Result`: failures are carried in
//! `Response::error` with a sentinel status code of `0` when no HTTP status was
//! received at all. Callers decide how to classify the failure.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;

use crate::ui::prelude::*;

pub const USER_AGENT: &str = concat!("gdpm/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Status code used when the request never produced an HTTP status
pub const NO_STATUS: u16 = 0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("server returned HTTP {0}")]
    Status(u16),

    #[error("failed to read response body: {0}")]
    Body(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else if e.is_body() || e.is_decode() {
            TransportError::Body(e.to_string())
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

/// Per-request knobs
#[derive(Debug, Clone)]
pub struct RequestParams {
    pub timeout: Duration,
    pub headers: Vec<(String, String)>,
    pub verbose: u8,
}

impl Default for RequestParams {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            headers: Vec::new(),
            verbose: 0,
        }
    }
}

impl RequestParams {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct Response {
    pub code: u16,
    pub body: String,
    pub error: Option<TransportError>,
}

impl Response {
    fn failed(code: u16, error: TransportError) -> Self {
        Self {
            code,
            body: String::new(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.code)
    }

    /// The failure cause, with non-2xx statuses reported as [`TransportError::Status`]
    pub fn failure(&self) -> Option<TransportError> {
        match &self.error {
            Some(e) => Some(e.clone()),
            None if !(200..300).contains(&self.code) => Some(TransportError::Status(self.code)),
            None => None,
        }
    }
}

/// Shared HTTP client. Cloning is cheap and calls share no mutable state.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self { client })
    }

    fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        params: &RequestParams,
    ) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, url)
            .timeout(params.timeout);
        for (name, value) in &params.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }

    pub async fn get(&self, url: &str, params: &RequestParams) -> Response {
        log_request("GET", url, params);
        let builder = self.request(reqwest::Method::GET, url, params);
        let response = finish_text(builder).await;
        log_response(url, &response, params);
        response
    }

    pub async fn post(
        &self,
        url: &str,
        fields: &[(String, String)],
        params: &RequestParams,
    ) -> Response {
        log_request("POST", url, params);
        let builder = self.request(reqwest::Method::POST, url, params).form(fields);
        let response = finish_text(builder).await;
        log_response(url, &response, params);
        response
    }

    /// Stream `url` into `dest`.
    ///
    /// The body is written to a temporary file in the destination directory and renamed
    /// into place only after a 2xx response was fully received, so `dest` never holds an
    /// error page or a truncated archive.
    pub async fn download_to_file(&self, url: &str, dest: &Path, params: &RequestParams) -> Response {
        log_request("GET", url, params);
        let response = match self.stream_to_file(url, dest, params).await {
            Ok(code) => Response {
                code,
                body: String::new(),
                error: None,
            },
            Err((code, error)) => Response::failed(code, error),
        };
        log_response(url, &response, params);
        response
    }

    async fn stream_to_file(
        &self,
        url: &str,
        dest: &Path,
        params: &RequestParams,
    ) -> Result<u16, (u16, TransportError)> {
        let io_err = |e: std::io::Error| (NO_STATUS, TransportError::Io(e.to_string()));

        let dir = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => std::env::current_dir().map_err(io_err)?,
        };
        std::fs::create_dir_all(&dir).map_err(io_err)?;

        let response = self
            .request(reqwest::Method::GET, url, params)
            .send()
            .await
            .map_err(|e| (NO_STATUS, TransportError::from(e)))?;

        let code = response.status().as_u16();
        if !response.status().is_success() {
            return Err((code, TransportError::Status(code)));
        }

        let mut file = tempfile::NamedTempFile::new_in(&dir).map_err(io_err)?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| (code, TransportError::from(e)))?;
            file.write_all(&chunk)
                .map_err(|e| (code, TransportError::Io(e.to_string())))?;
        }
        file.flush()
            .map_err(|e| (code, TransportError::Io(e.to_string())))?;
        file.persist(dest)
            .map_err(|e| (code, TransportError::Io(e.error.to_string())))?;

        Ok(code)
    }
}

async fn finish_text(builder: reqwest::RequestBuilder) -> Response {
    let response = match builder.send().await {
        Ok(r) => r,
        Err(e) => return Response::failed(NO_STATUS, e.into()),
    };

    let code = response.status().as_u16();
    let success = response.status().is_success();
    match response.text().await {
        Ok(body) => Response {
            code,
            body,
            error: (!success).then_some(TransportError::Status(code)),
        },
        Err(e) => Response::failed(code, e.into()),
    }
}

fn log_request(method: &str, url: &str, params: &RequestParams) {
    if params.verbose > 0 {
        emit(
            Level::Debug,
            "http.request",
            &format!("{} {} {}", char::from(NerdFont::Globe), method, url),
            None,
        );
    }
}

fn log_response(url: &str, response: &Response, params: &RequestParams) {
    if params.verbose == 0 {
        return;
    }
    if let Some(err) = response.failure() {
        emit(
            Level::Debug,
            "http.failed",
            &format!("{} {url}: {err}", char::from(NerdFont::Cross)),
            Some(serde_json::json!({ "url": url, "code": response.code })),
        );
    } else {
        emit(
            Level::Debug,
            "http.response",
            &format!("{} {url}: HTTP {}", char::from(NerdFont::Check), response.code),
            None,
        );
    }
}
