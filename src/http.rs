//! The `http_request`/`http_status_code`/`http_headers` host-function
//! adapter (SPEC_FULL.md §4.5).
//!
//! Reads a JSON request descriptor out of a guest block, checks the target
//! hostname against an allow-list of exact or glob patterns, dispatches
//! through a pluggable [`Fetch`] implementation (defaulting to a
//! synchronous `ureq` client, grounded on the teacher's synchronous,
//! non-`tokio` architecture), and stores the response body back as a new
//! block capped at `max_response_bytes`.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use url::Url;

use crate::call_context::CallContext;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct HttpRequestData {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct HttpResponseData {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// A pluggable HTTP client; hosts may swap this out (e.g. to add retries,
/// proxying, or to reuse an existing async client pool) via
/// [`crate::options::PluginOptions::fetch`].
pub trait Fetch: Send + Sync {
    fn fetch(&self, request: &HttpRequestData, max_response_bytes: Option<u64>) -> Result<HttpResponseData>;
}

/// Default, dependency-light synchronous client.
pub struct UreqFetch;

impl Fetch for UreqFetch {
    fn fetch(&self, request: &HttpRequestData, max_response_bytes: Option<u64>) -> Result<HttpResponseData> {
        let mut req = ureq::request(&request.method, &request.url);
        for (k, v) in &request.headers {
            req = req.set(k, v);
        }
        let response = if request.body.is_empty() {
            req.call()
        } else {
            req.send_bytes(&request.body)
        }
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;

        let status = response.status();
        let mut headers = HashMap::new();
        for name in response.headers_names() {
            if let Some(value) = response.header(&name) {
                headers.insert(name, value.to_string());
            }
        }

        let mut body = Vec::new();
        let cap = max_response_bytes.unwrap_or(u64::MAX);
        let mut reader = response.into_reader().take(cap.saturating_add(1));
        reader
            .read_to_end(&mut body)
            .map_err(Error::Io)?;
        if body.len() as u64 > cap {
            return Err(Error::resource_limit(format!(
                "http response body exceeded max_http_response_bytes ({cap})"
            )));
        }

        Ok(HttpResponseData {
            status,
            headers,
            body,
        })
    }
}

#[derive(Deserialize)]
struct RequestJson {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: String,
}

fn default_method() -> String {
    "GET".to_string()
}

pub struct HttpConfig {
    allowed_hosts: GlobSet,
    pub max_response_bytes: Option<u64>,
    pub expose_response_headers: bool,
    pub fetch: Arc<dyn Fetch>,
}

impl HttpConfig {
    pub fn new(
        allowed_host_patterns: &[String],
        max_response_bytes: Option<u64>,
        expose_response_headers: bool,
        fetch: Arc<dyn Fetch>,
    ) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in allowed_host_patterns {
            let glob = Glob::new(pattern)
                .map_err(|e| Error::config(format!("invalid allowed_hosts pattern {pattern:?}: {e}")))?;
            builder.add(glob);
        }
        let allowed_hosts = builder
            .build()
            .map_err(|e| Error::config(format!("failed to compile allowed_hosts patterns: {e}")))?;
        Ok(HttpConfig {
            allowed_hosts,
            max_response_bytes,
            expose_response_headers,
            fetch,
        })
    }

    fn host_allowed(&self, host: &str) -> bool {
        self.allowed_hosts.is_match(host)
    }
}

/// Per-plugin mutable HTTP state: the static allow-list/client config plus
/// the most recent response's status code and headers, retrievable by the
/// guest after `http_request` returns.
pub struct HttpState {
    config: HttpConfig,
    last_status: Option<u16>,
    last_headers: Option<HashMap<String, String>>,
}

impl HttpState {
    pub fn new(config: HttpConfig) -> Self {
        HttpState {
            config,
            last_status: None,
            last_headers: None,
        }
    }

    /// Reads the request JSON from `request_addr`, performs the fetch, and
    /// stores the response body as a new block, returning its address (or
    /// 0 if the request block was empty/missing).
    pub fn request(&mut self, call_context: &mut CallContext, request_addr: u64) -> Result<u64> {
        let raw = match call_context.read(request_addr) {
            Some(bytes) => bytes.to_vec(),
            None => return Ok(0),
        };
        let parsed: RequestJson = serde_json::from_slice(&raw)
            .map_err(|e| Error::config(format!("invalid http_request JSON: {e}")))?;

        let url = Url::parse(&parsed.url)
            .map_err(|e| Error::config(format!("invalid URL {:?}: {e}", parsed.url)))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::config(format!("URL {:?} has no host", parsed.url)))?
            .to_string();

        if !self.config.host_allowed(&host) {
            return Err(Error::HostRejected(format!(
                "host {host:?} (url {:?}) is not present in allowed_hosts",
                parsed.url
            )));
        }

        let request = HttpRequestData {
            url: parsed.url,
            method: parsed.method,
            headers: parsed.headers,
            body: parsed.body.into_bytes(),
        };

        let response = self.config.fetch.fetch(&request, self.config.max_response_bytes)?;
        self.last_status = Some(response.status);
        self.last_headers = if self.config.expose_response_headers {
            Some(response.headers.clone())
        } else {
            None
        };

        Ok(call_context.store(&response.body))
    }

    pub fn status_code(&self) -> u64 {
        self.last_status.map(|s| s as u64).unwrap_or(0)
    }

    pub fn headers(&self, call_context: &mut CallContext) -> Result<u64> {
        match &self.last_headers {
            Some(headers) => {
                let json = serde_json::to_vec(headers)
                    .map_err(|e| Error::Wasm(anyhow::anyhow!("failed to encode response headers: {e}")))?;
                Ok(call_context.store(&json))
            }
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogSink;
    use std::collections::HashMap as Map;

    struct StubFetch(HttpResponseData);

    impl Fetch for StubFetch {
        fn fetch(&self, _request: &HttpRequestData, _max: Option<u64>) -> Result<HttpResponseData> {
            Ok(self.0.clone())
        }
    }

    fn context() -> CallContext {
        CallContext::new(Map::new(), None, None, LogSink::default())
    }

    #[test]
    fn denies_host_outside_allow_list() {
        let config = HttpConfig::new(
            &["*.example.com".to_string()],
            None,
            false,
            Arc::new(StubFetch(HttpResponseData {
                status: 200,
                headers: Map::new(),
                body: vec![],
            })),
        )
        .unwrap();
        let mut state = HttpState::new(config);
        let mut ctx = context();
        let req_addr = ctx.store(br#"{"url":"https://jsonplaceholder.typicode.com/todos/1"}"#);
        let err = state.request(&mut ctx, req_addr).unwrap_err();
        match err {
            Error::HostRejected(msg) => {
                assert!(msg.contains("jsonplaceholder.typicode.com"));
            }
            other => panic!("expected HostRejected, got {other:?}"),
        }
    }

    #[test]
    fn allows_glob_matched_host_and_stores_body() {
        let config = HttpConfig::new(
            &["*.example.com".to_string()],
            None,
            true,
            Arc::new(StubFetch(HttpResponseData {
                status: 201,
                headers: Map::new(),
                body: b"created".to_vec(),
            })),
        )
        .unwrap();
        let mut state = HttpState::new(config);
        let mut ctx = context();
        let req_addr = ctx.store(br#"{"url":"https://api.example.com/widgets","method":"POST"}"#);
        let out_addr = state.request(&mut ctx, req_addr).unwrap();
        assert_eq!(ctx.read(out_addr), Some(&b"created"[..]));
        assert_eq!(state.status_code(), 201);
    }
}
