//! Reverse proxy to the upstream provider. Builds the upstream
//! request from the route and inbound request, enforces the dispatch
//! timeout and response body cap, and normalizes headers in both directions.

use gateway_types::RequestId;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use std::time::{Duration, Instant};
use tracing::warn;

/// Hop-by-hop and identity-bearing headers never forwarded upstream.
const REQUEST_STRIP_LIST: &[&str] = &[
    "host",
    "authorization",
    "x-nexusx-key",
    "x-forwarded-for",
    "x-forwarded-by",
    "x-forwarded-host",
    "x-forwarded-proto",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "proxy-authorization",
    "proxy-connection",
];

/// Headers stripped from the upstream response before it reaches the caller.
const RESPONSE_STRIP_LIST: &[&str] = &["transfer-encoding", "connection", "keep-alive"];

pub struct ProxyResult {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub latency_ms: u64,
    pub bytes_transferred: u64,
}

pub struct ProxyEngine {
    client: Client,
    max_response_body_bytes: u64,
}

impl ProxyEngine {
    pub fn new(timeout_ms: u64, max_response_body_bytes: u64) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()?;
        Ok(Self {
            client,
            max_response_body_bytes,
        })
    }

    /// `forward`. `base_url` is the route's upstream base; `sub_path`
    /// and `query` come from the inbound request's remaining path segments.
    pub async fn forward(
        &self,
        base_url: &str,
        sub_path: &str,
        query: Option<&str>,
        method: Method,
        inbound_headers: &HeaderMap,
        body: Vec<u8>,
        request_id: RequestId,
    ) -> ProxyResult {
        let url = build_upstream_url(base_url, sub_path, query);
        let headers = build_upstream_headers(inbound_headers, request_id);
        let started = Instant::now();

        let mut builder = self.client.request(method, &url).headers(headers);
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                return synthetic_response(504, started.elapsed());
            }
            Err(err) => {
                warn!(%err, url, "upstream dispatch failed");
                return synthetic_response(502, started.elapsed());
            }
        };

        let status = response.status().as_u16();
        let mut headers = response.headers().clone();
        let body = match drain_capped(response, self.max_response_body_bytes).await {
            Ok(body) => body,
            Err(err) => {
                warn!(%err, url, "upstream response exceeded body cap");
                return synthetic_response(502, started.elapsed());
            }
        };

        for name in RESPONSE_STRIP_LIST {
            headers.remove(*name);
        }
        let latency_ms = started.elapsed().as_millis() as u64;
        insert_header(&mut headers, "x-nexusx-request-id", &request_id.to_string());
        insert_header(&mut headers, "x-nexusx-latency-ms", &latency_ms.to_string());

        ProxyResult {
            status,
            headers,
            bytes_transferred: body.len() as u64,
            body,
            latency_ms,
        }
    }
}

fn build_upstream_url(base_url: &str, sub_path: &str, query: Option<&str>) -> String {
    let base = base_url.trim_end_matches('/');
    let path = if sub_path.starts_with('/') {
        sub_path.to_string()
    } else {
        format!("/{sub_path}")
    };
    match query {
        Some(query) if !query.is_empty() => format!("{base}{path}?{query}"),
        _ => format!("{base}{path}"),
    }
}

fn build_upstream_headers(inbound: &HeaderMap, request_id: RequestId) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound.iter() {
        if REQUEST_STRIP_LIST.contains(&name.as_str()) {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }
    insert_header(&mut headers, "x-forwarded-by", "nexusx-gateway");
    insert_header(&mut headers, "x-nexusx-request-id", &request_id.to_string());
    headers
}

pub(crate) fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    }
}

async fn drain_capped(response: reqwest::Response, cap: u64) -> anyhow::Result<Vec<u8>> {
    use futures_util::StreamExt;

    let mut stream = response.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buf.extend_from_slice(&chunk);
        if buf.len() as u64 > cap {
            anyhow::bail!("response body exceeded cap of {cap} bytes");
        }
    }
    Ok(buf)
}

fn synthetic_response(status: u16, elapsed: Duration) -> ProxyResult {
    let code = if status == 504 {
        "GATEWAY_TIMEOUT"
    } else {
        "BAD_GATEWAY"
    };
    let body = serde_json::json!({ "error": { "code": code } })
        .to_string()
        .into_bytes();
    ProxyResult {
        status,
        headers: HeaderMap::new(),
        bytes_transferred: body.len() as u64,
        body,
        latency_ms: elapsed.as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_trailing_slash_and_adds_leading_slash() {
        let url = build_upstream_url("https://upstream.example.com/", "weather", Some("q=ny"));
        assert_eq!(url, "https://upstream.example.com/weather?q=ny");
    }

    #[test]
    fn omits_query_when_absent() {
        let url = build_upstream_url("https://upstream.example.com", "/weather", None);
        assert_eq!(url, "https://upstream.example.com/weather");
    }

    #[test]
    fn request_headers_drop_strip_list_entries() {
        let mut inbound = HeaderMap::new();
        inbound.insert("host", HeaderValue::from_static("gateway.example.com"));
        inbound.insert("authorization", HeaderValue::from_static("Bearer secret"));
        inbound.insert("accept", HeaderValue::from_static("application/json"));

        let headers = build_upstream_headers(&inbound, uuid::Uuid::new_v4());
        assert!(!headers.contains_key("host"));
        assert!(!headers.contains_key("authorization"));
        assert!(headers.contains_key("accept"));
        assert!(headers.contains_key("x-forwarded-by"));
        assert!(headers.contains_key("x-nexusx-request-id"));
    }
}
