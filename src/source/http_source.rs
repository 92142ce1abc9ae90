use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use reqwest::{header, Client, Method, RequestBuilder, Response};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::traits::{ByteRangeSource, SourceDescriptor, SourceInfo};
use crate::error::{Error, Result};

/// Result of a metadata-only `HEAD` request.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Probe {
    pub size: u64,
    pub accepts_ranges: bool,
}

/// Build a request with the configured custom headers and an optional Range header.
pub(crate) fn build_request(
    client: &Client,
    method: Method,
    url: &str,
    headers: &HashMap<String, String>,
    range_header: Option<&str>,
) -> RequestBuilder {
    let mut req = client.request(method, url);
    for (k, v) in headers {
        req = req.header(k.as_str(), v.as_str());
    }
    if let Some(range) = range_header {
        req = req.header(header::RANGE, range);
    }
    req
}

pub(crate) fn check_status(resp: &Response, what: &str) -> Result<()> {
    let status = resp.status();
    if !status.is_success() {
        warn!("http {} failed status={} url={}", what, status.as_u16(), resp.url());
        return Err(Error::protocol(format!(
            "{} failed: HTTP {}",
            what,
            status.as_u16()
        )));
    }
    Ok(())
}

/// Issue a `HEAD` request and read total length and range capability from its headers.
pub(crate) async fn probe(
    client: &Client,
    url: &str,
    headers: &HashMap<String, String>,
) -> Result<Probe> {
    let resp = build_request(client, Method::HEAD, url, headers, None)
        .send()
        .await?;
    debug!("http probe status={} url={}", resp.status().as_u16(), url);
    check_status(&resp, "probe")?;

    let size = resp
        .headers()
        .get(header::CONTENT_LENGTH)
        .ok_or_else(|| Error::protocol("probe response has no Content-Length"))?
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or_else(|| Error::protocol("probe response has a malformed Content-Length"))?;

    let accepts_ranges = resp
        .headers()
        .get(header::ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("bytes"))
        .unwrap_or(false);

    Ok(Probe {
        size,
        accepts_ranges,
    })
}

/// Reads a network resource by downloading it whole, once, and slicing the cached body.
pub struct HttpSource {
    client: Client,
    url: String,
    headers: HashMap<String, String>,
    size: AtomicU64,
    descriptor: RwLock<Option<SourceDescriptor>>,
    data: OnceCell<Bytes>,
}

impl HttpSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_headers(url, HashMap::new())
    }

    /// Create a source that sends `headers` with every request (e.g. auth tokens).
    pub fn with_headers(url: impl Into<String>, headers: HashMap<String, String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            headers,
            size: AtomicU64::new(0),
            descriptor: RwLock::new(None),
            data: OnceCell::new(),
        }
    }

    pub fn descriptor(&self) -> Option<SourceDescriptor> {
        self.descriptor.read().clone()
    }

    async fn fetch_all(&self) -> Result<Bytes> {
        let resp = build_request(&self.client, Method::GET, &self.url, &self.headers, None)
            .send()
            .await?;
        check_status(&resp, "download")?;
        let body = resp.bytes().await?;
        info!("http download complete url={} bytes={}", self.url, body.len());
        Ok(body)
    }
}

#[async_trait]
impl ByteRangeSource for HttpSource {
    async fn init(&self) -> Result<SourceInfo> {
        if let Some(descriptor) = self.descriptor.read().as_ref() {
            return Ok(descriptor.info());
        }

        let probe = probe(&self.client, &self.url, &self.headers).await?;
        let descriptor = SourceDescriptor {
            url: self.url.clone(),
            size: probe.size,
            range_capable: probe.accepts_ranges,
        };
        self.size.store(probe.size, Ordering::Release);
        let info = descriptor.info();
        *self.descriptor.write() = Some(descriptor);
        Ok(info)
    }

    async fn read_range(&self, offset: u64, length: u64) -> Result<Bytes> {
        let data = self.data.get_or_try_init(|| self.fetch_all()).await?;

        // Without a probe the downloaded body defines the size.
        let _ = self.size.compare_exchange(
            0,
            data.len() as u64,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let size = self.size.load(Ordering::Acquire);

        let end = offset
            .checked_add(length)
            .filter(|end| *end <= size)
            .ok_or(Error::OutOfRange {
                offset,
                length,
                size,
            })?;
        if end > data.len() as u64 {
            return Err(Error::protocol(format!(
                "downloaded body has {} bytes, expected {}",
                data.len(),
                size
            )));
        }
        Ok(data.slice(offset as usize..end as usize))
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }
}
