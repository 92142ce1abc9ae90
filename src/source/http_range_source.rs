use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use reqwest::{Client, Method, StatusCode};
use tracing::{debug, warn};

use super::http_source::{build_request, check_status, probe};
use super::traits::{ByteRangeSource, SourceDescriptor, SourceInfo};
use crate::error::{Error, Result};

/// Inclusive `Range` header value covering `length` bytes from `offset`.
/// `None` for an empty range or one that runs past `u64::MAX`.
pub(crate) fn range_header(offset: u64, length: u64) -> Option<String> {
    let last = offset.checked_add(length.checked_sub(1)?)?;
    Some(format!("bytes={}-{}", offset, last))
}

/// Reads a network resource with one partial `GET` per call.
pub struct HttpRangeSource {
    client: Client,
    url: String,
    headers: HashMap<String, String>,
    size: AtomicU64,
    /// `None` until a probe or a response tells us.
    range_capable: RwLock<Option<bool>>,
    descriptor: RwLock<Option<SourceDescriptor>>,
}

impl HttpRangeSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_headers(url, HashMap::new())
    }

    pub fn with_headers(url: impl Into<String>, headers: HashMap<String, String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            headers,
            size: AtomicU64::new(0),
            range_capable: RwLock::new(None),
            descriptor: RwLock::new(None),
        }
    }

    pub fn descriptor(&self) -> Option<SourceDescriptor> {
        self.descriptor.read().clone()
    }

    fn unsupported(&self) -> Error {
        Error::RangeUnsupported {
            url: self.url.clone(),
        }
    }
}

#[async_trait]
impl ByteRangeSource for HttpRangeSource {
    async fn init(&self) -> Result<SourceInfo> {
        if let Some(descriptor) = self.descriptor.read().as_ref() {
            return Ok(descriptor.info());
        }

        let probe = probe(&self.client, &self.url, &self.headers).await?;
        self.size.store(probe.size, Ordering::Release);
        *self.range_capable.write() = Some(probe.accepts_ranges);
        if !probe.accepts_ranges {
            warn!("http range source {} does not advertise byte ranges", self.url);
            return Err(self.unsupported());
        }

        let descriptor = SourceDescriptor {
            url: self.url.clone(),
            size: probe.size,
            range_capable: true,
        };
        let info = descriptor.info();
        *self.descriptor.write() = Some(descriptor);
        Ok(info)
    }

    async fn read_range(&self, offset: u64, length: u64) -> Result<Bytes> {
        if *self.range_capable.read() == Some(false) {
            debug!("range read skipped, {} is not range capable", self.url);
            return Err(self.unsupported());
        }
        if length == 0 {
            return Ok(Bytes::new());
        }
        let size = self.size.load(Ordering::Acquire);
        if size > 0 && offset.saturating_add(length) > size {
            return Err(Error::OutOfRange {
                offset,
                length,
                size,
            });
        }

        let range = range_header(offset, length).ok_or(Error::OutOfRange {
            offset,
            length,
            size,
        })?;
        let resp = build_request(
            &self.client,
            Method::GET,
            &self.url,
            &self.headers,
            Some(&range),
        )
        .send()
        .await?;

        let status = resp.status();
        if status == StatusCode::OK {
            // The server ignored the Range header and is sending the whole body.
            warn!("http range ignored by server url={} range={}", self.url, range);
            *self.range_capable.write() = Some(false);
            return Err(self.unsupported());
        }
        check_status(&resp, "range fetch")?;
        if status != StatusCode::PARTIAL_CONTENT {
            return Err(Error::protocol(format!(
                "range fetch returned HTTP {}",
                status.as_u16()
            )));
        }

        let body = resp.bytes().await?;
        if body.len() as u64 != length {
            return Err(Error::protocol(format!(
                "range {} returned {} bytes, expected {}",
                range,
                body.len(),
                length
            )));
        }
        debug!("http range fetch url={} range={} bytes={}", self.url, range, body.len());
        Ok(body)
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_header_is_inclusive() {
        assert_eq!(range_header(0, 1).as_deref(), Some("bytes=0-0"));
        assert_eq!(range_header(500, 100).as_deref(), Some("bytes=500-599"));
        let offset = 1u64 << 40;
        assert_eq!(
            range_header(offset, 4096),
            Some(format!("bytes={}-{}", offset, offset + 4095))
        );
    }

    #[test]
    fn test_range_header_rejects_empty_and_overflowing_ranges() {
        assert_eq!(range_header(0, 0), None);
        assert_eq!(range_header(u64::MAX, 2), None);
        assert_eq!(
            range_header(u64::MAX, 1).as_deref(),
            Some("bytes=18446744073709551615-18446744073709551615")
        );
    }
}
