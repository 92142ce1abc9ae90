// Adapter selection from configuration: pick a source or sink variant at
// construction time instead of wiring concrete types by hand.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use serde::Deserialize;

use crate::config::DEFAULT_CONTENT_TYPE;
use crate::error::{Error, Result};
use crate::session::SessionRegistry;
use crate::sink::{BlockSink, ByteSink, FsEntry, HandleSink, MemorySink};
use crate::source::{ByteRangeSource, HttpRangeSource, HttpSource, MemorySource};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    Memory {
        #[serde(skip)]
        data: Bytes,
    },
    Http {
        url: String,
    },
    HttpRange {
        url: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkSpec {
    Memory,
    File { path: PathBuf },
    BlockStore,
}

/// Where a sink's output goes and how it is labeled.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(flatten)]
    pub spec: SinkSpec,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_content_type() -> String {
    DEFAULT_CONTENT_TYPE.to_string()
}

pub fn open_source(spec: SourceSpec) -> Box<dyn ByteRangeSource> {
    match spec {
        SourceSpec::Memory { data } => Box::new(MemorySource::new(data)),
        SourceSpec::Http { url } => Box::new(HttpSource::new(url)),
        SourceSpec::HttpRange { url } => Box::new(HttpRangeSource::new(url)),
    }
}

/// Network source for `url`, reading by range requests when `use_range_header` is set.
pub fn http_source(url: impl Into<String>, use_range_header: bool) -> Box<dyn ByteRangeSource> {
    let url = url.into();
    if use_range_header {
        open_source(SourceSpec::HttpRange { url })
    } else {
        open_source(SourceSpec::Http { url })
    }
}

/// Build the configured sink. Block-store sinks need the process registry.
pub fn open_sink(
    config: SinkConfig,
    registry: Option<Arc<SessionRegistry>>,
) -> Result<Box<dyn ByteSink>> {
    let SinkConfig { spec, content_type } = config;
    let sink: Box<dyn ByteSink> = match spec {
        SinkSpec::Memory => Box::new(MemorySink::with_content_type(content_type)),
        SinkSpec::File { path } => Box::new(HandleSink::new(FsEntry::new(path), content_type)),
        SinkSpec::BlockStore => {
            let registry = registry.ok_or_else(|| {
                Error::Storage(anyhow!("block-store sink requires a session registry"))
            })?;
            Box::new(BlockSink::new(registry, content_type))
        }
    };
    Ok(sink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specs_deserialize() {
        let source: SourceSpec =
            serde_json::from_str(r#"{"kind": "http_range", "url": "http://x/a.zip"}"#).unwrap();
        assert!(matches!(source, SourceSpec::HttpRange { ref url } if url == "http://x/a.zip"));

        let sink: SinkConfig =
            serde_json::from_str(r#"{"kind": "file", "path": "/tmp/a.zip"}"#).unwrap();
        assert!(matches!(sink.spec, SinkSpec::File { .. }));
        assert_eq!(sink.content_type, DEFAULT_CONTENT_TYPE);

        let sink: SinkConfig =
            serde_json::from_str(r#"{"kind": "block_store", "content_type": "application/zip"}"#)
                .unwrap();
        assert!(matches!(sink.spec, SinkSpec::BlockStore));
        assert_eq!(sink.content_type, "application/zip");
    }

    #[tokio::test]
    async fn test_open_memory_adapters() {
        let source = open_source(SourceSpec::Memory {
            data: Bytes::from_static(b"hello"),
        });
        assert_eq!(source.init().await.unwrap().size, 5);
        assert_eq!(&source.read_range(1, 3).await.unwrap()[..], b"ell");

        let mut sink = open_sink(
            SinkConfig {
                spec: SinkSpec::Memory,
                content_type: "text/plain".into(),
            },
            None,
        )
        .unwrap();
        sink.init().await.unwrap();
        sink.write_bytes(Bytes::from_static(b"hi")).await.unwrap();
        let blob = sink.finalize().await.unwrap();
        assert_eq!(blob, crate::sink::Blob::new("text/plain", &b"hi"[..]));
    }

    #[test]
    fn test_block_store_sink_needs_registry() {
        let config = SinkConfig {
            spec: SinkSpec::BlockStore,
            content_type: DEFAULT_CONTENT_TYPE.into(),
        };
        assert!(matches!(open_sink(config, None), Err(Error::Storage(_))));
    }
}
