use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;

use archive_io::source::{ByteRangeSource, HttpRangeSource, HttpSource};
use archive_io::Error;

#[derive(Clone)]
struct Upstream {
    body: Arc<Vec<u8>>,
    advertise_ranges: bool,
    honor_ranges: bool,
    gets: Arc<AtomicUsize>,
    last_range: Arc<Mutex<Option<String>>>,
}

impl Upstream {
    fn new(size: usize, advertise_ranges: bool, honor_ranges: bool) -> Self {
        Self {
            body: Arc::new((0..size).map(|i| (i % 251) as u8).collect()),
            advertise_ranges,
            honor_ranges,
            gets: Arc::new(AtomicUsize::new(0)),
            last_range: Arc::new(Mutex::new(None)),
        }
    }

    fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

fn parse_range(value: &str) -> Option<(usize, usize)> {
    let rest = value.strip_prefix("bytes=")?;
    let (start, end) = rest.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

async fn head_file(State(up): State<Upstream>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(up.body.len()));
    if up.advertise_ranges {
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }
    (StatusCode::OK, headers).into_response()
}

async fn get_file(State(up): State<Upstream>, headers: HeaderMap) -> Response {
    up.gets.fetch_add(1, Ordering::SeqCst);
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    *up.last_range.lock() = range.clone();

    if up.honor_ranges {
        if let Some((start, end)) = range.as_deref().and_then(parse_range) {
            let end = end.min(up.body.len() - 1);
            let content_range = format!("bytes {}-{}/{}", start, end, up.body.len());
            return (
                StatusCode::PARTIAL_CONTENT,
                [(header::CONTENT_RANGE, content_range)],
                up.body[start..=end].to_vec(),
            )
                .into_response();
        }
    }

    (StatusCode::OK, up.body.to_vec()).into_response()
}

async fn start_server(upstream: Upstream) -> SocketAddr {
    let app = Router::new()
        .route("/file", get(get_file).head(head_file))
        .with_state(upstream);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn test_http_source_downloads_once() {
    let upstream = Upstream::new(1000, false, false);
    let addr = start_server(upstream.clone()).await;
    let source = HttpSource::new(format!("http://{}/file", addr));

    let info = source.init().await.unwrap();
    assert_eq!(info.size, 1000);
    assert!(!info.range_capable);
    assert_eq!(upstream.gets(), 0);

    let data = source.read_range(500, 100).await.unwrap();
    assert_eq!(&data[..], &upstream.body[500..600]);

    for (offset, length) in [(0u64, 10u64), (990, 10), (123, 456), (500, 100)] {
        let data = source.read_range(offset, length).await.unwrap();
        assert_eq!(&data[..], &upstream.body[offset as usize..(offset + length) as usize]);
    }
    assert_eq!(upstream.gets(), 1);
    assert_eq!(*upstream.last_range.lock(), None);
}

#[tokio::test]
async fn test_http_source_concurrent_first_reads_share_download() {
    let upstream = Upstream::new(4096, true, true);
    let addr = start_server(upstream.clone()).await;
    let source = HttpSource::new(format!("http://{}/file", addr));

    let (a, b, c) = tokio::join!(
        source.read_range(0, 16),
        source.read_range(1000, 16),
        source.read_range(4080, 16),
    );
    assert_eq!(&a.unwrap()[..], &upstream.body[0..16]);
    assert_eq!(&b.unwrap()[..], &upstream.body[1000..1016]);
    assert_eq!(&c.unwrap()[..], &upstream.body[4080..4096]);
    assert_eq!(upstream.gets(), 1);
    // No probe was made, so the body defined the size.
    assert_eq!(source.size(), 4096);
}

#[tokio::test]
async fn test_http_range_source_reads_slices() {
    let upstream = Upstream::new(64 * 1024, true, true);
    let addr = start_server(upstream.clone()).await;
    let source = HttpRangeSource::new(format!("http://{}/file", addr));

    let info = source.init().await.unwrap();
    assert_eq!(info.size, 64 * 1024);
    assert!(info.range_capable);
    let descriptor = source.descriptor().unwrap();
    assert_eq!(descriptor.url, format!("http://{}/file", addr));

    let data = source.read_range(500, 100).await.unwrap();
    assert_eq!(&data[..], &upstream.body[500..600]);
    assert_eq!(upstream.last_range.lock().as_deref(), Some("bytes=500-599"));

    let data = source.read_range(65_535, 1).await.unwrap();
    assert_eq!(&data[..], &upstream.body[65_535..]);
    assert_eq!(upstream.last_range.lock().as_deref(), Some("bytes=65535-65535"));

    // Every read is its own request.
    source.read_range(500, 100).await.unwrap();
    assert_eq!(upstream.gets(), 3);

    assert!(matches!(
        source.read_range(65_000, 1_000).await,
        Err(Error::OutOfRange { .. })
    ));
    assert_eq!(upstream.gets(), 3);
}

#[tokio::test]
async fn test_http_range_source_rejects_non_range_resource() {
    let upstream = Upstream::new(1000, false, false);
    let addr = start_server(upstream.clone()).await;
    let source = HttpRangeSource::new(format!("http://{}/file", addr));

    assert!(matches!(
        source.init().await,
        Err(Error::RangeUnsupported { .. })
    ));
    assert_eq!(source.size(), 1000);

    for _ in 0..3 {
        assert!(matches!(
            source.read_range(500, 100).await,
            Err(Error::RangeUnsupported { .. })
        ));
    }
    assert_eq!(upstream.gets(), 0);
}

#[tokio::test]
async fn test_http_range_source_detects_ignored_range_header() {
    // Advertises ranges but answers every GET with the full body.
    let upstream = Upstream::new(1000, true, false);
    let addr = start_server(upstream.clone()).await;
    let source = HttpRangeSource::new(format!("http://{}/file", addr));

    assert!(matches!(
        source.read_range(0, 10).await,
        Err(Error::RangeUnsupported { .. })
    ));
    assert_eq!(upstream.gets(), 1);

    assert!(matches!(
        source.read_range(10, 10).await,
        Err(Error::RangeUnsupported { .. })
    ));
    assert_eq!(upstream.gets(), 1);
}

#[tokio::test]
async fn test_probe_of_missing_resource_is_protocol_error() {
    let upstream = Upstream::new(10, true, true);
    let addr = start_server(upstream).await;
    let source = HttpRangeSource::new(format!("http://{}/missing", addr));

    match source.init().await {
        Err(Error::Protocol(msg)) => assert!(msg.contains("404"), "{}", msg),
        other => panic!("expected protocol error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unreachable_server_is_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let source = HttpSource::new(format!("http://{}/file", addr));
    assert!(matches!(source.init().await, Err(Error::Network(_))));
    assert!(matches!(
        source.read_range(0, 1).await,
        Err(Error::Network(_))
    ));
}

#[tokio::test]
async fn test_http_range_source_overflowing_read_before_init() {
    let upstream = Upstream::new(1000, true, true);
    let addr = start_server(upstream.clone()).await;
    let source = HttpRangeSource::new(format!("http://{}/file", addr));

    // Size is still unknown, so only the range arithmetic can reject this.
    assert!(matches!(
        source.read_range(u64::MAX, 2).await,
        Err(Error::OutOfRange { .. })
    ));
    assert!(source.read_range(10, 0).await.unwrap().is_empty());
    assert_eq!(upstream.gets(), 0);
}
