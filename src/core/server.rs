//! HTTP exposition server.
//!
//! Serves one route, `GET /metrics`, which runs a collection pass over every
//! pull-style plugin, renders the registry and answers with the gzip-compressed
//! text. Every other request gets an empty 404.
//!
//! The connection timeout bounds socket I/O only: a read or write that stalls
//! for longer fails the connection, while time spent collecting does not count.

use std::{
    convert::Infallible,
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use http_body_util::Full;
use hyper::{
    body::Bytes,
    header::{HeaderValue, CONTENT_ENCODING, CONTENT_TYPE},
    server::conn::http1,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::{TokioIo, TokioTimer};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpListener,
    sync::Mutex,
    time::Sleep,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::server::ServerConfig,
    core::{
        metrics::render::{self, gzip},
        plugins::PluginManager,
    },
};

/// Path of the only routed endpoint.
pub const METRICS_PATH: &str = "/metrics";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read local address: {0}")]
    LocalAddr(#[source] io::Error),
}

/// Scrape handler state: the plugins and the lock serializing scrapes.
pub struct Exporter {
    manager: PluginManager,
    scrape_lock: Mutex<()>,
    compression_level: u32,
}

impl Exporter {
    pub fn new(manager: PluginManager, compression_level: u32) -> Self {
        Self {
            manager,
            scrape_lock: Mutex::new(()),
            compression_level,
        }
    }

    pub fn manager(&self) -> &PluginManager {
        &self.manager
    }

    /// Collects and renders under the scrape lock, then compresses.
    pub async fn scrape(&self) -> io::Result<Vec<u8>> {
        let content = {
            let _guard = self.scrape_lock.lock().await;
            let failures = self.manager.collect_all().await;
            if !failures.is_empty() {
                debug!("{} plugin(s) failed during this scrape", failures.len());
            }
            self.manager.registry().render()
        };
        gzip(&content, self.compression_level)
    }
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

/// Routes one request.
pub async fn handle<B>(exporter: Arc<Exporter>, req: Request<B>) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() != Method::GET || req.uri().path() != METRICS_PATH {
        debug!("No route for {} {}", req.method(), req.uri().path());
        return Ok(empty_response(StatusCode::NOT_FOUND));
    }

    match exporter.scrape().await {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            let headers = response.headers_mut();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(render::CONTENT_TYPE));
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            Ok(response)
        }
        Err(e) => {
            error!("Failed to compress metrics: {}", e);
            Ok(empty_response(StatusCode::INTERNAL_SERVER_ERROR))
        }
    }
}

/// Stream wrapper failing any read or write that makes no progress within
/// `timeout`. The clock starts when an operation first has to wait and stops
/// as soon as it completes.
pub struct DeadlineStream<S> {
    inner: S,
    timeout: Duration,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> DeadlineStream<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            read_deadline: None,
            write_deadline: None,
        }
    }
}

/// Resolves a pending operation against its deadline.
fn check_deadline<T>(
    poll: Poll<io::Result<T>>,
    deadline: &mut Option<Pin<Box<Sleep>>>,
    timeout: Duration,
    cx: &mut Context<'_>,
    op: &str,
) -> Poll<io::Result<T>> {
    if poll.is_ready() {
        *deadline = None;
        return poll;
    }
    let sleep = deadline.get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
    if sleep.as_mut().poll(cx).is_ready() {
        *deadline = None;
        return Poll::Ready(Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{} stalled for {:?}", op, timeout),
        )));
    }
    Poll::Pending
}

impl<S: AsyncRead + Unpin> AsyncRead for DeadlineStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        let poll = Pin::new(&mut me.inner).poll_read(cx, buf);
        check_deadline(poll, &mut me.read_deadline, me.timeout, cx, "read")
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DeadlineStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        let poll = Pin::new(&mut me.inner).poll_write(cx, buf);
        check_deadline(poll, &mut me.write_deadline, me.timeout, cx, "write")
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        let poll = Pin::new(&mut me.inner).poll_write_vectored(cx, bufs);
        check_deadline(poll, &mut me.write_deadline, me.timeout, cx, "write")
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        let poll = Pin::new(&mut me.inner).poll_flush(cx);
        check_deadline(poll, &mut me.write_deadline, me.timeout, cx, "flush")
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        let poll = Pin::new(&mut me.inner).poll_shutdown(cx);
        check_deadline(poll, &mut me.write_deadline, me.timeout, cx, "shutdown")
    }
}

/// Accept loop bound to one listening socket.
pub struct MetricsServer {
    listener: TcpListener,
    exporter: Arc<Exporter>,
    config: ServerConfig,
}

impl MetricsServer {
    pub async fn bind(addr: SocketAddr, exporter: Arc<Exporter>, config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        Ok(Self {
            listener,
            exporter,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener.local_addr().map_err(ServerError::LocalAddr)
    }

    /// Serves connections until the task is dropped.
    pub async fn run(self) {
        match self.local_addr() {
            Ok(addr) => info!("Serving metrics on http://{}{}", addr, METRICS_PATH),
            Err(e) => warn!("{}", e),
        }

        let accept_timeout = self.config.accept_timeout();
        let connection_timeout = self.config.connection_timeout();

        loop {
            let (stream, peer) = match tokio::time::timeout(accept_timeout, self.listener.accept()).await {
                Err(_) => {
                    trace!("No connection within {:?}", accept_timeout);
                    continue;
                }
                Ok(Err(e)) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
                Ok(Ok(conn)) => conn,
            };
            trace!("Connection from {}", peer);

            let exporter = self.exporter.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| handle(exporter.clone(), req));
                // Half-close keeps hyper from reading the socket while the
                // handler runs, so only request and response I/O is timed.
                let conn = http1::Builder::new()
                    .timer(TokioTimer::new())
                    .header_read_timeout(connection_timeout)
                    .half_close(true)
                    .keep_alive(false)
                    .serve_connection(TokioIo::new(DeadlineStream::new(stream, connection_timeout)), service);

                match conn.await {
                    Ok(()) => {}
                    Err(e) if e.is_incomplete_message() => {}
                    Err(e) if e.is_timeout() => debug!("Connection from {} timed out", peer),
                    Err(e) => debug!("Error serving {}: {}", peer, e),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;
    use http_body_util::{BodyExt, Empty};
    use hyper_util::{client::legacy::Client, rt::TokioExecutor};
    use serde_json::{json, Value};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    use super::*;
    use crate::core::{
        metrics::{Metric, MetricDesc, Registry},
        plugins::{
            registry::construct_dyn, Collect, Construct, Plugin, PluginError, PluginResult,
            PluginTable,
        },
    };

    /// Counts scrapes into a counter, or fails every time when `fail` is set.
    /// `delay_ms` makes every collection pass take that long.
    struct Scrapes {
        metric: Metric,
        fail: bool,
        delay: Duration,
    }

    impl Plugin for Scrapes {
        fn name(&self) -> &'static str {
            "scrapes"
        }

        fn as_collect(&self) -> Option<&dyn Collect> {
            Some(self)
        }
    }

    impl Construct for Scrapes {
        fn construct(config: &Value, registry: &Arc<Registry>) -> PluginResult<Self> {
            let name = config["metric"].as_str().unwrap_or("scrapes");
            Ok(Scrapes {
                metric: registry.declare(MetricDesc::counter(name, "Scrapes served").labels(&["path"]))?,
                fail: config["fail"].as_bool().unwrap_or(false),
                delay: Duration::from_millis(config["delay_ms"].as_u64().unwrap_or(0)),
            })
        }
    }

    #[async_trait::async_trait]
    impl Collect for Scrapes {
        async fn collect(&self) -> PluginResult<()> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(PluginError::Other("sensor unplugged".into()));
            }
            let current = self.metric.get(&["/metrics"]).unwrap_or(0.0);
            self.metric.set(&["/metrics"], current + 1.0)?;
            Ok(())
        }
    }

    fn exporter(plugins: Value) -> Arc<Exporter> {
        let mut table = PluginTable::new();
        table.register("scrapes", construct_dyn::<Scrapes>);
        table.register("broken", construct_dyn::<Scrapes>);
        let Value::Object(config) = plugins else {
            unreachable!()
        };
        let manager = PluginManager::load(&config, &table, Arc::new(Registry::new()));
        Arc::new(Exporter::new(manager, 5))
    }

    fn gunzip(body: &[u8]) -> String {
        let mut text = String::new();
        GzDecoder::new(body).read_to_string(&mut text).unwrap();
        text
    }

    async fn serve(exporter: Arc<Exporter>) -> SocketAddr {
        serve_with(exporter, ServerConfig::default()).await
    }

    async fn serve_with(exporter: Arc<Exporter>, config: ServerConfig) -> SocketAddr {
        let server = MetricsServer::bind("127.0.0.1:0".parse().unwrap(), exporter, config)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        addr
    }

    #[tokio::test]
    async fn unknown_routes_are_404_with_empty_body() {
        let exporter = exporter(json!({ "scrapes": {} }));
        for (method, path) in [(Method::GET, "/status"), (Method::POST, "/metrics"), (Method::GET, "/")] {
            let req = Request::builder().method(method).uri(path).body(()).unwrap();
            let response = handle(exporter.clone(), req).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert!(body.is_empty());
        }
        let text = String::from_utf8(exporter.manager().registry().render()).unwrap();
        assert!(!text.contains("scrapes{"));
    }

    #[tokio::test]
    async fn scrape_body_decompresses_to_render_output() {
        let exporter = exporter(json!({ "scrapes": {} }));
        let req = Request::builder().uri(METRICS_PATH).body(()).unwrap();
        let response = handle(exporter.clone(), req).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], render::CONTENT_TYPE);
        assert_eq!(response.headers()[CONTENT_ENCODING], "gzip");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = gunzip(&body);
        assert_eq!(text.as_bytes(), exporter.manager().registry().render().as_slice());
        assert!(text.contains("scrapes{path=\"/metrics\"} 1.0\n"));
    }

    #[tokio::test]
    async fn end_to_end_failing_plugin_does_not_hide_others() {
        let exporter = exporter(json!({
            "broken": { "metric": "broken", "fail": true },
            "scrapes": {}
        }));
        let addr = serve(exporter).await;
        let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();

        let mut text = String::new();
        for _ in 0..2 {
            let uri = format!("http://{}/metrics", addr).parse().unwrap();
            let response = client.get(uri).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = response.into_body().collect().await.unwrap().to_bytes();
            text = gunzip(&body);
        }

        assert!(text.contains("# TYPE broken counter\n"));
        assert!(!text.contains("broken{"));
        assert!(text.contains("scrapes{path=\"/metrics\"} 2.0\n"));

        let req = Request::builder()
            .method(Method::POST)
            .uri(format!("http://{}/anything", addr))
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = client.request(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    fn short_timeouts() -> ServerConfig {
        ServerConfig {
            connection_timeout: 1,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn collection_slower_than_connection_timeout_still_answers() {
        let exporter = exporter(json!({ "scrapes": { "delay_ms": 1500 } }));
        let addr = serve_with(exporter, short_timeouts()).await;
        let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();

        let uri = format!("http://{}/metrics", addr).parse().unwrap();
        let response = client.get(uri).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(gunzip(&body).contains("scrapes{path=\"/metrics\"} 1.0\n"));
    }

    #[tokio::test]
    async fn stalled_client_is_disconnected() {
        let exporter = exporter(json!({ "scrapes": {} }));
        let addr = serve_with(exporter.clone(), short_timeouts()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET /metrics HTTP/1.1\r\n").await.unwrap();

        let mut rest = Vec::new();
        let closed = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest)).await;
        assert!(closed.is_ok(), "server kept a stalled connection open");

        let text = String::from_utf8(exporter.manager().registry().render()).unwrap();
        assert!(!text.contains("scrapes{"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fails_a_stalled_read() {
        let (local, _remote) = tokio::io::duplex(64);
        let mut stream = DeadlineStream::new(local, Duration::from_secs(1));

        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fails_a_stalled_write() {
        let (local, _remote) = tokio::io::duplex(4);
        let mut stream = DeadlineStream::new(local, Duration::from_secs(1));

        let err = stream.write_all(&[0u8; 16]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_restarts_after_progress() {
        let (local, mut remote) = tokio::io::duplex(64);
        let mut stream = DeadlineStream::new(local, Duration::from_secs(1));

        tokio::spawn(async move {
            for byte in b"abc" {
                tokio::time::sleep(Duration::from_millis(700)).await;
                remote.write_all(&[*byte]).await.unwrap();
            }
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[tokio::test]
    async fn concurrent_scrapes_are_serialized() {
        let exporter = exporter(json!({ "scrapes": {} }));
        let scrapes = (0..8).map(|_| {
            let exporter = exporter.clone();
            tokio::spawn(async move { exporter.scrape().await.unwrap() })
        });
        for scrape in scrapes.collect::<Vec<_>>() {
            scrape.await.unwrap();
        }
        let text = String::from_utf8(exporter.manager().registry().render()).unwrap();
        assert!(text.contains("scrapes{path=\"/metrics\"} 8.0\n"));
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let exporter = exporter(json!({}));
        let first = MetricsServer::bind("127.0.0.1:0".parse().unwrap(), exporter.clone(), ServerConfig::default())
            .await
            .unwrap();
        let taken = first.local_addr().unwrap();
        let second = MetricsServer::bind(taken, exporter, ServerConfig::default()).await;
        assert!(matches!(second, Err(ServerError::Bind { .. })));
    }
}
