//! RAT Conduit 服务器模块
//!
//! 监听端口、接受连接，每个连接一个任务，由 `http_server` 完成协议协商和请求服务

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;

use crate::error::RatResult;
use crate::utils::crypto_provider::ensure_crypto_provider_installed;
use crate::utils::logger::{debug, error, info, warn};

pub mod access_log;
pub mod config;
pub mod h2c_upgrade;
pub mod http_request;
pub mod http_server;
pub mod metrics;
pub mod protocol_detector;
pub mod protocol_negotiator;
pub mod response_writer;
pub mod router;
pub mod secure_transport;
pub mod static_files;
pub mod streaming;
pub mod websocket;

pub use access_log::{AccessLogEmitter, AccessLogRecord, AccessLogSink, LoggerSink};
pub use config::{DecoderLimits, ServerConfig, ServerConfigBuilder, StreamSettings, Timeouts};
pub use http_request::{HttpRequest, Protocol};
pub use http_server::ServerContext;
pub use metrics::{AtomicMetricsRegistry, MetricEvent, MetricsEmitter, MetricsRecorder, QueuedRecorder, UriTemplater};
pub use protocol_negotiator::{EnabledProtocols, ProtocolKind};
pub use response_writer::{ResponseWriter, SseWriter};
pub use router::{handler_fn, ws_handler_fn, Handler, RouteKind, RouteTable, RouteTableBuilder, WsHandler};
pub use secure_transport::{RustlsTransport, SecureTransport};
pub use static_files::StaticFiles;
pub use websocket::{WebSocketSession, WsMessage};

/// 重新构造的流：先吐出嗅探时预读的字节，再读原始连接
pub struct ReconstructedStream<S = TcpStream> {
    inner: S,
    prefix: Bytes,
}

impl<S> ReconstructedStream<S> {
    pub fn new(stream: S, prefix: impl Into<Bytes>) -> Self {
        Self { inner: stream, prefix: prefix.into() }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReconstructedStream<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReconstructedStream<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// 服务器构建入口
pub struct Server {
    config: ServerConfig,
    routes: RouteTable,
    secure_transport: Option<Arc<dyn SecureTransport>>,
    access_log_sink: Option<Arc<dyn AccessLogSink>>,
    metrics_recorder: Option<Arc<dyn MetricsRecorder>>,
    uri_templater: Option<UriTemplater>,
}

impl Server {
    /// 默认通过 rat_logger 写访问日志，指标写入进程内原子注册表
    pub fn new(config: ServerConfig, routes: RouteTable) -> Self {
        Self {
            config,
            routes,
            secure_transport: None,
            access_log_sink: Some(Arc::new(LoggerSink)),
            metrics_recorder: Some(Arc::new(AtomicMetricsRegistry::new())),
            uri_templater: None,
        }
    }

    pub fn with_secure_transport(mut self, transport: Arc<dyn SecureTransport>) -> Self {
        self.secure_transport = Some(transport);
        self
    }

    pub fn with_access_log_sink(mut self, sink: Arc<dyn AccessLogSink>) -> Self {
        self.access_log_sink = Some(sink);
        self
    }

    pub fn without_access_log(mut self) -> Self {
        self.access_log_sink = None;
        self
    }

    pub fn with_metrics(mut self, recorder: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics_recorder = Some(recorder);
        self
    }

    pub fn without_metrics(mut self) -> Self {
        self.metrics_recorder = None;
        self
    }

    /// 自定义指标 uri 标签，输入为原始请求路径
    pub fn with_uri_templater(mut self, templater: UriTemplater) -> Self {
        self.uri_templater = Some(templater);
        self
    }

    /// 校验配置并绑定监听端口
    pub async fn bind(self) -> RatResult<BoundServer> {
        let secure = self.secure_transport.is_some();
        self.config.validate_transport(secure)?;
        if secure {
            ensure_crypto_provider_installed();
        }

        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        let local_addr = listener.local_addr()?;

        let access_log = self
            .access_log_sink
            .map(|sink| AccessLogEmitter::spawn(sink, self.config.access_log_queue));
        let metrics = self.metrics_recorder.map(|recorder| {
            let emitter = MetricsEmitter::new(recorder, self.config.max_uri_tags);
            match self.uri_templater {
                Some(templater) => emitter.with_templater(templater),
                None => emitter,
            }
        });

        let enabled = self.config.enabled_protocols();
        let mut protocols = Vec::new();
        if enabled.h1 {
            protocols.push("HTTP/1.1");
        }
        if enabled.h2 && secure {
            protocols.push("HTTP/2 (TLS)");
        }
        if enabled.h2c && !secure {
            protocols.push("H2C");
        }
        let scheme = if secure { "https" } else { "http" };
        info!("🚀 [Server] RAT Conduit 监听 {}://{} (支持: {})", scheme, local_addr, protocols.join(", "));
        for (method, template, kind) in self.routes.routes() {
            info!("   {} {} ({:?})", method, template, kind);
        }

        let compression = Arc::new(self.config.compression.clone());
        let context = ServerContext {
            config: Arc::new(self.config),
            routes: Arc::new(self.routes),
            compression,
            secure_transport: self.secure_transport,
            access_log,
            metrics,
        };
        Ok(BoundServer { listener, local_addr, context: Arc::new(context) })
    }
}

/// 已绑定端口的服务器
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    context: Arc<ServerContext>,
}

impl BoundServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// 因队列满而丢弃的访问日志条数
    pub fn access_log_dropped(&self) -> u64 {
        self.context.access_log.as_ref().map(|l| l.dropped()).unwrap_or(0)
    }

    /// 一直服务直到出错
    pub async fn serve(self) -> RatResult<()> {
        self.serve_with_shutdown(std::future::pending::<()>()).await
    }

    /// 服务直到 `shutdown` 完成；已建立的连接继续在各自的任务中运行
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> RatResult<()>
    where
        F: Future<Output = ()>,
    {
        let mut shutdown = std::pin::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("⚠️ [Server] {} 设置 TCP_NODELAY 失败: {}", remote_addr, e);
                        }
                        let context = self.context.clone();
                        tokio::spawn(async move {
                            let result = http_server::serve_connection(stream, remote_addr, context).await;
                            http_server::log_connection_result(remote_addr, &result);
                        });
                    }
                    Err(e) => {
                        // 文件描述符耗尽等情况下短暂退避
                        warn!("⚠️ [Server] 接受连接失败: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                _ = shutdown.as_mut() => {
                    info!("🛑 [Server] 收到停止信号，不再接受新连接");
                    return Ok(());
                }
            }
        }
    }
}

/// 绑定并服务，直到收到 Ctrl+C
pub async fn run_server(config: ServerConfig, routes: RouteTable) -> RatResult<()> {
    let bound = Server::new(config, routes).bind().await?;
    bound
        .serve_with_shutdown(async {
            if let Err(e) = signal::ctrl_c().await {
                error!("❌ [Server] 无法监听 Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_reconstructed_stream_replays_prefix() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = ReconstructedStream::new(client, Bytes::from_static(b"GET "));
        tokio::io::AsyncWriteExt::write_all(&mut server, b"/ HTTP/1.1\r\n").await.unwrap();
        drop(server);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn test_bind_rejects_h2_without_transport() {
        let config = ServerConfig::builder().port(0).protocols(vec![ProtocolKind::H2]).build().unwrap();
        let result = Server::new(config, RouteTable::builder().build()).bind().await;
        assert!(matches!(result, Err(crate::error::RatError::Config(_))));
    }
}
