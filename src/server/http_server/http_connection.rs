//! 连接处理模块
//!
//! 嗅探前言、完成 TLS 握手与 ALPN 协商，然后交给 hyper 的 HTTP/1.1 或 HTTP/2 连接。
//! 连接空闲超过配置时间后优雅关闭。

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::net::TcpStream;

use crate::error::{RatError, RatResult};
use crate::server::ReconstructedStream;
use crate::server::protocol_detector::{sniff_preface, Preface};
use crate::server::protocol_negotiator::{NegotiationState, ProtocolNegotiator};
use crate::server::secure_transport::BoxedIo;
use crate::utils::logger::{debug, error, info, preview_bytes, warn};

use super::service::{Activity, ConduitService, ConnectionContext, ServerContext};

type ConnIo = TokioIo<BoxedIo>;

/// 可以优雅关闭的 hyper 连接
trait GracefulConnection: Future<Output = Result<(), hyper::Error>> {
    fn begin_shutdown(self: Pin<&mut Self>);
}

impl GracefulConnection for http1::UpgradeableConnection<ConnIo, ConduitService> {
    fn begin_shutdown(self: Pin<&mut Self>) {
        self.graceful_shutdown();
    }
}

impl GracefulConnection for http2::Connection<ConnIo, ConduitService, TokioExecutor> {
    fn begin_shutdown(self: Pin<&mut Self>) {
        self.graceful_shutdown();
    }
}

/// 驱动连接直到结束；空闲超时后发起优雅关闭并继续驱动到完成
async fn drive<C: GracefulConnection>(
    conn: C,
    activity: Arc<Activity>,
    idle: Duration,
    remote_addr: SocketAddr,
) -> RatResult<()> {
    let mut conn = std::pin::pin!(conn);
    let mut closing = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => return result.map_err(RatError::from),
            _ = activity.idle_expired(idle), if !closing => {
                debug!("⏱️ [Conduit] {} 空闲超过 {:?}，关闭连接", remote_addr, idle);
                conn.as_mut().begin_shutdown();
                closing = true;
            }
        }
    }
}

/// 以 HTTP/1.1 服务连接，支持 WebSocket 与 h2c 升级
pub async fn serve_h1(io: BoxedIo, service: ConduitService) -> RatResult<()> {
    let conn_ctx = service.connection().clone();
    let config = conn_ctx.server.config.clone();

    let mut builder = http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(config.timeouts.header_read)
        .max_buf_size(config.limits.h1_max_buf_size())
        .keep_alive(true);

    let conn = builder.serve_connection(TokioIo::new(io), service).with_upgrades();
    drive(conn, conn_ctx.activity().clone(), config.timeouts.idle, conn_ctx.remote_addr).await
}

/// 以 HTTP/2 服务连接（ALPN、先验知识或 h2c 升级之后）
pub async fn serve_h2(io: BoxedIo, service: ConduitService) -> RatResult<()> {
    let conn_ctx = service.connection().clone();
    let config = conn_ctx.server.config.clone();

    let mut builder = http2::Builder::new(TokioExecutor::new());
    builder
        .timer(TokioTimer::new())
        .keep_alive_interval(Some(config.timeouts.idle))
        .keep_alive_timeout(config.timeouts.handshake)
        .max_header_list_size(config.limits.max_header_size.min(u32::MAX as usize) as u32)
        .enable_connect_protocol();

    let conn = builder.serve_connection(TokioIo::new(io), service);
    drive(conn, conn_ctx.activity().clone(), config.timeouts.idle, conn_ctx.remote_addr).await
}

/// 处理一个新接受的 TCP 连接
pub async fn serve_connection(mut stream: TcpStream, remote_addr: SocketAddr, server: Arc<ServerContext>) -> RatResult<()> {
    let config = server.config.clone();
    let (preface, prefix) = sniff_preface(&mut stream, config.timeouts.handshake).await?;
    if config.wiretap {
        debug!("🔬 [Wiretap] {} 前言 {:?}: {}", remote_addr, preface, preview_bytes(&prefix, 64));
    }

    let io: BoxedIo = Box::new(ReconstructedStream::new(stream, prefix));
    let mut negotiator = ProtocolNegotiator::new(config.enabled_protocols());

    let (io, secure) = match (preface, server.secure_transport.clone()) {
        (Preface::Tls, Some(transport)) => {
            let accepted = tokio::time::timeout(config.timeouts.handshake, transport.accept(io))
                .await
                .map_err(|_| RatError::Tls(format!("TLS 握手超时 ({:?})", config.timeouts.handshake)))?;
            let (tls_io, alpn) = accepted?;
            negotiator.on_alpn(alpn.as_deref())?;
            (tls_io, true)
        }
        (Preface::Tls, None) => {
            return Err(RatError::Protocol("未配置安全传输，拒绝 TLS 连接".to_string()));
        }
        (_, Some(_)) => {
            return Err(RatError::Protocol("已启用 TLS，拒绝明文连接".to_string()));
        }
        (other, None) => {
            negotiator.on_preface(other)?;
            (io, false)
        }
    };

    let state = negotiator.state();
    debug!("🔀 [Conduit] {} 协商结果 {:?}", remote_addr, state);
    let service = ConduitService::new(Arc::new(ConnectionContext::new(server, remote_addr, secure, negotiator)));

    match state {
        NegotiationState::H2Active { .. } => serve_h2(io, service).await,
        NegotiationState::Http1Active => serve_h1(io, service).await,
        other => {
            warn!("🚫 [Conduit] {} 协商状态 {:?} 无法服务", remote_addr, other);
            Err(RatError::Protocol(format!("协商状态 {:?} 无法服务", other)))
        }
    }
}

/// 记录连接结束原因：客户端断开只记调试日志
pub fn log_connection_result(remote_addr: SocketAddr, result: &RatResult<()>) {
    match result {
        Ok(()) => debug!("👋 [Conduit] {} 连接结束", remote_addr),
        Err(e) if e.is_disconnect() => debug!("🔌 [Conduit] {} 客户端断开: {}", remote_addr, e),
        Err(RatError::Protocol(msg)) => info!("🚫 [Conduit] {} 连接被拒绝: {}", remote_addr, msg),
        Err(e) => error!("❌ [Conduit] {} 连接处理失败: {}", remote_addr, e),
    }
}
