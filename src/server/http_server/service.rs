//! 请求服务
//!
//! 每个连接一个 `ConduitService`，hyper 为每个请求调用一次：
//! 解码限制检查、路由分发、H2C 升级、WebSocket 握手，
//! 响应体结束（或中止）时写访问日志和指标。

use std::borrow::Cow;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::header::{HeaderValue, ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, SERVER, UPGRADE};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode, Version};
use hyper_util::rt::TokioIo;
use pin_project_lite::pin_project;
use tokio::sync::oneshot;

use crate::common::path_params::percent_decode_path;
use crate::compression::CompressionConfig;
use crate::error::{DecoderLimit, RatError, RatResult};
use crate::server::access_log::{AccessLogEmitter, AccessLogRecord};
use crate::server::config::{DecoderLimits, ServerConfig};
use crate::server::h2c_upgrade::{
    buffer_limit, buffer_response, check_upgrade, encode_stream1_response, request_has_body, wants_h2c, Buffered,
    ClientSettings, H2cUpgradeIo, PrefixedBody, Stream1Response,
};
use crate::server::http_request::{client_ip, HttpRequest, ParsedRequestLine, Protocol};
use crate::server::metrics::{MetricEvent, MetricsEmitter};
use crate::server::protocol_negotiator::ProtocolNegotiator;
use crate::server::response_writer::{error_body, ResponseContext, ResponseWriter, SERVER_NAME};
use crate::server::router::{Handler, RouteHandler, RouteMatch, RouteTable};
use crate::server::secure_transport::{BoxedIo, SecureTransport};
use crate::server::streaming::{ChannelBody, InboundStats, StreamChannel, pump_incoming};
use crate::server::websocket::{h1_handshake, h2_handshake, handshake_rejection, is_websocket_request, WebSocketSession};
use crate::utils::logger::{debug, error, warn};

use super::http_connection::serve_h2;

/// 统一的响应体类型
pub type ResBody = BoxBody<Bytes, RatError>;

pub fn full_body(data: impl Into<Bytes>) -> ResBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> ResBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// JSON 错误响应，`close` 为 true 时要求 HTTP/1.1 连接在响应后关闭
pub fn error_response(status: StatusCode, message: &str, close: bool) -> Response<ResBody> {
    let mut response = Response::new(full_body(error_body(status, message)));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(SERVER, HeaderValue::from_static(SERVER_NAME));
    if close {
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
    }
    response
}

/// 在分发前检查请求行、请求头和声明的请求体长度
pub fn check_decoder_limits<B>(req: &Request<B>, limits: &DecoderLimits) -> RatResult<()> {
    let target_len = req.uri().path_and_query().map(|p| p.as_str().len()).unwrap_or(1);
    // METHOD SP request-target SP HTTP/1.1
    let line_len = req.method().as_str().len() + 1 + target_len + 1 + 8;
    if line_len > limits.max_initial_line_length {
        return Err(RatError::DecoderLimitExceeded {
            limit: DecoderLimit::InitialLine,
            max: limits.max_initial_line_length as u64,
            actual: line_len as u64,
        });
    }

    let header_size: usize = req.headers().iter().map(|(k, v)| k.as_str().len() + v.len() + 4).sum();
    if header_size > limits.max_header_size {
        return Err(RatError::DecoderLimitExceeded {
            limit: DecoderLimit::HeaderSize,
            max: limits.max_header_size as u64,
            actual: header_size as u64,
        });
    }

    if let Some(max) = limits.max_content_length {
        let declared = req
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(len) = declared.filter(|len| *len > max) {
            return Err(RatError::DecoderLimitExceeded { limit: DecoderLimit::ContentLength, max, actual: len });
        }
    }
    Ok(())
}

/// 所有连接共享的服务器状态，绑定后只读
pub struct ServerContext {
    pub config: Arc<ServerConfig>,
    pub routes: Arc<RouteTable>,
    pub compression: Arc<CompressionConfig>,
    pub secure_transport: Option<Arc<dyn SecureTransport>>,
    pub access_log: Option<AccessLogEmitter>,
    pub metrics: Option<MetricsEmitter>,
}

/// 连接活跃度，供空闲检测使用
#[derive(Debug)]
pub struct Activity {
    started: Instant,
    last_millis: AtomicU64,
    in_flight: AtomicUsize,
}

impl Activity {
    pub fn new() -> Self {
        Self { started: Instant::now(), last_millis: AtomicU64::new(0), in_flight: AtomicUsize::new(0) }
    }

    fn now_millis(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn touch(&self) {
        self.last_millis.store(self.now_millis(), Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// 标记一个进行中的请求，令牌丢弃时结束
    pub fn hold(self: &Arc<Self>) -> ActivityHold {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        self.touch();
        ActivityHold { activity: self.clone() }
    }

    /// 没有进行中的请求且空闲超过 `idle` 时返回
    pub async fn idle_expired(&self, idle: Duration) {
        let idle_ms = (idle.as_millis() as u64).max(1);
        loop {
            let since = self.now_millis().saturating_sub(self.last_millis.load(Ordering::Relaxed));
            let wait = if self.in_flight() > 0 {
                idle_ms
            } else if since >= idle_ms {
                return;
            } else {
                idle_ms - since
            };
            tokio::time::sleep(Duration::from_millis(wait.max(10))).await;
        }
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct ActivityHold {
    activity: Arc<Activity>,
}

impl Drop for ActivityHold {
    fn drop(&mut self) {
        self.activity.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.activity.touch();
    }
}

/// 单个连接的上下文
pub struct ConnectionContext {
    pub server: Arc<ServerContext>,
    pub remote_addr: SocketAddr,
    pub secure: bool,
    negotiator: Mutex<ProtocolNegotiator>,
    activity: Arc<Activity>,
}

impl ConnectionContext {
    pub fn new(server: Arc<ServerContext>, remote_addr: SocketAddr, secure: bool, negotiator: ProtocolNegotiator) -> Self {
        Self {
            server,
            remote_addr,
            secure,
            negotiator: Mutex::new(negotiator),
            activity: Arc::new(Activity::new()),
        }
    }

    /// 协商器只在同步代码中短暂加锁，不跨越 await
    pub fn negotiator(&self) -> MutexGuard<'_, ProtocolNegotiator> {
        self.negotiator.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn activity(&self) -> &Arc<Activity> {
        &self.activity
    }

    fn config(&self) -> &ServerConfig {
        &self.server.config
    }
}

/// 请求完成守卫：响应体结束、出错或被丢弃时恰好发射一次访问日志和指标
pub struct CompletionGuard {
    conn: Arc<ConnectionContext>,
    method: String,
    path: String,
    raw_target: String,
    protocol: Protocol,
    remote_host: String,
    route_template: Option<String>,
    status: Option<StatusCode>,
    bytes_sent: u64,
    inbound: Option<Arc<InboundStats>>,
    started: Instant,
    head_at: Option<Instant>,
    completed: bool,
    head_only: bool,
    _hold: ActivityHold,
}

impl CompletionGuard {
    fn new<B>(conn: Arc<ConnectionContext>, req: &Request<B>, started: Instant) -> Self {
        let remote_host = client_ip(req.headers(), conn.remote_addr, conn.config().trust_forwarded_headers).to_string();
        let hold = conn.activity.hold();
        Self {
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
            raw_target: req.uri().path_and_query().map(|p| p.to_string()).unwrap_or_else(|| "/".to_string()),
            protocol: Protocol::from_version(req.version()),
            remote_host,
            route_template: None,
            status: None,
            bytes_sent: 0,
            inbound: None,
            started,
            head_at: None,
            completed: false,
            head_only: req.method() == Method::HEAD,
            _hold: hold,
            conn,
        }
    }

    /// 用观察包装替换响应体
    fn observe(mut self, response: Response<ResBody>) -> Response<ResBody> {
        if self.status.is_none() {
            self.status = Some(response.status());
        }
        self.head_at.get_or_insert_with(Instant::now);
        if self.conn.config().wiretap {
            debug!(
                "🔬 [Wiretap] {} <- {} {:?} {:?}",
                self.conn.remote_addr,
                response.status(),
                response.version(),
                response.headers()
            );
        }
        let (parts, body) = response.into_parts();
        if body.is_end_stream() || self.head_only {
            self.completed = true;
        }
        Response::from_parts(parts, ObservedBody { inner: body, guard: Some(self) }.boxed())
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let status = self.status.map(|s| s.as_u16()).unwrap_or(500);
        let total_time = self.started.elapsed();
        let send_time = self.head_at.map(|t| t.elapsed()).unwrap_or_default();
        let receive_time = self
            .inbound
            .as_ref()
            .and_then(|s| s.finished_micros())
            .map(Duration::from_micros)
            .unwrap_or_default();
        let bytes_received = self.inbound.as_ref().map(|s| s.bytes()).unwrap_or(0);
        let server = &self.conn.server;

        if !self.completed {
            debug!(
                "🔌 [Conduit] {} {} 响应体未完整发送 (已发送 {} 字节)",
                self.method, self.raw_target, self.bytes_sent
            );
        }

        if let Some(access_log) = &server.access_log {
            access_log.emit(AccessLogRecord {
                remote_host: std::mem::take(&mut self.remote_host),
                timestamp: AccessLogRecord::now_timestamp(),
                method: self.method.clone(),
                path: std::mem::take(&mut self.raw_target),
                protocol: self.protocol.as_str(),
                status,
                bytes_sent: self.bytes_sent,
                bytes_received,
                receive_time,
                send_time,
                total_time,
            });
        }

        if let Some(metrics) = &server.metrics {
            let uri = metrics.uri_tag(self.route_template.as_deref(), &self.path);
            metrics.emit(MetricEvent {
                uri,
                method: std::mem::take(&mut self.method),
                status,
                bytes_sent: self.bytes_sent,
                bytes_received,
                receive_time,
                send_time,
                total_time,
                aborted: !self.completed,
            });
        }
    }
}

pin_project! {
    /// 统计发送字节并在结束时释放完成守卫
    pub struct ObservedBody {
        #[pin]
        inner: ResBody,
        guard: Option<CompletionGuard>,
    }
}

impl Body for ObservedBody {
    type Data = Bytes;
    type Error = RatError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let polled = this.inner.poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let (Some(guard), Some(data)) = (this.guard.as_mut(), frame.data_ref()) {
                    guard.bytes_sent += data.len() as u64;
                }
            }
            Poll::Ready(Some(Err(e))) => {
                if e.is_disconnect() {
                    debug!("🔌 [Conduit] 响应体中止: {}", e);
                } else {
                    warn!("⚠️ [Conduit] 响应体中止: {}", e);
                }
                this.guard.take();
            }
            Poll::Ready(None) => {
                if let Some(mut guard) = this.guard.take() {
                    guard.completed = true;
                }
            }
            Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// 调用处理器并等待响应头；处理器未提交就结束时生成错误响应
async fn run_handler(
    handler: Arc<dyn Handler>,
    request: HttpRequest,
    ctx: ResponseContext,
) -> Result<Response<ChannelBody>, Response<ResBody>> {
    let (mut writer, head) = ResponseWriter::new(ctx);
    let pending = writer.hand_off_on_drop();
    let (done_tx, done_rx) = oneshot::channel::<RatResult<()>>();
    let label = format!("{} {}", request.method(), request.raw_path());

    tokio::spawn(async move {
        let result = handler.call(request, writer).await;
        // 已提交但未 finish 的响应体：成功返回视为正常结束，出错则中止
        if let Ok(body) = pending.await {
            match &result {
                Ok(()) => {
                    if let Err(e) = body.finish().await {
                        debug!("🔌 [Conduit] {} 收尾响应体失败: {}", label, e);
                    }
                }
                Err(e) => body.abort(format!("处理器错误: {}", e)),
            }
        }
        if let Err(e) = &result {
            if e.is_disconnect() {
                debug!("🔌 [Conduit] {} 客户端已断开: {}", label, e);
            } else {
                error!("❌ [Conduit] {} 处理器错误: {}", label, e);
            }
        }
        let _ = done_tx.send(result);
    });

    match head.await {
        Ok(response) => Ok(response),
        Err(_) => Err(match done_rx.await {
            Ok(Err(e)) => error_response(e.status_code(), &e.to_string(), false),
            Ok(Ok(())) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "处理器未产生响应", false),
            Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "处理器异常终止", false),
        }),
    }
}

fn is_event_stream<B>(response: &Response<B>) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"))
}

/// hyper 服务
#[derive(Clone)]
pub struct ConduitService {
    conn: Arc<ConnectionContext>,
}

impl ConduitService {
    pub fn new(conn: Arc<ConnectionContext>) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Arc<ConnectionContext> {
        &self.conn
    }

    fn response_context(&self, method: &Method, path: &str, accept_encoding: Option<String>) -> ResponseContext {
        let config = self.conn.config();
        ResponseContext::new(method.clone(), path)
            .accept_encoding(accept_encoding)
            .compression(self.conn.server.compression.clone())
            .flush_policy(config.stream.flush_policy())
            .channel(config.stream.channel_capacity, config.stream.initial_credit)
    }

    /// 构造处理器看到的请求并启动请求体泵
    fn build_request(
        &self,
        req: Request<Incoming>,
        decoded_path: String,
        route: &RouteMatch,
        started: Instant,
        pump_body: bool,
    ) -> (HttpRequest, Arc<InboundStats>) {
        let config = self.conn.config();
        let (parts, body) = req.into_parts();
        let line = ParsedRequestLine::new(parts.method, &parts.uri, parts.headers, parts.version, decoded_path);
        let (producer, consumer) = StreamChannel::new(config.stream.channel_capacity, 0);
        let stats = Arc::new(InboundStats::default());

        if pump_body {
            tokio::spawn(pump_incoming(body, producer, config.limits.max_chunk_size, stats.clone(), started));
        } else {
            producer.close();
        }

        let request = HttpRequest::new(line, self.conn.remote_addr, consumer)
            .with_route(route.params.clone(), &route.template)
            .with_limits(
                config.stream.initial_credit,
                config.limits.max_content_length,
                config.trust_forwarded_headers,
            );
        (request, stats)
    }

    async fn handle(self, req: Request<Incoming>) -> Response<ResBody> {
        let started = Instant::now();
        let is_h1 = matches!(req.version(), Version::HTTP_09 | Version::HTTP_10 | Version::HTTP_11);
        let guard = CompletionGuard::new(self.conn.clone(), &req, started);
        let config = self.conn.server.config.clone();

        if config.wiretap {
            debug!(
                "🔬 [Wiretap] {} -> {} {} {:?} {:?}",
                self.conn.remote_addr,
                req.method(),
                req.uri(),
                req.version(),
                req.headers()
            );
        }

        if let Err(e) = check_decoder_limits(&req, &config.limits) {
            warn!("🚫 [Conduit] {} 拒绝请求: {}", self.conn.remote_addr, e);
            return guard.observe(error_response(e.status_code(), &e.to_string(), is_h1));
        }

        let Some(decoded) = percent_decode_path(req.uri().path()).map(Cow::into_owned) else {
            return guard.observe(error_response(StatusCode::BAD_REQUEST, "无效的请求路径编码", is_h1));
        };

        if is_websocket_request(&req) {
            return self.handle_websocket(req, decoded, guard, is_h1).await;
        }

        if is_h1 {
            let enabled = self.conn.negotiator().enabled();
            if enabled.h2c && wants_h2c(req.headers()) {
                match check_upgrade(req.headers(), request_has_body(req.headers())) {
                    Ok(settings) => {
                        let began = self.conn.negotiator().begin_h2c_upgrade();
                        match began {
                            Ok(_) => return self.handle_h2c_upgrade(req, decoded, settings, guard).await,
                            Err(e) => debug!("🔀 [H2C] 忽略升级请求: {}", e),
                        }
                    }
                    Err(e) => debug!("🔀 [H2C] 升级条件不满足，按 HTTP/1.1 处理: {}", e),
                }
            }
            if enabled.h2c_only() {
                let mut response = error_response(StatusCode::UPGRADE_REQUIRED, "仅支持 HTTP/2 (h2c)", false);
                response.headers_mut().insert(UPGRADE, HeaderValue::from_static("h2c"));
                response.headers_mut().insert(CONNECTION, HeaderValue::from_static("Upgrade"));
                return guard.observe(response);
            }
        }

        self.handle_http(req, decoded, guard, started).await
    }

    fn not_found(&self, method: &Method, path: &str, close: bool) -> Response<ResBody> {
        let err = RatError::RouteNotFound { method: method.to_string(), path: path.to_string() };
        error_response(err.status_code(), &err.to_string(), close)
    }

    async fn handle_http(
        &self,
        req: Request<Incoming>,
        decoded: String,
        mut guard: CompletionGuard,
        started: Instant,
    ) -> Response<ResBody> {
        let method = req.method().clone();
        let Some(route) = self.conn.server.routes.dispatch(&method, &decoded, false) else {
            return guard.observe(self.not_found(&method, &decoded, false));
        };
        let RouteHandler::Http(handler) = route.handler.clone() else {
            return guard.observe(error_response(StatusCode::INTERNAL_SERVER_ERROR, "路由类型不匹配", false));
        };
        guard.route_template = Some(route.template.clone());

        let accept_encoding = req.headers().get(ACCEPT_ENCODING).and_then(|v| v.to_str().ok()).map(str::to_string);
        let ctx = self.response_context(&method, &decoded, accept_encoding);
        let (request, stats) = self.build_request(req, decoded, &route, started, true);
        guard.inbound = Some(stats);

        match run_handler(handler, request, ctx).await {
            Ok(response) => guard.observe(response.map(|b| b.boxed())),
            Err(response) => guard.observe(response),
        }
    }

    async fn handle_websocket(
        &self,
        mut req: Request<Incoming>,
        decoded: String,
        mut guard: CompletionGuard,
        is_h1: bool,
    ) -> Response<ResBody> {
        let method = req.method().clone();
        let Some(route) = self.conn.server.routes.dispatch(&method, &decoded, true) else {
            return guard.observe(self.not_found(&method, &decoded, false));
        };
        let RouteHandler::WebSocket(handler) = route.handler.clone() else {
            return guard.observe(error_response(StatusCode::INTERNAL_SERVER_ERROR, "路由类型不匹配", false));
        };
        guard.route_template = Some(route.template.clone());

        let handshake = if is_h1 { h1_handshake(req.headers()) } else { h2_handshake(req.headers()) };
        let headers = match handshake {
            Ok(headers) => headers,
            Err(e) => {
                debug!("🚫 [WebSocket] {} 握手失败: {}", self.conn.remote_addr, e);
                let (parts, ()) = handshake_rejection(&e).into_parts();
                return guard.observe(Response::from_parts(parts, empty_body()));
            }
        };

        let on_upgrade = hyper::upgrade::on(&mut req);
        let (request, _) = self.build_request(req, decoded, &route, guard.started, false);
        let config = self.conn.config();
        let (capacity, window) = (config.stream.channel_capacity, config.stream.initial_credit);
        let hold = self.conn.activity.hold();
        let remote_addr = self.conn.remote_addr;

        tokio::spawn(async move {
            let _hold = hold;
            match on_upgrade.await {
                Ok(upgraded) => {
                    let session = WebSocketSession::start(TokioIo::new(upgraded), capacity, window).await;
                    if let Err(e) = handler.call(request, session).await {
                        if e.is_disconnect() {
                            debug!("🔌 [WebSocket] {} 会话结束: {}", remote_addr, e);
                        } else {
                            error!("❌ [WebSocket] {} 处理器错误: {}", remote_addr, e);
                        }
                    }
                }
                Err(e) => debug!("🔌 [WebSocket] {} 升级失败: {}", remote_addr, e),
            }
        });

        let mut response = Response::new(empty_body());
        *response.status_mut() = if is_h1 { StatusCode::SWITCHING_PROTOCOLS } else { StatusCode::OK };
        *response.headers_mut() = headers;
        guard.observe(response)
    }

    fn decline_upgrade(&self, reason: &str) {
        debug!("🔀 [H2C] {} 拒绝升级: {}", self.conn.remote_addr, reason);
        let aborted = self.conn.negotiator().abort_h2c_upgrade();
        if let Err(e) = aborted {
            warn!("⚠️ [H2C] 回退到 HTTP/1.1 失败: {}", e);
        }
    }

    async fn handle_h2c_upgrade(
        &self,
        mut req: Request<Incoming>,
        decoded: String,
        settings: ClientSettings,
        mut guard: CompletionGuard,
    ) -> Response<ResBody> {
        let method = req.method().clone();
        let Some(route) = self.conn.server.routes.dispatch(&method, &decoded, false) else {
            self.decline_upgrade("路由未命中");
            return guard.observe(self.not_found(&method, &decoded, false));
        };
        let RouteHandler::Http(handler) = route.handler.clone() else {
            self.decline_upgrade("路由类型不匹配");
            return guard.observe(error_response(StatusCode::INTERNAL_SERVER_ERROR, "路由类型不匹配", false));
        };
        guard.route_template = Some(route.template.clone());

        let on_upgrade = hyper::upgrade::on(&mut req);
        let accept_encoding = req.headers().get(ACCEPT_ENCODING).and_then(|v| v.to_str().ok()).map(str::to_string);
        let ctx = self.response_context(&method, &decoded, accept_encoding);
        let (request, stats) = self.build_request(req, decoded, &route, guard.started, true);
        guard.inbound = Some(stats);

        let response = match run_handler(handler, request, ctx).await {
            Ok(response) => response,
            Err(response) => {
                self.decline_upgrade("处理器未提交响应");
                return guard.observe(response);
            }
        };

        if is_event_stream(&response) {
            self.decline_upgrade("SSE 响应不缓冲");
            return guard.observe(response.map(|b| b.boxed()));
        }

        let (parts, mut body) = response.into_parts();
        let limit = buffer_limit(&settings, self.conn.config().h2c_upgrade_buffer_limit);
        let (frames, error) = match buffer_response(&mut body, limit).await {
            Buffered::Complete { data, trailers } => {
                match encode_stream1_response(parts.status, &parts.headers, &data, trailers.as_ref()) {
                    Ok(stream1) => {
                        let completed = self.conn.negotiator().complete_h2c_upgrade();
                        if let Err(e) = completed {
                            warn!("⚠️ [H2C] 升级状态异常: {}", e);
                        }
                        guard.status = Some(parts.status);
                        guard.bytes_sent = stream1.data_len;
                        self.spawn_upgraded_h2(on_upgrade, stream1);

                        let mut switching = Response::new(empty_body());
                        *switching.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
                        switching.headers_mut().insert(CONNECTION, HeaderValue::from_static("Upgrade"));
                        switching.headers_mut().insert(UPGRADE, HeaderValue::from_static("h2c"));
                        return guard.observe(switching);
                    }
                    Err(e) => {
                        self.decline_upgrade(&e.to_string());
                        let mut frames: VecDeque<Frame<Bytes>> = data.into_iter().map(Frame::data).collect();
                        if let Some(trailers) = trailers {
                            frames.push_back(Frame::trailers(trailers));
                        }
                        (frames, None)
                    }
                }
            }
            Buffered::Overflow { frames, error } => {
                self.decline_upgrade(&format!("响应超过缓冲上限 {} 字节", limit));
                (frames, error)
            }
        };

        let body = PrefixedBody::new(frames, error, body).boxed();
        guard.observe(Response::from_parts(parts, body))
    }

    fn spawn_upgraded_h2(&self, on_upgrade: hyper::upgrade::OnUpgrade, stream1: Stream1Response) {
        let service = self.clone();
        let remote_addr = self.conn.remote_addr;
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    debug!("🚀 [H2C] {} 升级完成，注入 stream 1 ({} 字节)", remote_addr, stream1.data_len);
                    let io: BoxedIo = Box::new(H2cUpgradeIo::new(TokioIo::new(upgraded), stream1));
                    if let Err(e) = serve_h2(io, service).await {
                        if e.is_disconnect() {
                            debug!("🔌 [H2C] {} 连接结束: {}", remote_addr, e);
                        } else {
                            error!("❌ [H2C] {} HTTP/2 连接处理失败: {}", remote_addr, e);
                        }
                    }
                }
                Err(e) => debug!("🔌 [H2C] {} 升级失败: {}", remote_addr, e),
            }
        });
    }
}

impl Service<Request<Incoming>> for ConduitService {
    type Response = Response<ResBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.handle(req).await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(target: &str) -> Request<()> {
        Request::builder().method(Method::GET).uri(target).body(()).unwrap()
    }

    #[test]
    fn test_initial_line_limit() {
        let limits = DecoderLimits { max_initial_line_length: 32, ..Default::default() };
        assert!(check_decoder_limits(&request("/short"), &limits).is_ok());

        let err = check_decoder_limits(&request(&format!("/{}", "a".repeat(64))), &limits).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::URI_TOO_LONG);
    }

    #[test]
    fn test_header_size_limit() {
        let limits = DecoderLimits { max_header_size: 64, ..Default::default() };
        let mut req = request("/");
        req.headers_mut().insert("x-big", HeaderValue::from_str(&"v".repeat(100)).unwrap());
        let err = check_decoder_limits(&req, &limits).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
    }

    #[test]
    fn test_content_length_limit() {
        let limits = DecoderLimits { max_content_length: Some(10), ..Default::default() };
        let mut req = request("/");
        req.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from_static("11"));
        let err = check_decoder_limits(&req, &limits).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_error_response_shape() {
        let response = error_response(StatusCode::NOT_FOUND, "nope", true);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[CONNECTION], "close");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], 404);
        assert_eq!(json["error"], "nope");
    }

    #[tokio::test]
    async fn test_idle_waits_for_in_flight() {
        let activity = Arc::new(Activity::new());
        let hold = activity.hold();
        let idle = activity.idle_expired(Duration::from_millis(20));
        tokio::pin!(idle);
        assert!(tokio::time::timeout(Duration::from_millis(60), idle.as_mut()).await.is_err());
        drop(hold);
        assert!(tokio::time::timeout(Duration::from_millis(500), idle).await.is_ok());
    }
}
