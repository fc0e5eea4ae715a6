//! 响应写出器
//!
//! 状态码和头部只能在提交前修改；第一次写出响应体时隐式提交。
//! 压缩决策在提交时计算，此后不可变。SSE 模式固定 content-type，
//! 每个事件独立刷新。

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, SERVER,
    VARY,
};
use hyper::{Method, Response, StatusCode};
use tokio::sync::oneshot;

use crate::compression::{CompressionConfig, CompressionDecision, CompressionInput, StreamEncoder};
use crate::error::{RatError, RatResult};
use crate::server::streaming::{ChannelBody, ChannelProducer, Chunk, FlushPolicy, StreamChannel};
use crate::utils::logger::debug;

/// 编码超过该字节数后让出一次调度
const YIELD_AFTER_ENCODED: usize = 64 * 1024;

/// 默认的 Server 头部
pub const SERVER_NAME: &str = concat!("RAT-Conduit/", env!("CARGO_PKG_VERSION"));

/// 提交后交给连接层的响应头
pub type ResponseHead = oneshot::Receiver<Response<ChannelBody>>;

/// 写出器所需的请求上下文
#[derive(Clone)]
pub struct ResponseContext {
    pub method: Method,
    pub path: String,
    pub accept_encoding: Option<String>,
    pub compression: Arc<CompressionConfig>,
    pub flush_policy: FlushPolicy,
    pub channel_capacity: usize,
    pub window: u64,
}

impl ResponseContext {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            accept_encoding: None,
            compression: Arc::new(CompressionConfig::disabled()),
            flush_policy: FlushPolicy::default(),
            channel_capacity: 16,
            window: 65536,
        }
    }

    pub fn accept_encoding(mut self, value: Option<String>) -> Self {
        self.accept_encoding = value;
        self
    }

    pub fn compression(mut self, config: Arc<CompressionConfig>) -> Self {
        self.compression = config;
        self
    }

    pub fn flush_policy(mut self, policy: FlushPolicy) -> Self {
        self.flush_policy = policy;
        self
    }

    pub fn channel(mut self, capacity: usize, window: u64) -> Self {
        self.channel_capacity = capacity;
        self.window = window;
        self
    }
}

/// 响应写出器
pub struct ResponseWriter {
    status: StatusCode,
    headers: HeaderMap,
    head_tx: Option<oneshot::Sender<Response<ChannelBody>>>,
    producer: ChannelProducer,
    body: Option<ChannelBody>,
    ctx: ResponseContext,
    policy: FlushPolicy,
    buffer: BytesMut,
    encoder: Option<StreamEncoder>,
    decision: Option<CompressionDecision>,
    compression_disabled: bool,
    trailers: Option<HeaderMap>,
    committed: bool,
    finished: bool,
    bytes_in: u64,
    bytes_out: u64,
    pending_tx: Option<oneshot::Sender<PendingBody>>,
}

impl ResponseWriter {
    pub fn new(ctx: ResponseContext) -> (Self, ResponseHead) {
        let (head_tx, head_rx) = oneshot::channel();
        // 首个窗口预先授予，之后由 ChannelBody 在连接可写时补充
        let (producer, consumer) = StreamChannel::new(ctx.channel_capacity, ctx.window);
        let body = ChannelBody::new(consumer, ctx.window);
        let mut headers = HeaderMap::new();
        headers.insert(SERVER, HeaderValue::from_static(SERVER_NAME));
        let writer = Self {
            status: StatusCode::OK,
            headers,
            head_tx: Some(head_tx),
            producer,
            body: Some(body),
            policy: ctx.flush_policy,
            ctx,
            buffer: BytesMut::new(),
            encoder: None,
            decision: None,
            compression_disabled: false,
            trailers: None,
            committed: false,
            finished: false,
            bytes_in: 0,
            bytes_out: 0,
            pending_tx: None,
        };
        (writer, head_rx)
    }

    /// 提交后未结束就被丢弃时，把剩余的响应体交给返回的接收端收尾，
    /// 而不是直接中止
    pub fn hand_off_on_drop(&mut self) -> oneshot::Receiver<PendingBody> {
        let (tx, rx) = oneshot::channel();
        self.pending_tx = Some(tx);
        rx
    }

    fn ensure_uncommitted(&self) -> RatResult<()> {
        if self.committed {
            Err(RatError::ResponseAlreadyCommitted)
        } else {
            Ok(())
        }
    }

    /// 设置状态码
    pub fn status(&mut self, status: StatusCode) -> RatResult<&mut Self> {
        self.ensure_uncommitted()?;
        self.status = status;
        Ok(self)
    }

    /// 设置头部（覆盖同名头部）
    pub fn header<K, V>(&mut self, name: K, value: V) -> RatResult<&mut Self>
    where
        K: TryInto<HeaderName>,
        K::Error: std::fmt::Display,
        V: TryInto<HeaderValue>,
        V::Error: std::fmt::Display,
    {
        self.ensure_uncommitted()?;
        let name = name
            .try_into()
            .map_err(|e| RatError::Handler(format!("无效的头部名: {}", e)))?;
        let value = value
            .try_into()
            .map_err(|e| RatError::Handler(format!("无效的头部值: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// 提交前的头部可变引用
    pub fn headers_mut(&mut self) -> RatResult<&mut HeaderMap> {
        self.ensure_uncommitted()?;
        Ok(&mut self.headers)
    }

    pub fn content_type(&mut self, value: &str) -> RatResult<&mut Self> {
        self.header(CONTENT_TYPE, value)
    }

    /// 声明响应体长度，阈值压缩策略据此判断
    pub fn content_length(&mut self, len: u64) -> RatResult<&mut Self> {
        self.ensure_uncommitted()?;
        self.headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        Ok(self)
    }

    /// 设置刷新策略
    pub fn flush_policy(&mut self, policy: FlushPolicy) -> RatResult<&mut Self> {
        self.ensure_uncommitted()?;
        self.policy = policy;
        Ok(self)
    }

    /// 添加尾部头，在 `finish` 时发送
    pub fn trailer<K, V>(&mut self, name: K, value: V) -> RatResult<&mut Self>
    where
        K: TryInto<HeaderName>,
        K::Error: std::fmt::Display,
        V: TryInto<HeaderValue>,
        V::Error: std::fmt::Display,
    {
        if self.finished {
            return Err(RatError::Protocol("响应已结束，不能再添加尾部头".to_string()));
        }
        let name = name
            .try_into()
            .map_err(|e| RatError::Handler(format!("无效的尾部头名: {}", e)))?;
        let value = value
            .try_into()
            .map_err(|e| RatError::Handler(format!("无效的尾部头值: {}", e)))?;
        self.trailers.get_or_insert_with(HeaderMap::new).append(name, value);
        Ok(self)
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    /// 提交时计算出的压缩决策
    pub fn compression_decision(&self) -> Option<CompressionDecision> {
        self.decision
    }

    /// 处理器写入的未压缩字节数
    pub fn bytes_written(&self) -> u64 {
        self.bytes_in
    }

    /// 下发到通道的字节数（压缩后）
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_out
    }

    /// 上游生产者可订阅的取消信号
    pub fn cancel_signal(&self) -> crate::server::streaming::CancelSignal {
        self.producer.cancel_signal()
    }

    fn declared_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }

    /// 提交响应头，`known_length` 为已知的响应体长度
    fn commit(&mut self, known_length: Option<u64>) -> RatResult<()> {
        if self.committed {
            return Ok(());
        }

        let content_length = known_length.or_else(|| self.declared_length());
        let decision = if self.compression_disabled {
            None
        } else {
            let input = CompressionInput {
                method: &self.ctx.method,
                path: &self.ctx.path,
                status: self.status,
                response_headers: &self.headers,
                content_length,
            };
            Some(self.ctx.compression.decide(&input, self.ctx.accept_encoding.as_deref()))
        };

        if let Some(decision) = decision {
            if !decision.is_identity() {
                self.encoder = Some(StreamEncoder::new(decision.encoding, self.ctx.compression.level)?);
                self.headers.remove(CONTENT_LENGTH);
                self.headers
                    .insert(CONTENT_ENCODING, HeaderValue::from_static(decision.encoding.header_value()));
                self.headers.append(VARY, HeaderValue::from_static("accept-encoding"));
                debug!("🗜️ [ResponseWriter] {} {} 使用 {} 压缩", self.ctx.method, self.ctx.path, decision.encoding);
            }
            self.decision = Some(decision);
        }

        if self.encoder.is_none() && !self.headers.contains_key(CONTENT_LENGTH) {
            if let Some(len) = known_length {
                self.headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
            }
        }

        let body = self
            .body
            .take()
            .ok_or_else(|| RatError::Protocol("响应体已被取走".to_string()))?;
        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = std::mem::take(&mut self.headers);

        self.committed = true;
        let head_tx = self
            .head_tx
            .take()
            .ok_or_else(|| RatError::Protocol("响应头已发送".to_string()))?;
        head_tx.send(response).map_err(|_| RatError::Cancelled)
    }

    /// 写出一段响应体；首次调用时提交响应头
    pub async fn write(&mut self, data: impl Into<Bytes>) -> RatResult<()> {
        let data = data.into();
        if self.finished {
            return Err(RatError::Protocol("响应已结束".to_string()));
        }
        self.commit(None)?;
        if data.is_empty() {
            return Ok(());
        }
        self.bytes_in += data.len() as u64;

        match self.encoder.as_mut() {
            Some(encoder) => {
                let out = encoder.encode(&data)?;
                self.buffer.extend_from_slice(&out);
                if data.len() >= YIELD_AFTER_ENCODED {
                    tokio::task::yield_now().await;
                }
            }
            None => self.buffer.extend_from_slice(&data),
        }

        match self.policy {
            FlushPolicy::EveryChunk => self.flush().await,
            FlushPolicy::Batch { high_watermark } => {
                if self.buffer.len() >= high_watermark {
                    self.push_buffer().await
                } else {
                    Ok(())
                }
            }
        }
    }

    /// 强制下发已缓冲的数据
    pub async fn flush(&mut self) -> RatResult<()> {
        self.commit(None)?;
        if let Some(encoder) = self.encoder.as_mut() {
            let out = encoder.flush()?;
            self.buffer.extend_from_slice(&out);
        }
        self.push_buffer().await
    }

    async fn push_buffer(&mut self) -> RatResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let bytes = self.buffer.split().freeze();
        self.bytes_out += bytes.len() as u64;
        self.producer.push(Chunk::data(bytes)).await
    }

    /// 以已知长度一次性发送响应体并结束
    pub async fn send(&mut self, body: impl Into<Bytes>) -> RatResult<()> {
        let body = body.into();
        if !self.committed {
            self.commit(Some(body.len() as u64))?;
        }
        self.write(body).await?;
        self.finish().await
    }

    /// 发送 JSON 响应
    pub async fn json<T: serde::Serialize>(&mut self, value: &T) -> RatResult<()> {
        let body = serde_json::to_vec(value).map_err(|e| RatError::Handler(format!("JSON 序列化失败: {}", e)))?;
        self.content_type("application/json")?;
        self.send(body).await
    }

    /// 结束响应，幂等
    pub async fn finish(&mut self) -> RatResult<()> {
        if self.finished {
            return Ok(());
        }
        if !self.committed {
            let len = self.declared_length().unwrap_or(0);
            self.commit(Some(len))?;
        }
        let (encoder, trailers) = (self.encoder.take(), self.trailers.take());
        self.bytes_out += finish_body(&self.producer, &mut self.buffer, encoder, trailers).await?;
        self.finished = true;
        Ok(())
    }

    /// 中止响应体，对端收不到合法的结束标记
    pub fn abort(&mut self, reason: impl Into<String>) {
        self.producer.abort(reason);
        self.finished = true;
    }

    /// 切换为 SSE 模式
    pub fn sse(mut self) -> RatResult<SseWriter> {
        self.ensure_uncommitted()?;
        self.headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        self.headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        self.headers.remove(CONTENT_LENGTH);
        self.policy = FlushPolicy::EveryChunk;
        self.compression_disabled = true;
        Ok(SseWriter { writer: self })
    }
}

impl Drop for ResponseWriter {
    fn drop(&mut self) {
        // 未提交时丢弃 head_tx，由连接层生成错误响应
        if self.finished || !self.committed {
            return;
        }
        match self.pending_tx.take() {
            Some(tx) => {
                let pending = PendingBody {
                    producer: self.producer.hand_off(),
                    buffer: self.buffer.split(),
                    encoder: self.encoder.take(),
                    trailers: self.trailers.take(),
                    settled: false,
                };
                // 接收端已不在时 PendingBody 丢弃即中止
                let _ = tx.send(pending);
            }
            None => self.producer.abort("响应未结束即被丢弃"),
        }
    }
}

/// 写出压缩尾部、剩余缓冲和尾部头后正常结束通道，返回推送的字节数
async fn finish_body(
    producer: &ChannelProducer,
    buffer: &mut BytesMut,
    encoder: Option<StreamEncoder>,
    trailers: Option<HeaderMap>,
) -> RatResult<u64> {
    if let Some(mut encoder) = encoder {
        let tail = encoder.finish()?;
        buffer.extend_from_slice(&tail);
    }
    let mut pushed = 0;
    if !buffer.is_empty() {
        let bytes = buffer.split().freeze();
        pushed = bytes.len() as u64;
        producer.push(Chunk::data(bytes)).await?;
    }
    if let Some(trailers) = trailers {
        producer.push(Chunk::Trailers(trailers)).await?;
    }
    producer.close();
    Ok(pushed)
}

/// 已提交但写出器被丢弃时剩下的响应体
///
/// 处理器正常返回时 `finish`，出错时 `abort`；两者都没发生就丢弃（例如处理器 panic）时中止
pub struct PendingBody {
    producer: ChannelProducer,
    buffer: BytesMut,
    encoder: Option<StreamEncoder>,
    trailers: Option<HeaderMap>,
    settled: bool,
}

impl PendingBody {
    pub async fn finish(mut self) -> RatResult<()> {
        let (encoder, trailers) = (self.encoder.take(), self.trailers.take());
        let result = finish_body(&self.producer, &mut self.buffer, encoder, trailers).await;
        if let Err(e) = &result {
            self.producer.abort(e.to_string());
        }
        self.settled = true;
        result.map(|_| ())
    }

    pub fn abort(mut self, reason: impl Into<String>) {
        self.producer.abort(reason);
        self.settled = true;
    }
}

impl Drop for PendingBody {
    fn drop(&mut self) {
        if !self.settled {
            self.producer.abort("处理器未正常结束");
        }
    }
}

/// JSON 错误响应体
pub fn error_body(status: StatusCode, message: &str) -> Bytes {
    let body = serde_json::json!({ "error": message, "code": status.as_u16() });
    Bytes::from(body.to_string())
}

/// SSE 写出器
pub struct SseWriter {
    writer: ResponseWriter,
}

impl SseWriter {
    /// 发送一个事件：`data: {payload}\n\n`
    pub async fn send_event(&mut self, data: &str) -> RatResult<()> {
        self.writer.write(format_event(None, data)).await
    }

    /// 发送带事件名的事件
    pub async fn send_named(&mut self, event: &str, data: &str) -> RatResult<()> {
        self.writer.write(format_event(Some(event), data)).await
    }

    /// 注释行，常用作保活
    pub async fn comment(&mut self, text: &str) -> RatResult<()> {
        self.writer.write(format!(": {}\n\n", text)).await
    }

    pub fn cancel_signal(&self) -> crate::server::streaming::CancelSignal {
        self.writer.cancel_signal()
    }

    pub async fn finish(mut self) -> RatResult<()> {
        self.writer.finish().await
    }
}

/// SSE 帧格式；多行负载每行一个 `data:` 字段
pub fn format_event(event: Option<&str>, data: &str) -> String {
    let mut out = String::with_capacity(data.len() + 16);
    if let Some(name) = event {
        out.push_str("event: ");
        out.push_str(name);
        out.push('\n');
    }
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{CompressionStrategy, CompressionType};
    use http_body_util::BodyExt;

    fn writer(ctx: ResponseContext) -> (ResponseWriter, ResponseHead) {
        ResponseWriter::new(ctx)
    }

    #[tokio::test]
    async fn test_header_mutation_after_commit_fails() {
        let (mut res, head) = writer(ResponseContext::new(Method::GET, "/"));
        res.status(StatusCode::CREATED).unwrap();
        res.write("hello").await.unwrap();
        assert!(res.is_committed());
        assert!(matches!(res.status(StatusCode::OK), Err(RatError::ResponseAlreadyCommitted)));
        assert!(matches!(res.header("x-late", "1"), Err(RatError::ResponseAlreadyCommitted)));
        assert!(matches!(res.content_length(5), Err(RatError::ResponseAlreadyCommitted)));

        let response = head.await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        res.finish().await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn test_sse_event_is_one_flushed_chunk() {
        let ctx = ResponseContext::new(Method::GET, "/events")
            .flush_policy(FlushPolicy::Batch { high_watermark: 1 << 20 });
        let (res, head) = writer(ctx);
        let mut sse = res.sse().unwrap();
        sse.send_event("ping").await.unwrap();

        let response = head.await.unwrap();
        assert_eq!(response.headers()[CONTENT_TYPE], "text/event-stream");
        let mut body = response.into_body();
        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(&frame.into_data().unwrap()[..], b"data: ping\n\n");

        sse.send_event("pong").await.unwrap();
        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(&frame.into_data().unwrap()[..], b"data: pong\n\n");
    }

    #[test]
    fn test_format_event_multiline() {
        assert_eq!(format_event(None, "ping"), "data: ping\n\n");
        assert_eq!(format_event(Some("tick"), "a\nb"), "event: tick\ndata: a\ndata: b\n\n");
    }

    #[tokio::test]
    async fn test_batch_policy_holds_until_watermark() {
        let ctx = ResponseContext::new(Method::GET, "/batch")
            .flush_policy(FlushPolicy::Batch { high_watermark: 10 });
        let (mut res, head) = writer(ctx);
        res.write("12345").await.unwrap();
        let response = head.await.unwrap();
        let mut body = response.into_body();

        res.write("67890").await.unwrap();
        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(&frame.into_data().unwrap()[..], b"1234567890");

        res.write("ab").await.unwrap();
        res.flush().await.unwrap();
        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(&frame.into_data().unwrap()[..], b"ab");
    }

    #[tokio::test]
    async fn test_drop_before_commit_releases_head() {
        let (mut res, head) = writer(ResponseContext::new(Method::GET, "/boom"));
        res.header("x-partial", "1").unwrap();
        drop(res);
        assert!(head.await.is_err(), "未提交的写出器不应发送响应头");
    }

    #[tokio::test]
    async fn test_drop_after_commit_truncates() {
        let (mut res, head) = writer(ResponseContext::new(Method::GET, "/stream"));
        res.write("partial").await.unwrap();
        res.flush().await.unwrap();
        drop(res);

        let response = head.await.unwrap();
        let result = response.into_body().collect().await;
        assert!(result.is_err(), "提交后未结束的响应体应当被中止");
    }

    #[tokio::test]
    async fn test_handed_off_body_finishes_cleanly() {
        let ctx = ResponseContext::new(Method::GET, "/w").flush_policy(FlushPolicy::Batch { high_watermark: 1024 });
        let (mut res, head) = writer(ctx);
        let pending = res.hand_off_on_drop();
        res.write("Hello ").await.unwrap();
        res.write("World!").await.unwrap();
        res.trailer("x-done", "1").unwrap();
        drop(res);

        pending.await.unwrap().finish().await.unwrap();
        let collected = head.await.unwrap().into_body().collect().await.unwrap();
        assert_eq!(collected.trailers().unwrap()["x-done"], "1");
        assert_eq!(&collected.to_bytes()[..], b"Hello World!");
    }

    #[tokio::test]
    async fn test_handed_off_body_aborts_when_dropped() {
        let (mut res, head) = writer(ResponseContext::new(Method::GET, "/w"));
        let pending = res.hand_off_on_drop();
        res.write("partial").await.unwrap();
        drop(res);
        drop(pending);

        let result = head.await.unwrap().into_body().collect().await;
        assert!(result.is_err(), "未收尾的响应体应当被中止");
    }

    #[tokio::test]
    async fn test_finished_writer_hands_off_nothing() {
        let (mut res, head) = writer(ResponseContext::new(Method::GET, "/w"));
        let pending = res.hand_off_on_drop();
        res.send("done").await.unwrap();
        drop(res);
        assert!(pending.await.is_err());
        let body = head.await.unwrap().into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"done");
    }

    #[tokio::test]
    async fn test_empty_finish_commits_zero_length() {
        let (mut res, head) = writer(ResponseContext::new(Method::GET, "/empty"));
        res.status(StatusCode::NO_CONTENT).unwrap();
        res.finish().await.unwrap();
        res.finish().await.unwrap();
        let response = head.await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(response.into_body().collect().await.unwrap().to_bytes().is_empty());
    }

    #[tokio::test]
    async fn test_never_strategy_sends_identity() {
        let config = CompressionConfig::new().strategy(CompressionStrategy::compress(false));
        let ctx = ResponseContext::new(Method::GET, "/big")
            .accept_encoding(Some("gzip, br".to_string()))
            .compression(Arc::new(config));
        let (mut res, head) = writer(ctx);
        let payload = "x".repeat(10_000);
        let sender = tokio::spawn(async move {
            res.send(payload).await.unwrap();
        });
        let response = head.await.unwrap();
        assert!(response.headers().get(CONTENT_ENCODING).is_none());
        assert_eq!(response.headers()[CONTENT_LENGTH], "10000");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        sender.await.unwrap();
        assert_eq!(body.len(), 10_000);
    }

    #[cfg(feature = "compression")]
    #[tokio::test]
    async fn test_gzip_negotiated_at_commit() {
        use std::io::Read;

        let config = CompressionConfig::new()
            .algorithms(vec![CompressionType::Gzip])
            .strategy(CompressionStrategy::Always);
        let ctx = ResponseContext::new(Method::GET, "/text")
            .accept_encoding(Some("gzip".to_string()))
            .compression(Arc::new(config));
        let (mut res, head) = writer(ctx);
        let sender = tokio::spawn(async move {
            for _ in 0..50 {
                res.write("compress me please ").await.unwrap();
            }
            res.finish().await.unwrap();
            assert_eq!(res.compression_decision().unwrap().encoding, CompressionType::Gzip);
        });

        let response = head.await.unwrap();
        assert_eq!(response.headers()[CONTENT_ENCODING], "gzip");
        assert!(response.headers().get(CONTENT_LENGTH).is_none());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        sender.await.unwrap();

        let mut decoded = String::new();
        flate2::read::GzDecoder::new(&body[..]).read_to_string(&mut decoded).unwrap();
        assert_eq!(decoded, "compress me please ".repeat(50));
    }

    #[tokio::test]
    async fn test_trailers_follow_body() {
        let (mut res, head) = writer(ResponseContext::new(Method::GET, "/trailers"));
        let sender = tokio::spawn(async move {
            res.write("body").await.unwrap();
            res.trailer("x-checksum", "abc").unwrap();
            res.finish().await.unwrap();
        });
        let response = head.await.unwrap();
        let collected = response.into_body().collect().await.unwrap();
        sender.await.unwrap();
        assert_eq!(collected.trailers().unwrap()["x-checksum"], "abc");
    }
}
