//! 背压流通道
//!
//! 每个请求的入站请求体和出站响应体各自对应一个 `StreamChannel`：
//! 有界队列 + 需求计数器。消费者通过 `request_demand` 授予额度，
//! 生产者交付的字节数永远不超过累计授予的额度；额度耗尽或队列满时
//! `push` 在调度器上挂起，不占用线程。

use std::collections::VecDeque;
use std::future::poll_fn;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use std::time::Instant;

use bytes::Bytes;
use hyper::body::{Body, Frame, SizeHint};
use hyper::HeaderMap;
use http_body_util::BodyExt;
use tokio::sync::Notify;

use crate::error::{RatError, RatResult};
use crate::utils::logger::{debug, warn};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// WebSocket 控制帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    /// 开始一条文本消息，其后直到 `is_last` 的数据块为 UTF-8 内容
    Text,
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<(u16, String)>),
}

/// 通道中传递的单元
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Data { bytes: Bytes, is_last: bool },
    Control(ControlFrame),
    Trailers(HeaderMap),
}

impl Chunk {
    pub fn data(bytes: impl Into<Bytes>) -> Self {
        Self::Data { bytes: bytes.into(), is_last: false }
    }

    /// 占用的需求额度，控制帧与尾部头不消耗字节额度
    pub fn demand_cost(&self) -> u64 {
        match self {
            Self::Data { bytes, .. } => bytes.len() as u64,
            _ => 0,
        }
    }
}

/// 刷新策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// 每个块立即下发（SSE）
    EveryChunk,
    /// 累积到高水位或显式 flush 时下发
    Batch { high_watermark: usize },
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self::Batch { high_watermark: 8192 }
    }
}

struct ChannelState {
    backlog: VecDeque<Chunk>,
    capacity: usize,
    /// 尚未使用的额度
    demand: u64,
    /// 累计授予的额度
    granted: u64,
    /// 累计交付给消费者的字节
    delivered: u64,
    closed: bool,
    cancelled: bool,
    aborted: Option<String>,
    consumer_waker: Option<Waker>,
    producer_waker: Option<Waker>,
}

impl ChannelState {
    fn wake_consumer(&mut self) {
        if let Some(w) = self.consumer_waker.take() {
            w.wake();
        }
    }

    fn wake_producer(&mut self) {
        if let Some(w) = self.producer_waker.take() {
            w.wake();
        }
    }
}

struct Shared {
    id: u64,
    state: Mutex<ChannelState>,
    cancel_notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        // 锁内不会 panic，中毒时沿用内部状态
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cancel(&self) {
        let mut state = self.lock();
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        state.closed = true;
        state.backlog.clear();
        state.wake_producer();
        state.wake_consumer();
        drop(state);
        self.cancel_notify.notify_waiters();
    }
}

/// 背压流通道
pub struct StreamChannel;

impl StreamChannel {
    /// 创建通道，`capacity` 为队列可容纳的块数，`initial_credit` 为初始额度
    pub fn new(capacity: usize, initial_credit: u64) -> (ChannelProducer, ChannelConsumer) {
        let shared = Arc::new(Shared {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(ChannelState {
                backlog: VecDeque::with_capacity(capacity.max(1)),
                capacity: capacity.max(1),
                demand: initial_credit,
                granted: initial_credit,
                delivered: 0,
                closed: false,
                cancelled: false,
                aborted: None,
                consumer_waker: None,
                producer_waker: None,
            }),
            cancel_notify: Notify::new(),
        });
        (
            ChannelProducer { shared: shared.clone(), owns_end: true },
            ChannelConsumer { shared },
        )
    }
}

/// 可克隆的取消信号，供上游生产者订阅
#[derive(Clone)]
pub struct CancelSignal {
    shared: Arc<Shared>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        self.shared.lock().cancelled
    }

    /// 等待通道被取消
    pub async fn cancelled(&self) {
        loop {
            let notified = self.shared.cancel_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// 通道生产端
pub struct ChannelProducer {
    shared: Arc<Shared>,
    /// 丢弃时是否负责结束通道
    owns_end: bool,
}

impl ChannelProducer {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// 推送一个块；额度不足时挂起，超出额度的数据块会被拆分
    pub async fn push(&self, chunk: Chunk) -> RatResult<()> {
        let mut slot = Some(chunk);
        poll_fn(|cx| self.poll_push(cx, &mut slot)).await
    }

    fn poll_push(&self, cx: &mut Context<'_>, slot: &mut Option<Chunk>) -> Poll<RatResult<()>> {
        let mut state = self.shared.lock();
        loop {
            if state.cancelled {
                return Poll::Ready(Err(RatError::Cancelled));
            }
            if state.closed {
                return Poll::Ready(Err(RatError::Protocol("通道已关闭，不能继续推送".to_string())));
            }
            let Some(chunk) = slot.take() else {
                return Poll::Ready(Ok(()));
            };
            if state.backlog.len() >= state.capacity {
                *slot = Some(chunk);
                state.producer_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }

            let cost = chunk.demand_cost();
            if cost == 0 {
                state.backlog.push_back(chunk);
                state.wake_consumer();
                return Poll::Ready(Ok(()));
            }
            if state.demand == 0 {
                *slot = Some(chunk);
                state.producer_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }

            if cost <= state.demand {
                state.demand -= cost;
                state.backlog.push_back(chunk);
                state.wake_consumer();
                return Poll::Ready(Ok(()));
            }

            // 拆分：先交付额度内的前缀，剩余部分等待新的额度
            let Chunk::Data { mut bytes, is_last } = chunk else {
                unreachable!("只有数据块消耗额度");
            };
            let head = bytes.split_to(state.demand as usize);
            state.demand = 0;
            state.backlog.push_back(Chunk::Data { bytes: head, is_last: false });
            state.wake_consumer();
            *slot = Some(Chunk::Data { bytes, is_last });
        }
    }

    /// 正常结束，幂等
    pub fn close(&self) {
        let mut state = self.shared.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.wake_consumer();
    }

    /// 异常中止，消费者在排空已入队数据后收到错误
    pub fn abort(&self, reason: impl Into<String>) {
        let mut state = self.shared.lock();
        if state.closed {
            return;
        }
        state.aborted = Some(reason.into());
        state.closed = true;
        state.wake_consumer();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.lock().cancelled
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        CancelSignal { shared: self.shared.clone() }
    }

    /// 把结束通道的责任转交给新的生产端，自身丢弃时不再关闭通道
    pub(crate) fn hand_off(&mut self) -> ChannelProducer {
        self.owns_end = false;
        ChannelProducer { shared: self.shared.clone(), owns_end: true }
    }
}

impl Drop for ChannelProducer {
    fn drop(&mut self) {
        if self.owns_end {
            self.close();
        }
    }
}

/// 通道消费端
pub struct ChannelConsumer {
    shared: Arc<Shared>,
}

impl ChannelConsumer {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// 授予额度
    pub fn request_demand(&self, n: u64) {
        if n == 0 {
            return;
        }
        let mut state = self.shared.lock();
        if state.closed {
            return;
        }
        state.demand = state.demand.saturating_add(n);
        state.granted = state.granted.saturating_add(n);
        state.wake_producer();
    }

    /// 尚未被生产者使用的额度
    pub fn outstanding_demand(&self) -> u64 {
        self.shared.lock().demand
    }

    /// 队列中是否没有待取的块
    pub fn is_drained(&self) -> bool {
        self.shared.lock().backlog.is_empty()
    }

    /// 累计交付字节数
    pub fn delivered(&self) -> u64 {
        self.shared.lock().delivered
    }

    /// 累计授予额度
    pub fn granted(&self) -> u64 {
        self.shared.lock().granted
    }

    /// 取下一个块；`None` 表示已结束且排空
    pub async fn pull(&mut self) -> Option<RatResult<Chunk>> {
        poll_fn(|cx| self.poll_pull(cx)).await
    }

    pub fn poll_pull(&mut self, cx: &mut Context<'_>) -> Poll<Option<RatResult<Chunk>>> {
        let mut state = self.shared.lock();
        if state.cancelled {
            return Poll::Ready(Some(Err(RatError::Cancelled)));
        }
        if let Some(chunk) = state.backlog.pop_front() {
            let cost = chunk.demand_cost();
            if state.delivered + cost > state.granted {
                let err = RatError::BackpressureViolation {
                    granted: state.granted,
                    attempted: state.delivered + cost,
                };
                drop(state);
                warn!("🚨 [StreamChannel#{}] {}", self.shared.id, err);
                self.shared.cancel();
                return Poll::Ready(Some(Err(err)));
            }
            state.delivered += cost;
            state.wake_producer();
            return Poll::Ready(Some(Ok(chunk)));
        }
        if let Some(reason) = state.aborted.take() {
            return Poll::Ready(Some(Err(RatError::Handler(reason))));
        }
        if state.closed {
            return Poll::Ready(None);
        }
        state.consumer_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    /// 取消通道，生产者在下一次调度时即可观察到
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub fn is_end_stream(&self) -> bool {
        let state = self.shared.lock();
        state.closed && state.backlog.is_empty() && state.aborted.is_none()
    }
}

impl Drop for ChannelConsumer {
    fn drop(&mut self) {
        let state = self.shared.lock();
        let finished = state.closed && state.backlog.is_empty();
        drop(state);
        if !finished {
            self.shared.cancel();
        }
    }
}

/// 出站响应体：hyper 只有在连接可写时才会轮询，
/// 轮询时如果队列已空且额度用尽，就按窗口大小补充额度
pub struct ChannelBody {
    consumer: ChannelConsumer,
    window: u64,
}

impl ChannelBody {
    pub fn new(consumer: ChannelConsumer, window: u64) -> Self {
        Self { consumer, window: window.max(1) }
    }

    pub fn consumer(&self) -> &ChannelConsumer {
        &self.consumer
    }
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = RatError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        loop {
            if this.consumer.outstanding_demand() == 0 && this.consumer.is_drained() {
                this.consumer.request_demand(this.window);
            }
            match this.consumer.poll_pull(cx) {
                Poll::Ready(Some(Ok(Chunk::Data { bytes, .. }))) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    return Poll::Ready(Some(Ok(Frame::data(bytes))));
                }
                Poll::Ready(Some(Ok(Chunk::Trailers(trailers)))) => {
                    return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
                }
                // HTTP 响应体中的控制帧没有意义，直接跳过
                Poll::Ready(Some(Ok(Chunk::Control(_)))) => continue,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.consumer.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}

/// 入站请求体统计
#[derive(Debug, Default)]
pub struct InboundStats {
    bytes: AtomicU64,
    /// 请求体读完的时刻（相对请求开始的微秒数，0 表示未完成）
    finished_micros: AtomicU64,
}

impl InboundStats {
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn finished_micros(&self) -> Option<u64> {
        match self.finished_micros.load(Ordering::Relaxed) {
            0 => None,
            v => Some(v),
        }
    }
}

/// 把传输层请求体泵入通道；只有在消费者授予额度后才继续读取下一帧，
/// 背压因此一路传到 socket 读缓冲 / H2 接收窗口
pub async fn pump_incoming<B>(
    body: B,
    producer: ChannelProducer,
    max_chunk_size: usize,
    stats: Arc<InboundStats>,
    started: Instant,
) where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let max_chunk_size = max_chunk_size.max(1);
    let mut body = std::pin::pin!(body);

    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                let Ok(mut data) = frame.into_data() else {
                    // 入站尾部头不交给处理器
                    continue;
                };
                while !data.is_empty() {
                    let piece = data.split_to(data.len().min(max_chunk_size));
                    let len = piece.len() as u64;
                    if let Err(e) = producer.push(Chunk::data(piece)).await {
                        debug!("🔌 [StreamChannel#{}] 请求体泵停止: {}", producer.id(), e);
                        return;
                    }
                    stats.bytes.fetch_add(len, Ordering::Relaxed);
                }
            }
            Err(e) => {
                debug!("🔌 [StreamChannel#{}] 读取请求体失败: {}", producer.id(), e);
                producer.abort(format!("读取请求体失败: {}", e));
                return;
            }
        }
    }

    let elapsed = (started.elapsed().as_micros() as u64).max(1);
    stats.finished_micros.store(elapsed, Ordering::Relaxed);
    let _ = producer.push(Chunk::Data { bytes: Bytes::new(), is_last: true }).await;
    producer.close();
}
