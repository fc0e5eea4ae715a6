//! 请求指标
//!
//! 每个完成的请求产生一个 `MetricEvent`，按 (uri, method) 打标签写入 `MetricsRecorder`。
//! 默认的 `AtomicMetricsRegistry` 只用原子计数，热路径上没有跨连接的锁。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;

use crate::utils::logger::debug;

pub const RECEIVED_BYTES: &str = "http.server.received.bytes";
pub const SENT_BYTES: &str = "http.server.sent.bytes";
pub const ERRORS: &str = "http.server.errors";
pub const RECEIVE_TIME: &str = "http.server.receive.time";
pub const SEND_TIME: &str = "http.server.send.time";
pub const RESPONSE_TIME: &str = "http.server.response.time";

/// 未匹配任何路由时的 uri 标签
pub const UNMATCHED_URI: &str = "UNMATCHED";
/// 超出标签上限后的 uri 标签
pub const OTHER_URI: &str = "OTHER";

/// 一次请求的指标事件
#[derive(Debug, Clone)]
pub struct MetricEvent {
    pub uri: String,
    pub method: String,
    pub status: u16,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub receive_time: Duration,
    pub send_time: Duration,
    pub total_time: Duration,
    /// 响应体被中止
    pub aborted: bool,
}

impl MetricEvent {
    pub fn is_error(&self) -> bool {
        self.aborted || self.status >= 500
    }
}

/// 指标写入端
///
/// `record` 在响应体结束时由连接任务同步调用，实现不得阻塞（不做 I/O、不等待锁）。
/// 需要写外部系统的实现应包一层 [`QueuedRecorder`]，由后台任务消费。
pub trait MetricsRecorder: Send + Sync {
    fn record(&self, event: &MetricEvent);
}

/// 有界队列转发的写入端：`record` 只做 `try_send`，队列满时丢弃并计数
pub struct QueuedRecorder {
    tx: mpsc::Sender<MetricEvent>,
    dropped: AtomicU64,
}

impl fmt::Debug for QueuedRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedRecorder").field("dropped", &self.dropped()).finish()
    }
}

impl QueuedRecorder {
    /// 启动后台任务把事件交给 `inner`，需要在 tokio 运行时内调用
    pub fn spawn(inner: Arc<dyn MetricsRecorder>, queue_size: usize) -> Self {
        let (recorder, mut rx) = Self::channel(queue_size);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                inner.record(&event);
            }
            debug!("🛑 [Metrics] 指标队列已关闭");
        });
        recorder
    }

    /// 只创建队列，由调用方自行消费
    pub fn channel(queue_size: usize) -> (Self, mpsc::Receiver<MetricEvent>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        (Self { tx, dropped: AtomicU64::new(0) }, rx)
    }

    /// 因队列满或关闭而丢弃的事件数
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl MetricsRecorder for QueuedRecorder {
    fn record(&self, event: &MetricEvent) {
        match self.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if n.is_power_of_two() {
                    debug!("⚠️ [Metrics] 指标队列已满，累计丢弃 {} 个事件", n);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    pub name: &'static str,
    pub uri: String,
    pub method: String,
}

/// 计数器：次数与累计值（字节或微秒）
#[derive(Debug, Default)]
pub struct AtomicCounter {
    count: AtomicU64,
    total: AtomicU64,
}

impl AtomicCounter {
    pub fn add(&self, value: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(value, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// 快照中的一项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSample {
    pub key: MetricKey,
    pub count: u64,
    pub total: u64,
}

/// 进程内的原子指标注册表
#[derive(Debug, Default)]
pub struct AtomicMetricsRegistry {
    counters: DashMap<MetricKey, Arc<AtomicCounter>>,
}

impl AtomicMetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, name: &'static str, uri: &str, method: &str) -> Arc<AtomicCounter> {
        let key = MetricKey { name, uri: uri.to_string(), method: method.to_string() };
        if let Some(c) = self.counters.get(&key) {
            return c.clone();
        }
        self.counters.entry(key).or_default().clone()
    }

    pub fn get(&self, name: &str, uri: &str, method: &str) -> Option<MetricSample> {
        self.counters
            .iter()
            .find(|e| e.key().name == name && e.key().uri == uri && e.key().method == method)
            .map(|e| MetricSample { key: e.key().clone(), count: e.value().count(), total: e.value().total() })
    }

    /// 按键排序的全部指标
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let mut samples: Vec<MetricSample> = self
            .counters
            .iter()
            .map(|e| MetricSample { key: e.key().clone(), count: e.value().count(), total: e.value().total() })
            .collect();
        samples.sort_by(|a, b| a.key.cmp(&b.key));
        samples
    }
}

impl MetricsRecorder for AtomicMetricsRegistry {
    fn record(&self, event: &MetricEvent) {
        let (uri, method) = (event.uri.as_str(), event.method.as_str());
        self.counter(RECEIVED_BYTES, uri, method).add(event.bytes_received);
        self.counter(SENT_BYTES, uri, method).add(event.bytes_sent);
        self.counter(RECEIVE_TIME, uri, method).add(event.receive_time.as_micros() as u64);
        self.counter(SEND_TIME, uri, method).add(event.send_time.as_micros() as u64);
        self.counter(RESPONSE_TIME, uri, method).add(event.total_time.as_micros() as u64);
        if event.is_error() {
            self.counter(ERRORS, uri, method).add(1);
        }
    }
}

pub type UriTemplater = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// 指标发射器，负责 uri 标签的生成与上限控制
#[derive(Clone)]
pub struct MetricsEmitter {
    recorder: Arc<dyn MetricsRecorder>,
    templater: Option<UriTemplater>,
    max_uri_tags: usize,
    seen_uris: Arc<DashMap<String, ()>>,
    /// 已占用的标签名额，先预留再插入
    reserved_tags: Arc<AtomicUsize>,
}

impl fmt::Debug for MetricsEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsEmitter")
            .field("max_uri_tags", &self.max_uri_tags)
            .field("distinct_uris", &self.seen_uris.len())
            .finish()
    }
}

impl MetricsEmitter {
    pub fn new(recorder: Arc<dyn MetricsRecorder>, max_uri_tags: usize) -> Self {
        Self {
            recorder,
            templater: None,
            max_uri_tags,
            seen_uris: Arc::new(DashMap::new()),
            reserved_tags: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 使用自定义函数从原始路径生成 uri 标签
    pub fn with_templater(mut self, templater: UriTemplater) -> Self {
        self.templater = Some(templater);
        self
    }

    /// 计算 uri 标签：自定义函数优先，其次是匹配的路由模板
    pub fn uri_tag(&self, route_template: Option<&str>, raw_path: &str) -> String {
        let uri = match (&self.templater, route_template) {
            (Some(f), _) => f(raw_path),
            (None, Some(template)) => template.to_string(),
            (None, None) => UNMATCHED_URI.to_string(),
        };
        if self.seen_uris.contains_key(&uri) {
            return uri;
        }
        match self.seen_uris.entry(uri.clone()) {
            Entry::Occupied(_) => uri,
            Entry::Vacant(slot) => {
                // 并发的新标签各自预留名额，超出的退回
                if self.reserved_tags.fetch_add(1, Ordering::AcqRel) >= self.max_uri_tags {
                    self.reserved_tags.fetch_sub(1, Ordering::AcqRel);
                    debug!("📊 [Metrics] uri 标签数达到上限 {}，{} 归入 {}", self.max_uri_tags, uri, OTHER_URI);
                    return OTHER_URI.to_string();
                }
                slot.insert(());
                uri
            }
        }
    }

    /// 已登记的不同 uri 标签数
    pub fn distinct_uris(&self) -> usize {
        self.seen_uris.len()
    }

    pub fn emit(&self, event: MetricEvent) {
        self.recorder.record(&event);
    }
}
