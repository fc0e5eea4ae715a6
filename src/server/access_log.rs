//! 访问日志
//!
//! 每个完成的请求产生一条 `AccessLogRecord`，经有界队列交给后台任务写出。
//! 队列满时直接丢弃并计数，不阻塞连接任务。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local};
use tokio::sync::mpsc;

use crate::utils::logger::{debug, info};

/// 一条访问日志记录
#[derive(Debug, Clone)]
pub struct AccessLogRecord {
    pub remote_host: String,
    pub timestamp: DateTime<FixedOffset>,
    pub method: String,
    pub path: String,
    pub protocol: &'static str,
    pub status: u16,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub receive_time: Duration,
    pub send_time: Duration,
    pub total_time: Duration,
}

impl AccessLogRecord {
    pub fn now_timestamp() -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }

    /// Common Log Format
    pub fn to_common_log_format(&self) -> String {
        let bytes = if self.bytes_sent == 0 { "-".to_string() } else { self.bytes_sent.to_string() };
        format!(
            "{} - - [{}] \"{} {} {}\" {} {}",
            self.remote_host,
            self.timestamp.format("%d/%b/%Y:%H:%M:%S %z"),
            self.method,
            self.path,
            self.protocol,
            self.status,
            bytes
        )
    }
}

/// 访问日志输出端
pub trait AccessLogSink: Send + Sync {
    fn write(&self, record: &AccessLogRecord);
}

/// 默认输出端：通过 rat_logger 写 info 日志
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggerSink;

impl AccessLogSink for LoggerSink {
    fn write(&self, record: &AccessLogRecord) {
        info!("📝 [AccessLog] {} {}ms", record.to_common_log_format(), record.total_time.as_millis());
    }
}

/// 访问日志发射器
#[derive(Debug, Clone)]
pub struct AccessLogEmitter {
    tx: mpsc::Sender<AccessLogRecord>,
    dropped: Arc<AtomicU64>,
}

impl AccessLogEmitter {
    /// 创建发射器并启动后台写出任务，需要在 tokio 运行时内调用
    pub fn spawn(sink: Arc<dyn AccessLogSink>, queue_size: usize) -> Self {
        let (emitter, mut rx) = Self::channel(queue_size);
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                sink.write(&record);
            }
            debug!("🛑 [AccessLog] 访问日志队列已关闭");
        });
        emitter
    }

    /// 只创建队列，由调用方自行消费
    pub fn channel(queue_size: usize) -> (Self, mpsc::Receiver<AccessLogRecord>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        (Self { tx, dropped: Arc::new(AtomicU64::new(0)) }, rx)
    }

    pub fn emit(&self, record: AccessLogRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if n.is_power_of_two() {
                    debug!("⚠️ [AccessLog] 队列已满，累计丢弃 {} 条记录", n);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// 因队列满或关闭而丢弃的记录数
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    fn record(bytes_sent: u64) -> AccessLogRecord {
        AccessLogRecord {
            remote_host: "127.0.0.1".to_string(),
            timestamp: FixedOffset::east_opt(0).unwrap().with_ymd_and_hms(2024, 3, 7, 9, 5, 1).unwrap(),
            method: "GET".to_string(),
            path: "/hello?x=1".to_string(),
            protocol: "HTTP/1.1",
            status: 200,
            bytes_sent,
            bytes_received: 0,
            receive_time: Duration::ZERO,
            send_time: Duration::ZERO,
            total_time: Duration::from_millis(3),
        }
    }

    #[test]
    fn test_common_log_format() {
        assert_eq!(
            record(12).to_common_log_format(),
            "127.0.0.1 - - [07/Mar/2024:09:05:01 +0000] \"GET /hello?x=1 HTTP/1.1\" 200 12"
        );
        assert!(record(0).to_common_log_format().ends_with("200 -"));
    }

    #[test]
    fn test_drop_when_full() {
        let (emitter, mut rx) = AccessLogEmitter::channel(1);
        emitter.emit(record(1));
        emitter.emit(record(2));
        emitter.emit(record(3));
        assert_eq!(emitter.dropped(), 2);
        assert_eq!(rx.try_recv().unwrap().bytes_sent, 1);
    }

    struct CollectSink(Mutex<Vec<String>>);

    impl AccessLogSink for CollectSink {
        fn write(&self, record: &AccessLogRecord) {
            self.0.lock().unwrap().push(record.path.clone());
        }
    }

    #[tokio::test]
    async fn test_background_drain() {
        let sink = Arc::new(CollectSink(Mutex::new(Vec::new())));
        let emitter = AccessLogEmitter::spawn(sink.clone(), 8);
        emitter.emit(record(1));
        for _ in 0..50 {
            if !sink.0.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sink.0.lock().unwrap().as_slice(), ["/hello?x=1"]);
        assert_eq!(emitter.dropped(), 0);
    }
}
