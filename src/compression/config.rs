//! 压缩配置与压缩决策

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use hyper::header::{HeaderMap, CONTENT_ENCODING, CONTENT_TYPE};
use hyper::{Method, StatusCode};
use serde::{Deserialize, Serialize};

use super::types::{negotiate_encoding, CompressionType};

/// 长度未知时阈值策略的取舍
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownLengthPolicy {
    /// 无法判断阈值时按压缩处理
    #[default]
    AssumeCompress,
    /// 无法判断阈值时不压缩
    AssumeIdentity,
}

/// 谓词策略的输入：提交时已确定的请求/响应元数据
#[derive(Debug)]
pub struct CompressionInput<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub status: StatusCode,
    pub response_headers: &'a HeaderMap,
    pub content_length: Option<u64>,
}

pub type CompressionPredicate = Arc<dyn Fn(&CompressionInput<'_>) -> bool + Send + Sync>;

/// 压缩策略
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CompressionStrategy {
    /// 从不压缩
    Never,
    /// 总是压缩（仍受客户端 Accept-Encoding 约束）
    Always,
    /// 已知长度超过 `min_size` 时压缩
    Threshold {
        min_size: u64,
        #[serde(default)]
        unknown_length: UnknownLengthPolicy,
    },
    /// 自定义谓词，只能通过代码配置
    #[serde(skip)]
    Predicate(CompressionPredicate),
}

impl fmt::Debug for CompressionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("Never"),
            Self::Always => f.write_str("Always"),
            Self::Threshold { min_size, unknown_length } => f
                .debug_struct("Threshold")
                .field("min_size", min_size)
                .field("unknown_length", unknown_length)
                .finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl Default for CompressionStrategy {
    fn default() -> Self {
        Self::Threshold {
            min_size: 1024,
            unknown_length: UnknownLengthPolicy::AssumeCompress,
        }
    }
}

impl CompressionStrategy {
    /// 布尔开关形式的策略
    pub fn compress(enabled: bool) -> Self {
        if enabled { Self::Always } else { Self::Never }
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&CompressionInput<'_>) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    /// 策略本身是否允许压缩（不考虑客户端协商）
    fn allows(&self, input: &CompressionInput<'_>) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::Threshold { min_size, unknown_length } => match input.content_length {
                Some(len) => len > *min_size,
                None => *unknown_length == UnknownLengthPolicy::AssumeCompress,
            },
            Self::Predicate(f) => f(input),
        }
    }
}

/// 压缩决策原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    Negotiated,
    StrategyDeclined,
    NoCommonEncoding,
    ExcludedContentType,
    AlreadyEncoded,
    NoBody,
}

/// 响应头提交时计算、之后不可变的压缩决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionDecision {
    pub encoding: CompressionType,
    pub reason: DecisionReason,
}

impl CompressionDecision {
    fn identity(reason: DecisionReason) -> Self {
        Self { encoding: CompressionType::Identity, reason }
    }

    pub fn is_identity(&self) -> bool {
        self.encoding == CompressionType::Identity
    }
}

/// 压缩配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// 压缩策略
    pub strategy: CompressionStrategy,
    /// 启用的压缩算法，顺序即服务端优先级
    pub enabled_algorithms: Vec<CompressionType>,
    /// 压缩级别 (1-9，越大压缩率越高但速度越慢)
    pub level: u32,
    /// 排除的内容类型（前缀匹配）
    pub excluded_content_types: HashSet<String>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            strategy: CompressionStrategy::default(),
            enabled_algorithms: CompressionType::default_algorithms(),
            level: 6,
            excluded_content_types: HashSet::from([
                "image/".to_string(),
                "audio/".to_string(),
                "video/".to_string(),
                "application/zip".to_string(),
                "application/gzip".to_string(),
                "application/x-rar-compressed".to_string(),
                "application/x-7z-compressed".to_string(),
                "text/event-stream".to_string(),
            ]),
        }
    }
}

impl CompressionConfig {
    /// 创建新的压缩配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 关闭压缩
    pub fn disabled() -> Self {
        Self::default().strategy(CompressionStrategy::Never)
    }

    /// 设置压缩策略
    pub fn strategy(mut self, strategy: CompressionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// 设置启用的压缩算法
    pub fn algorithms(mut self, algorithms: Vec<CompressionType>) -> Self {
        self.enabled_algorithms = algorithms;
        self
    }

    /// 压缩级别
    pub fn level(mut self, level: u32) -> Self {
        self.level = level.clamp(1, 9);
        self
    }

    /// 追加排除的内容类型
    pub fn exclude_content_type(mut self, content_types: Vec<&str>) -> Self {
        for ct in content_types {
            self.excluded_content_types.insert(ct.to_ascii_lowercase());
        }
        self
    }

    /// 当前构建实际可用的算法
    pub fn available_algorithms(&self) -> Vec<CompressionType> {
        self.enabled_algorithms
            .iter()
            .copied()
            .filter(|a| *a != CompressionType::Identity && a.is_available())
            .collect()
    }

    /// 检查是否应该压缩指定的内容类型
    pub fn should_compress_content_type(&self, content_type: Option<&str>) -> bool {
        match content_type {
            Some(ct) => {
                let ct = ct.to_ascii_lowercase();
                !self.excluded_content_types.iter().any(|excluded| ct.starts_with(excluded.as_str()))
            }
            None => true,
        }
    }

    /// 在响应头提交时计算压缩决策
    pub fn decide(&self, input: &CompressionInput<'_>, accept_encoding: Option<&str>) -> CompressionDecision {
        if input.response_headers.contains_key(CONTENT_ENCODING) {
            return CompressionDecision::identity(DecisionReason::AlreadyEncoded);
        }

        if *input.method == Method::HEAD
            || input.status.is_informational()
            || input.status == StatusCode::NO_CONTENT
            || input.status == StatusCode::NOT_MODIFIED
            || input.content_length == Some(0)
        {
            return CompressionDecision::identity(DecisionReason::NoBody);
        }

        if !self.strategy.allows(input) {
            return CompressionDecision::identity(DecisionReason::StrategyDeclined);
        }

        let content_type = input
            .response_headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        if !self.should_compress_content_type(content_type) {
            return CompressionDecision::identity(DecisionReason::ExcludedContentType);
        }

        match negotiate_encoding(accept_encoding, &self.available_algorithms()) {
            CompressionType::Identity => CompressionDecision::identity(DecisionReason::NoCommonEncoding),
            encoding => CompressionDecision { encoding, reason: DecisionReason::Negotiated },
        }
    }
}
