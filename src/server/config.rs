//! 服务器配置
//!
//! 配置在绑定前由构建器组装或从 TOML 加载，绑定后包装在 `Arc` 中只读共享。

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compression::CompressionConfig;
use crate::error::{RatError, RatResult};
use crate::server::protocol_negotiator::{EnabledProtocols, ProtocolKind};
use crate::server::streaming::FlushPolicy;

/// 解码限制
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderLimits {
    pub max_initial_line_length: usize,
    pub max_header_size: usize,
    pub max_chunk_size: usize,
    pub max_content_length: Option<u64>,
}

impl Default for DecoderLimits {
    fn default() -> Self {
        Self {
            max_initial_line_length: 4096,
            max_header_size: 8192,
            max_chunk_size: 8192,
            max_content_length: None,
        }
    }
}

impl DecoderLimits {
    /// hyper HTTP/1 读缓冲上限
    pub fn h1_max_buf_size(&self) -> usize {
        (self.max_initial_line_length + self.max_header_size).max(8192)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// 超时设置（TOML 中以秒为单位）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// 前言嗅探、TLS 握手、H2 握手
    #[serde(with = "duration_secs")]
    pub handshake: Duration,
    /// HTTP/1 请求头读取
    #[serde(with = "duration_secs")]
    pub header_read: Duration,
    /// 连接空闲
    #[serde(with = "duration_secs")]
    pub idle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(10),
            header_read: Duration::from_secs(30),
            idle: Duration::from_secs(60),
        }
    }
}

/// 流通道设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// 每次授予的额度（字节）
    pub initial_credit: u64,
    /// 通道可容纳的块数
    pub channel_capacity: usize,
    /// 批量刷新高水位
    pub batch_high_watermark: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            initial_credit: 65536,
            channel_capacity: 16,
            batch_high_watermark: 8192,
        }
    }
}

impl StreamSettings {
    pub fn flush_policy(&self) -> FlushPolicy {
        FlushPolicy::Batch { high_watermark: self.batch_high_watermark }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub protocols: Vec<ProtocolKind>,
    pub limits: DecoderLimits,
    pub compression: CompressionConfig,
    /// 是否信任 X-Forwarded-For / Forwarded
    pub trust_forwarded_headers: bool,
    /// 调试输出原始前言和请求/响应头
    pub wiretap: bool,
    pub timeouts: Timeouts,
    pub stream: StreamSettings,
    pub h2c_upgrade_buffer_limit: usize,
    pub access_log_queue: usize,
    pub max_uri_tags: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            protocols: vec![ProtocolKind::H1],
            limits: DecoderLimits::default(),
            compression: CompressionConfig::default(),
            trust_forwarded_headers: false,
            wiretap: false,
            timeouts: Timeouts::default(),
            stream: StreamSettings::default(),
            h2c_upgrade_buffer_limit: 65535,
            access_log_queue: 1024,
            max_uri_tags: 1000,
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// 从 TOML 字符串加载
    pub fn from_toml_str(content: &str) -> RatResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| RatError::Config(format!("解析配置失败: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 从 TOML 文件加载
    pub fn from_toml_file(path: impl AsRef<Path>) -> RatResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RatError::Config(format!("读取配置文件 {} 失败: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    pub fn enabled_protocols(&self) -> EnabledProtocols {
        EnabledProtocols::from_kinds(&self.protocols)
    }

    /// 与传输层无关的校验
    pub fn validate(&self) -> RatResult<()> {
        if self.protocols.is_empty() {
            return Err(RatError::Config("至少需要启用一种协议".to_string()));
        }
        if self.limits.max_initial_line_length == 0 || self.limits.max_header_size == 0 {
            return Err(RatError::Config("请求行和请求头限制必须大于 0".to_string()));
        }
        if self.limits.max_chunk_size == 0 {
            return Err(RatError::Config("max_chunk_size 必须大于 0".to_string()));
        }
        if self.stream.initial_credit == 0 || self.stream.channel_capacity == 0 {
            return Err(RatError::Config("流通道额度和容量必须大于 0".to_string()));
        }
        if self.access_log_queue == 0 {
            return Err(RatError::Config("access_log_queue 必须大于 0".to_string()));
        }
        Ok(())
    }

    /// 结合是否配置了安全传输进行校验
    pub fn validate_transport(&self, secure: bool) -> RatResult<()> {
        self.validate()?;
        let enabled = self.enabled_protocols();
        if secure && !enabled.h1 && !enabled.h2 {
            return Err(RatError::Config("启用 TLS 时必须至少启用 h1 或 h2".to_string()));
        }
        if !secure && enabled.h2 && !enabled.h1 && !enabled.h2c {
            return Err(RatError::Config("仅启用 h2 时必须配置安全传输".to_string()));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 解析为 socket 地址（仅支持 IP 字面量）
    pub fn socket_addr(&self) -> RatResult<SocketAddr> {
        let ip = self
            .host
            .parse()
            .map_err(|e| RatError::Config(format!("无效的监听地址 {}: {}", self.host, e)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// 服务器配置构建器
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn protocols(mut self, protocols: Vec<ProtocolKind>) -> Self {
        self.config.protocols = protocols;
        self
    }

    pub fn limits(mut self, limits: DecoderLimits) -> Self {
        self.config.limits = limits;
        self
    }

    pub fn max_header_size(mut self, size: usize) -> Self {
        self.config.limits.max_header_size = size;
        self
    }

    pub fn max_initial_line_length(mut self, size: usize) -> Self {
        self.config.limits.max_initial_line_length = size;
        self
    }

    pub fn max_content_length(mut self, size: Option<u64>) -> Self {
        self.config.limits.max_content_length = size;
        self
    }

    pub fn compression(mut self, compression: CompressionConfig) -> Self {
        self.config.compression = compression;
        self
    }

    pub fn trust_forwarded_headers(mut self, trust: bool) -> Self {
        self.config.trust_forwarded_headers = trust;
        self
    }

    pub fn wiretap(mut self, enabled: bool) -> Self {
        self.config.wiretap = enabled;
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    pub fn stream(mut self, stream: StreamSettings) -> Self {
        self.config.stream = stream;
        self
    }

    pub fn h2c_upgrade_buffer_limit(mut self, limit: usize) -> Self {
        self.config.h2c_upgrade_buffer_limit = limit;
        self
    }

    pub fn access_log_queue(mut self, size: usize) -> Self {
        self.config.access_log_queue = size;
        self
    }

    pub fn max_uri_tags(mut self, max: usize) -> Self {
        self.config.max_uri_tags = max;
        self
    }

    pub fn build(self) -> RatResult<ServerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionStrategy;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.protocols, vec![ProtocolKind::H1]);
        assert_eq!(config.limits.max_header_size, 8192);
        assert_eq!(config.timeouts.handshake, Duration::from_secs(10));
        assert_eq!(config.stream.initial_credit, 65536);
        assert_eq!(config.h2c_upgrade_buffer_limit, 65535);
        assert!(!config.trust_forwarded_headers);
    }

    #[test]
    fn test_from_toml() {
        let config = ServerConfig::from_toml_str(
            r#"
            host = "0.0.0.0"
            port = 9000
            protocols = ["h1", "h2c"]
            wiretap = true

            [limits]
            max_header_size = 16384
            max_content_length = 1048576

            [timeouts]
            idle = 5

            [compression]
            strategy = { mode = "never" }
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.protocols, vec![ProtocolKind::H1, ProtocolKind::H2c]);
        assert_eq!(config.limits.max_header_size, 16384);
        assert_eq!(config.limits.max_initial_line_length, 4096);
        assert_eq!(config.limits.max_content_length, Some(1 << 20));
        assert_eq!(config.timeouts.idle, Duration::from_secs(5));
        assert_eq!(config.timeouts.header_read, Duration::from_secs(30));
        assert!(matches!(config.compression.strategy, CompressionStrategy::Never));
        assert!(config.enabled_protocols().h2c);
    }

    #[test]
    fn test_invalid_configs() {
        assert!(ServerConfig::from_toml_str("protocols = []").is_err());
        assert!(ServerConfig::from_toml_str("port = \"x\"").is_err());

        let h2_only = ServerConfig::builder().protocols(vec![ProtocolKind::H2]).build().unwrap();
        assert!(h2_only.validate_transport(false).is_err());
        assert!(h2_only.validate_transport(true).is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ServerConfig::builder()
            .host("0.0.0.0")
            .port(0)
            .max_header_size(1024)
            .trust_forwarded_headers(true)
            .build()
            .unwrap();
        assert_eq!(config.listen_addr(), "0.0.0.0:0");
        assert_eq!(config.socket_addr().unwrap().port(), 0);
        assert_eq!(config.limits.max_header_size, 1024);
        assert_eq!(config.limits.h1_max_buf_size(), 8192);
    }
}
