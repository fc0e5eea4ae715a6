//! 错误类型模块
//!
//! 统一的 `RatError` 分类：配置/编程错误立即失败，
//! 解码限制映射为 4xx 响应，传输层错误只影响所属连接

use hyper::StatusCode;
use std::fmt;

/// 解码限制种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderLimit {
    /// 请求行长度
    InitialLine,
    /// 请求头总大小
    HeaderSize,
    /// 请求体总长度
    ContentLength,
}

impl fmt::Display for DecoderLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InitialLine => "max-initial-line-length",
            Self::HeaderSize => "max-header-size",
            Self::ContentLength => "max-content-length",
        };
        f.write_str(name)
    }
}

/// RAT Conduit 错误类型
#[derive(Debug, thiserror::Error)]
pub enum RatError {
    #[error("路由未找到: {method} {path}")]
    RouteNotFound { method: String, path: String },

    #[error("无效的路由模板 '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("协议错误: {0}")]
    Protocol(String),

    #[error("响应头已提交，无法再修改状态码或头部")]
    ResponseAlreadyCommitted,

    #[error("超出解码限制 {limit}: {actual} > {max}")]
    DecoderLimitExceeded { limit: DecoderLimit, max: u64, actual: u64 },

    #[error("背压违规: 已授予 {granted} 字节，尝试交付 {attempted} 字节")]
    BackpressureViolation { granted: u64, attempted: u64 },

    #[error("流已取消")]
    Cancelled,

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("处理器错误: {0}")]
    Handler(String),

    #[error("TLS 错误: {0}")]
    Tls(String),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP 错误: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("HTTP/2 错误: {0}")]
    H2(#[from] h2::Error),

    #[error("WebSocket 错误: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// 统一结果类型
pub type RatResult<T> = Result<T, RatError>;

impl RatError {
    /// 映射到 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RouteNotFound { .. } | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::DecoderLimitExceeded { limit, .. } => match limit {
                DecoderLimit::InitialLine => StatusCode::URI_TOO_LONG,
                DecoderLimit::HeaderSize => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                DecoderLimit::ContentLength => StatusCode::PAYLOAD_TOO_LARGE,
            },
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 是否为客户端断开一类的错误（只记录调试日志）
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::IoError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            Self::Hyper(e) => {
                e.is_canceled()
                    || e.is_incomplete_message()
                    || is_h2_disconnect(e)
                    || is_disconnect_message(&e.to_string())
            }
            Self::H2(e) => e.is_reset() || is_h2_disconnect(e),
            other => is_disconnect_message(&other.to_string()),
        }
    }
}

/// 按错误文本区分正常的客户端断开连接和真正的服务器错误
pub(crate) fn is_disconnect_message(msg: &str) -> bool {
    msg.contains("connection closed")
        || msg.contains("broken pipe")
        || msg.contains("connection reset")
        || msg.contains("unexpected end of file")
        || msg.contains("CANCELED")
}

/// 在错误链中查找 h2 错误并判断是否为对端取消
pub(crate) fn is_h2_disconnect(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(h2_err) = e.downcast_ref::<h2::Error>() {
            return h2_err.is_go_away()
                || h2_err.is_io()
                || h2_err.reason() == Some(h2::Reason::CANCEL)
                || h2_err.reason() == Some(h2::Reason::NO_ERROR);
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_limit_status_codes() {
        let err = RatError::DecoderLimitExceeded { limit: DecoderLimit::HeaderSize, max: 10, actual: 20 };
        assert_eq!(err.status_code(), StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);

        let err = RatError::DecoderLimitExceeded { limit: DecoderLimit::InitialLine, max: 10, actual: 20 };
        assert_eq!(err.status_code(), StatusCode::URI_TOO_LONG);

        let err = RatError::DecoderLimitExceeded { limit: DecoderLimit::ContentLength, max: 10, actual: 20 };
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn test_route_not_found_is_404() {
        let err = RatError::RouteNotFound { method: "GET".into(), path: "/nope".into() };
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert!(err.to_string().contains("/nope"));
    }

    #[test]
    fn test_disconnect_classification() {
        let io = RatError::IoError(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(io.is_disconnect());
        assert!(RatError::Cancelled.is_disconnect());
        assert!(!RatError::ResponseAlreadyCommitted.is_disconnect());
    }

    #[test]
    fn test_h2_cancel_and_goaway_are_disconnects() {
        let cancel = RatError::H2(h2::Error::from(h2::Reason::CANCEL));
        assert!(cancel.is_disconnect());
        let no_error = RatError::H2(h2::Error::from(h2::Reason::NO_ERROR));
        assert!(no_error.is_disconnect());

        let io = h2::Error::from(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(is_h2_disconnect(&io));

        let protocol = RatError::H2(h2::Error::from(h2::Reason::PROTOCOL_ERROR));
        assert!(!protocol.is_disconnect());
    }
}
