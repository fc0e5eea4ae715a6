//! RAT Conduit
//!
//! 可嵌入的 HTTP 服务器核心：
//! - 路径模板路由与参数提取
//! - 请求/响应两个方向的逐块信用背压
//! - HTTP/1.1、HTTP/2 (TLS ALPN)、H2C（升级与先验知识）和 WebSocket 的协议协商
//! - 一次提交的响应写入器，支持压缩与 SSE
//! - 访问日志与请求指标
//!
//! 日志统一经由 `rat_logger` 输出，日志器的初始化由嵌入方完成。

pub mod common;
pub mod compression;
pub mod error;
pub mod server;
pub mod utils;

pub use error::{DecoderLimit, RatError, RatResult};
pub use server::{
    handler_fn, run_server, ws_handler_fn, BoundServer, Handler, HttpRequest, ResponseWriter, RouteTable,
    RustlsTransport, SecureTransport, Server, ServerConfig, SseWriter, StaticFiles, WebSocketSession, WsHandler,
    WsMessage,
};

pub use bytes::Bytes;
pub use hyper::{Method, StatusCode};
