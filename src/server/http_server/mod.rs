//! HTTP 服务器模块
//!
//! 连接驱动与请求服务

pub mod http_connection;
pub mod service;

pub use http_connection::{log_connection_result, serve_connection, serve_h1, serve_h2};
pub use service::{
    check_decoder_limits, error_response, Activity, CompletionGuard, ConduitService, ConnectionContext, ObservedBody,
    ResBody, ServerContext,
};
