//! 压缩模块
//!
//! 核心只决定是否压缩以及使用哪种编码，编码本身委托给
//! flate2 / brotli。决策在响应头提交时计算，之后不可变。

pub mod types;
pub mod config;
pub mod compressor;

// 重新导出主要的公共类型
pub use types::{negotiate_encoding, parse_accept_encoding, CompressionType};
pub use config::{
    CompressionConfig, CompressionDecision, CompressionInput, CompressionStrategy, DecisionReason,
    UnknownLengthPolicy,
};
pub use compressor::StreamEncoder;
