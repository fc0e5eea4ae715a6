//! 协议检测工具模块
//!
//! 根据连接最开始的若干字节判断客户端使用的协议

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::error::{RatError, RatResult};

/// HTTP/2 连接前言
pub const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// 最多嗅探的字节数
pub const SNIFF_LIMIT: usize = 64;

/// 嗅探结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preface {
    /// HTTP/2 明文前言（先验知识）
    Http2,
    /// HTTP/1.x 请求行
    Http1,
    /// TLS 记录
    Tls,
    /// 数据不足以判断
    Incomplete,
    /// 无法识别
    Malformed,
}

const HTTP_METHODS: &[&[u8]] = &[
    b"GET", b"POST", b"PUT", b"DELETE", b"HEAD", b"OPTIONS", b"PATCH", b"TRACE", b"CONNECT",
];

/// 检测协议前言
pub fn detect_preface(data: &[u8]) -> Preface {
    if data.is_empty() {
        return Preface::Incomplete;
    }

    // TLS 握手记录: 0x16 0x03 xx
    if data[0] == 0x16 {
        return match data.get(1) {
            None => Preface::Incomplete,
            Some(0x03) => Preface::Tls,
            Some(_) => Preface::Malformed,
        };
    }

    // H2 前言以 "PRI " 开头，与 HTTP/1 方法不冲突
    let n = data.len().min(H2_PREFACE.len());
    if data[..n] == H2_PREFACE[..n] {
        return if n == H2_PREFACE.len() { Preface::Http2 } else { Preface::Incomplete };
    }

    detect_http1(data)
}

fn detect_http1(data: &[u8]) -> Preface {
    if !data.is_ascii() {
        return Preface::Malformed;
    }
    let token_end = data.iter().position(|&b| b == b' ');
    for method in HTTP_METHODS {
        match token_end {
            Some(end) if &data[..end] == *method => return Preface::Http1,
            None if method.starts_with(data) => return Preface::Incomplete,
            _ => {}
        }
    }
    // 扩展方法：任意 token 字符后跟空格
    match token_end {
        Some(end) if end > 0 && data[..end].iter().all(|b| b.is_ascii_uppercase() || *b == b'-' || *b == b'_') => {
            Preface::Http1
        }
        None if data.len() < 16 && data.iter().all(|b| b.is_ascii_uppercase()) => Preface::Incomplete,
        _ => Preface::Malformed,
    }
}

/// 从连接读取前言字节，直到可以判定协议、达到上限或超时
pub async fn sniff_preface(stream: &mut TcpStream, timeout: Duration) -> RatResult<(Preface, Vec<u8>)> {
    let mut buf = Vec::with_capacity(SNIFF_LIMIT);
    let mut chunk = [0u8; SNIFF_LIMIT];

    let read_loop = async {
        loop {
            let want = SNIFF_LIMIT - buf.len();
            let n = stream.read(&mut chunk[..want]).await?;
            if n == 0 {
                return Err(RatError::Protocol("客户端在发送前言前关闭连接".to_string()));
            }
            buf.extend_from_slice(&chunk[..n]);
            match detect_preface(&buf) {
                Preface::Incomplete if buf.len() < SNIFF_LIMIT => continue,
                Preface::Incomplete => return Ok(Preface::Malformed),
                other => return Ok(other),
            }
        }
    };

    match tokio::time::timeout(timeout, read_loop).await {
        Ok(result) => result.map(|p| (p, buf)),
        Err(_) => Err(RatError::Protocol(format!("前言读取超时 ({:?})", timeout))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_h2_preface_and_prefix() {
        assert_eq!(detect_preface(H2_PREFACE), Preface::Http2);
        assert_eq!(detect_preface(b"PRI * HTTP/2"), Preface::Incomplete);
        assert_eq!(detect_preface(b"\x00\x00\x12\x04"), Preface::Malformed);
    }

    #[test]
    fn test_http1_request_line() {
        assert_eq!(detect_preface(b"GET / HTTP/1.1\r\n"), Preface::Http1);
        assert_eq!(detect_preface(b"POS"), Preface::Incomplete);
        assert_eq!(detect_preface(b"PROPFIND /x HTTP/1.1"), Preface::Http1);
        assert_eq!(detect_preface(b"get / HTTP/1.1"), Preface::Malformed);
        assert_eq!(detect_preface(&[0xff, 0xfe, 0x00]), Preface::Malformed);
    }

    #[test]
    fn test_tls_record() {
        assert_eq!(detect_preface(&[0x16, 0x03, 0x01, 0x02, 0x00]), Preface::Tls);
        assert_eq!(detect_preface(&[0x16]), Preface::Incomplete);
        assert_eq!(detect_preface(&[0x16, 0x99]), Preface::Malformed);
    }
}
