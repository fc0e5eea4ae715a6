//! 日志模块
//!
//! 统一从这里引入日志宏，底层由 `rat_logger` 输出。
//! 日志器的初始化由嵌入方负责。

pub use rat_logger::{debug, error, info, warn};

/// 按字节预览数据，不可打印字符转义，用于 wiretap 调试输出
pub fn preview_bytes(data: &[u8], max: usize) -> String {
    let mut out = String::with_capacity(max.min(data.len()) * 2);
    for &b in data.iter().take(max) {
        match b {
            b'\r' => out.push_str("\\r"),
            b'\n' => out.push_str("\\n"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    if data.len() > max {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_escapes_control_bytes() {
        assert_eq!(preview_bytes(b"GET /\r\n", 64), "GET /\\r\\n");
        assert_eq!(preview_bytes(&[0x16, 0x03], 64), "\\x16\\x03");
        assert_eq!(preview_bytes(b"abcdef", 3), "abc...");
    }
}
