//! 压缩算法类型与 Accept-Encoding 协商

use serde::{Deserialize, Serialize};

/// 压缩算法类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    /// 不压缩
    Identity,
    /// Gzip 压缩
    Gzip,
    /// Deflate 压缩（zlib 封装）
    Deflate,
    /// Brotli 压缩
    #[serde(rename = "br")]
    Brotli,
}

impl CompressionType {
    /// 获取压缩算法名称
    pub fn name(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
            Self::Brotli => "br",
        }
    }

    /// 获取 Content-Encoding 头部值
    pub fn header_value(&self) -> &'static str {
        self.name()
    }

    /// 从字符串解析压缩类型
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "identity" | "none" => Some(Self::Identity),
            "gzip" | "x-gzip" => Some(Self::Gzip),
            "deflate" => Some(Self::Deflate),
            "br" => Some(Self::Brotli),
            _ => None,
        }
    }

    /// 当前构建是否带有该算法的编码器
    pub fn is_available(&self) -> bool {
        match self {
            Self::Identity => true,
            Self::Gzip | Self::Deflate => cfg!(feature = "compression"),
            Self::Brotli => cfg!(feature = "compression-br"),
        }
    }

    /// 当前构建默认启用的算法，按服务端优先顺序排列
    pub fn default_algorithms() -> Vec<Self> {
        [Self::Brotli, Self::Gzip, Self::Deflate]
            .into_iter()
            .filter(|t| t.is_available())
            .collect()
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Accept-Encoding 中的一项
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptEntry {
    pub token: String,
    pub q: f32,
}

/// 解析 Accept-Encoding 头部，非法 q 值按 0 处理
pub fn parse_accept_encoding(header: &str) -> Vec<AcceptEntry> {
    header
        .split(',')
        .filter_map(|part| {
            let mut pieces = part.split(';');
            let token = pieces.next()?.trim().to_ascii_lowercase();
            if token.is_empty() {
                return None;
            }
            let mut q = 1.0f32;
            for param in pieces {
                let param = param.trim();
                if let Some(value) = param.strip_prefix("q=").or_else(|| param.strip_prefix("Q=")) {
                    q = match value.trim().parse::<f32>() {
                        Ok(v) if (0.0..=1.0).contains(&v) => v,
                        _ => 0.0,
                    };
                }
            }
            Some(AcceptEntry { token, q })
        })
        .collect()
}

/// 根据 Accept-Encoding 和服务端支持的算法选择编码
///
/// q 值最高者胜出；q 值相同时按服务端声明顺序；
/// 没有共同编码时返回 `Identity`
pub fn negotiate_encoding(accept_encoding: Option<&str>, supported: &[CompressionType]) -> CompressionType {
    let header = match accept_encoding {
        Some(h) if !h.trim().is_empty() => h,
        _ => return CompressionType::Identity,
    };

    let entries = parse_accept_encoding(header);
    let q_for = |token: &str| -> Option<f32> {
        entries.iter().find(|e| e.token == token).map(|e| e.q)
    };
    let wildcard = q_for("*");

    let mut best: Option<(CompressionType, f32)> = None;
    for &algorithm in supported {
        if algorithm == CompressionType::Identity {
            continue;
        }
        let q = q_for(algorithm.name())
            .or_else(|| if algorithm == CompressionType::Gzip { q_for("x-gzip") } else { None })
            .or(wildcard)
            .unwrap_or(0.0);
        if q <= 0.0 {
            continue;
        }
        match best {
            Some((_, best_q)) if q <= best_q => {}
            _ => best = Some((algorithm, q)),
        }
    }

    match best {
        Some((algorithm, q)) => {
            // 客户端显式给 identity 更高的权重时不压缩
            match q_for("identity") {
                Some(identity_q) if identity_q > q => CompressionType::Identity,
                _ => algorithm,
            }
        }
        None => CompressionType::Identity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CompressionType::*;

    #[test]
    fn test_highest_q_wins() {
        let chosen = negotiate_encoding(Some("gzip;q=0.5, br;q=1.0"), &[Gzip, Brotli]);
        assert_eq!(chosen, Brotli);
    }

    #[test]
    fn test_ties_follow_server_order() {
        assert_eq!(negotiate_encoding(Some("gzip, br"), &[Brotli, Gzip]), Brotli);
        assert_eq!(negotiate_encoding(Some("br, gzip"), &[Gzip, Brotli]), Gzip);
    }

    #[test]
    fn test_q_zero_excludes() {
        assert_eq!(negotiate_encoding(Some("gzip;q=0, deflate"), &[Gzip, Deflate]), Deflate);
        assert_eq!(negotiate_encoding(Some("gzip;q=0"), &[Gzip]), Identity);
    }

    #[test]
    fn test_wildcard() {
        assert_eq!(negotiate_encoding(Some("*"), &[Gzip, Deflate]), Gzip);
        assert_eq!(negotiate_encoding(Some("*;q=0.2, gzip;q=0"), &[Gzip, Deflate]), Deflate);
    }

    #[test]
    fn test_no_common_encoding_is_identity() {
        assert_eq!(negotiate_encoding(Some("zstd"), &[Gzip]), Identity);
        assert_eq!(negotiate_encoding(None, &[Gzip]), Identity);
        assert_eq!(negotiate_encoding(Some("gzip"), &[]), Identity);
    }

    #[test]
    fn test_identity_preferred_explicitly() {
        assert_eq!(negotiate_encoding(Some("identity;q=1, gzip;q=0.3"), &[Gzip]), Identity);
    }

    #[test]
    fn test_invalid_q_treated_as_zero() {
        assert_eq!(negotiate_encoding(Some("gzip;q=abc, deflate;q=0.1"), &[Gzip, Deflate]), Deflate);
    }

    #[test]
    fn test_from_str_names() {
        assert_eq!(CompressionType::from_str("BR"), Some(Brotli));
        assert_eq!(CompressionType::from_str("identity"), Some(Identity));
        assert_eq!(CompressionType::from_str("lz4"), None);
    }
}
