//! 流式压缩编码器
//!
//! 编码器写入共享缓冲区，每次 `encode` 之后取走已产出的压缩字节，
//! 整个响应体不会被完整缓存在内存中

use std::io::Write;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use super::types::CompressionType;
use crate::error::{RatError, RatResult};

/// 编码器输出缓冲区
#[derive(Clone, Default)]
struct SinkBuffer(Arc<Mutex<Vec<u8>>>);

impl SinkBuffer {
    fn take(&self) -> Bytes {
        match self.0.lock() {
            Ok(mut buf) => Bytes::from(std::mem::take(&mut *buf)),
            Err(poisoned) => Bytes::from(std::mem::take(&mut *poisoned.into_inner())),
        }
    }
}

impl Write for SinkBuffer {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let mut buf = self
            .0
            .lock()
            .map_err(|_| std::io::Error::other("压缩缓冲区锁已中毒"))?;
        buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

enum EncoderKind {
    #[cfg(feature = "compression")]
    Gzip(flate2::write::GzEncoder<SinkBuffer>),
    #[cfg(feature = "compression")]
    Deflate(flate2::write::ZlibEncoder<SinkBuffer>),
    #[cfg(feature = "compression-br")]
    Brotli(Box<brotli::CompressorWriter<SinkBuffer>>),
}

/// 流式编码器
pub struct StreamEncoder {
    algorithm: CompressionType,
    sink: SinkBuffer,
    kind: Option<EncoderKind>,
}

impl StreamEncoder {
    /// 为指定算法创建编码器，`Identity` 或未编译的算法返回错误
    pub fn new(algorithm: CompressionType, level: u32) -> RatResult<Self> {
        let sink = SinkBuffer::default();
        let level = level.clamp(1, 9);
        let kind = match algorithm {
            #[cfg(feature = "compression")]
            CompressionType::Gzip => EncoderKind::Gzip(flate2::write::GzEncoder::new(
                sink.clone(),
                flate2::Compression::new(level),
            )),
            #[cfg(feature = "compression")]
            CompressionType::Deflate => EncoderKind::Deflate(flate2::write::ZlibEncoder::new(
                sink.clone(),
                flate2::Compression::new(level),
            )),
            #[cfg(feature = "compression-br")]
            CompressionType::Brotli => {
                // brotli 质量 0-11，窗口 22 与 BrotliEncoderParams 默认一致
                let quality = (level + 2).min(11);
                EncoderKind::Brotli(Box::new(brotli::CompressorWriter::new(sink.clone(), 4096, quality, 22)))
            }
            other => {
                return Err(RatError::Config(format!("压缩算法 {} 在当前构建中不可用", other)));
            }
        };
        Ok(Self { algorithm, sink, kind: Some(kind) })
    }

    pub fn algorithm(&self) -> CompressionType {
        self.algorithm
    }

    fn writer(&mut self) -> RatResult<&mut dyn Write> {
        match self.kind.as_mut() {
            #[cfg(feature = "compression")]
            Some(EncoderKind::Gzip(e)) => Ok(e),
            #[cfg(feature = "compression")]
            Some(EncoderKind::Deflate(e)) => Ok(e),
            #[cfg(feature = "compression-br")]
            Some(EncoderKind::Brotli(e)) => Ok(e.as_mut()),
            #[allow(unreachable_patterns)]
            _ => Err(RatError::Protocol("编码器已结束".to_string())),
        }
    }

    /// 编码一段数据，返回目前已产出的压缩字节（可能为空）
    pub fn encode(&mut self, data: &[u8]) -> RatResult<Bytes> {
        self.writer()?.write_all(data)?;
        Ok(self.sink.take())
    }

    /// 同步刷新，保证已写入的数据可以被对端解码
    pub fn flush(&mut self) -> RatResult<Bytes> {
        self.writer()?.flush()?;
        Ok(self.sink.take())
    }

    /// 结束压缩流，返回尾部字节
    pub fn finish(&mut self) -> RatResult<Bytes> {
        match self.kind.take() {
            #[cfg(feature = "compression")]
            Some(EncoderKind::Gzip(e)) => {
                e.finish()?;
            }
            #[cfg(feature = "compression")]
            Some(EncoderKind::Deflate(e)) => {
                e.finish()?;
            }
            #[cfg(feature = "compression-br")]
            Some(EncoderKind::Brotli(e)) => {
                // into_inner 会写出结束块
                let _ = (*e).into_inner();
            }
            #[allow(unreachable_patterns)]
            _ => {}
        }
        Ok(self.sink.take())
    }
}

#[cfg(all(test, feature = "compression"))]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_gzip_streaming_output_decodes() {
        let mut encoder = StreamEncoder::new(CompressionType::Gzip, 6).unwrap();
        let mut compressed = Vec::new();
        for _ in 0..100 {
            compressed.extend_from_slice(&encoder.encode(b"hello backpressure ").unwrap());
        }
        compressed.extend_from_slice(&encoder.flush().unwrap());
        compressed.extend_from_slice(&encoder.finish().unwrap());

        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut out = String::new();
        decoder.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello backpressure ".repeat(100));
    }

    #[test]
    fn test_flush_produces_decodable_prefix() {
        let mut encoder = StreamEncoder::new(CompressionType::Deflate, 6).unwrap();
        let mut compressed = encoder.encode(b"data: ping\n\n").unwrap().to_vec();
        compressed.extend_from_slice(&encoder.flush().unwrap());
        assert!(!compressed.is_empty());

        let mut decoder = flate2::read::ZlibDecoder::new(&compressed[..]);
        let mut out = vec![0u8; 12];
        decoder.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"data: ping\n\n");
    }

    #[test]
    fn test_identity_has_no_encoder() {
        assert!(StreamEncoder::new(CompressionType::Identity, 6).is_err());
    }

    #[test]
    fn test_finish_twice_is_empty() {
        let mut encoder = StreamEncoder::new(CompressionType::Gzip, 1).unwrap();
        encoder.encode(b"x").unwrap();
        assert!(!encoder.finish().unwrap().is_empty());
        assert!(encoder.finish().unwrap().is_empty());
        assert!(encoder.encode(b"y").is_err());
    }
}
