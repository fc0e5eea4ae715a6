//! 安全传输层
//!
//! 核心只依赖 `SecureTransport` 接口：交给它一个原始连接，拿回加密后的连接和 ALPN 结果。
//! 默认实现基于 rustls。

use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;

use crate::error::{RatError, RatResult};
use crate::server::protocol_negotiator::EnabledProtocols;
use crate::utils::crypto_provider::ensure_crypto_provider_installed;
use crate::utils::logger::debug;

/// 连接 IO 的统一约束
pub trait ConnIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ConnIo for T {}

pub type BoxedIo = Box<dyn ConnIo>;

/// 安全传输
#[async_trait]
pub trait SecureTransport: Send + Sync {
    /// 完成握手，返回加密连接与协商出的 ALPN 协议
    async fn accept(&self, io: BoxedIo) -> RatResult<(BoxedIo, Option<Vec<u8>>)>;
}

/// rustls 实现
#[derive(Debug, Clone)]
pub struct RustlsTransport {
    config: Arc<rustls::ServerConfig>,
}

impl RustlsTransport {
    /// 使用现成的 rustls 配置，ALPN 由调用方负责
    pub fn new(config: Arc<rustls::ServerConfig>) -> Self {
        Self { config }
    }

    /// 按启用的协议设置 ALPN
    pub fn with_protocols(mut config: rustls::ServerConfig, enabled: EnabledProtocols) -> Self {
        config.alpn_protocols = enabled.alpn_protocols();
        debug!(
            "🔐 [TLS] ALPN: {:?}",
            config.alpn_protocols.iter().map(|p| String::from_utf8_lossy(p).into_owned()).collect::<Vec<_>>()
        );
        Self { config: Arc::new(config) }
    }

    /// 从 PEM 格式的证书链和私钥构建
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], enabled: EnabledProtocols) -> RatResult<Self> {
        ensure_crypto_provider_installed();
        let certs = CertificateDer::pem_slice_iter(cert_pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RatError::Tls(format!("解析证书失败: {}", e)))?;
        if certs.is_empty() {
            return Err(RatError::Tls("证书 PEM 中没有证书".to_string()));
        }
        let key = PrivateKeyDer::from_pem_slice(key_pem).map_err(|e| RatError::Tls(format!("解析私钥失败: {}", e)))?;
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| RatError::Tls(format!("创建 TLS 配置失败: {}", e)))?;
        Ok(Self::with_protocols(config, enabled))
    }

    pub fn config(&self) -> &Arc<rustls::ServerConfig> {
        &self.config
    }
}

#[async_trait]
impl SecureTransport for RustlsTransport {
    async fn accept(&self, io: BoxedIo) -> RatResult<(BoxedIo, Option<Vec<u8>>)> {
        let acceptor = TlsAcceptor::from(self.config.clone());
        let stream = acceptor.accept(io).await.map_err(|e| RatError::Tls(format!("TLS 握手失败: {}", e)))?;
        let alpn = stream.get_ref().1.alpn_protocol().map(|p| p.to_vec());
        debug!("🔐 [TLS] 握手完成, ALPN: {:?}", alpn.as_deref().map(String::from_utf8_lossy));
        Ok((Box::new(stream), alpn))
    }
}
