use std::sync::Once;

static CRYPTO_PROVIDER_INIT: Once = Once::new();

/// 确保 rustls 加密提供者只安装一次
///
/// 使用 std::sync::Once 保证无论被调用多少次，
/// ring 提供者的安装只会执行一次；嵌入方已安装其他提供者时保持不变
pub fn ensure_crypto_provider_installed() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider().install_default().is_err() {
            crate::utils::logger::debug!("🔐 [TLS] 已存在进程级加密提供者，沿用现有配置");
        } else {
            crate::utils::logger::debug!("🔐 [TLS] 已安装 ring 加密提供者");
        }
    });
}
