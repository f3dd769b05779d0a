//! 客户端配置

use crate::error::SocketError;
use std::path::PathBuf;
use std::time::Duration;

/// 默认服务器地址（Engine.IO v3，仅 WebSocket）
pub const DEFAULT_URL: &str = "ws://127.0.0.1:4567/socket.io/?EIO=3&transport=websocket";

/// TLS 配置
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// CA 证书路径
    pub ca_cert_path: Option<PathBuf>,
    /// 客户端证书路径 (PEM 或 P12)
    pub client_cert_path: Option<PathBuf>,
    /// 客户端私钥路径 (PEM)，P12 时不需要
    pub client_key_path: Option<PathBuf>,
    /// P12 密码（如果使用 PKCS#12 格式）
    pub client_p12_password: Option<String>,
    /// 是否跳过服务器证书验证（仅开发用）
    pub danger_accept_invalid_certs: bool,
}

impl TlsConfig {
    pub(crate) fn is_empty(&self) -> bool {
        self.ca_cert_path.is_none()
            && self.client_cert_path.is_none()
            && !self.danger_accept_invalid_certs
    }
}

/// Socket 客户端配置，`connect()` 之前设置
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// WebSocket 地址
    pub url: String,
    /// 创建后立即连接
    pub auto_connect: bool,
    /// 重连轮询间隔
    pub reconnect_delay: Duration,
    /// Ack 过期时间，过期的回调直接丢弃
    pub ack_expiration: Duration,
    /// 两次 Ping 之间的间隔
    pub ping_interval: Duration,
    /// 等待 Pong 的超时，超时后强制关闭传输层
    pub ping_timeout: Duration,
    /// 握手时附加的 HTTP 头
    pub headers: Vec<(String, String)>,
    /// TLS 配置
    pub tls: TlsConfig,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            auto_connect: false,
            reconnect_delay: Duration::from_secs(5),
            ack_expiration: Duration::from_secs(30),
            ping_interval: Duration::from_secs(25),
            ping_timeout: Duration::from_secs(60),
            headers: Vec::new(),
            tls: TlsConfig::default(),
        }
    }
}

impl SocketConfig {
    pub fn with_url(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }

    /// 从环境变量覆盖默认值
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("TICKIO_URL") {
            config.url = url;
        }
        if let Ok(flag) = std::env::var("TICKIO_AUTO_CONNECT") {
            config.auto_connect = flag == "true" || flag == "1";
        }
        if let Some(ms) = env_millis("TICKIO_RECONNECT_DELAY_MS") {
            config.reconnect_delay = ms;
        }
        if let Some(ms) = env_millis("TICKIO_ACK_EXPIRATION_MS") {
            config.ack_expiration = ms;
        }
        if let Some(ms) = env_millis("TICKIO_PING_INTERVAL_MS") {
            config.ping_interval = ms;
        }
        if let Some(ms) = env_millis("TICKIO_PING_TIMEOUT_MS") {
            config.ping_timeout = ms;
        }
        config
    }

    /// 附加握手 HTTP 头
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn validate(&self) -> Result<(), SocketError> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(SocketError::InvalidUrl(self.url.clone()));
        }
        if self.ping_timeout.is_zero() {
            return Err(SocketError::InvalidConfig("ping_timeout must be positive".into()));
        }
        if self.reconnect_delay.is_zero() {
            return Err(SocketError::InvalidConfig(
                "reconnect_delay must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_config_default() {
        let config = SocketConfig::default();
        assert_eq!(config.url, DEFAULT_URL);
        assert!(!config.auto_connect);
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.ack_expiration, Duration::from_secs(30));
        assert_eq!(config.ping_interval, Duration::from_secs(25));
        assert_eq!(config.ping_timeout, Duration::from_secs(60));
        assert!(config.tls.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = SocketConfig::with_url("http://localhost:4567");
        assert!(matches!(config.validate(), Err(SocketError::InvalidUrl(_))));

        let config = SocketConfig {
            ping_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SocketError::InvalidConfig(_))));

        let config = SocketConfig {
            reconnect_delay: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SocketError::InvalidConfig(_))));
    }

    #[test]
    fn test_header_builder() {
        let config = SocketConfig::with_url("wss://example.com/socket.io/?EIO=3&transport=websocket")
            .header("Authorization", "Bearer t");
        assert_eq!(
            config.headers,
            vec![("Authorization".to_string(), "Bearer t".to_string())]
        );
        assert!(config.validate().is_ok());
    }
}
