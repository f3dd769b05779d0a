//! 错误定义
//!
//! 按来源分类：解码、传输、回调。只负责分类和上报，不负责格式化输出。

use serde::Serialize;
use thiserror::Error;

/// 客户端对外错误
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Emit failed: {0}")]
    EmitFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// 线路帧解码错误
///
/// 单个坏帧不会终止会话，由连接管理器转成 `error` 事件。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,

    #[error("unknown engine packet type '{0}'")]
    UnknownEngineType(char),

    #[error("message frame without socket packet type")]
    MissingSocketType,

    #[error("unknown socket packet type '{0}'")]
    UnknownSocketType(char),

    #[error("invalid packet id: {0}")]
    InvalidId(String),

    #[error("invalid JSON payload: {0}")]
    InvalidPayload(String),

    #[error("invalid event payload: {0}")]
    InvalidEvent(String),
}

/// 传输层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("invalid handshake request: {0}")]
    InvalidRequest(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// 事件回调执行失败（panic 被捕获）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("handler for '{event}' failed: {message}")]
pub struct HandlerError {
    pub event: String,
    pub message: String,
}

impl HandlerError {
    pub(crate) fn from_panic(event: &str, panic: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = panic.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = panic.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self {
            event: event.to_string(),
            message,
        }
    }
}

/// `error` 事件里携带的错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Decode,
    TransportSend,
    Transport,
    Handler,
    /// 服务器发来的 Socket.IO Error 包
    Server,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_from_panic_payloads() {
        let err = HandlerError::from_panic("chat", Box::new("boom"));
        assert_eq!(err.message, "boom");

        let err = HandlerError::from_panic("chat", Box::new(String::from("owned")));
        assert_eq!(err.message, "owned");
        assert_eq!(err.to_string(), "handler for 'chat' failed: owned");

        let err = HandlerError::from_panic("chat", Box::new(42u32));
        assert_eq!(err.message, "non-string panic payload");
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let value = serde_json::to_value(ErrorKind::TransportSend).unwrap();
        assert_eq!(value, "transport_send");
    }
}
