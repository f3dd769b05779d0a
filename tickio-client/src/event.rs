//! 事件定义

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 合成事件名（由连接状态变化产生，而非服务器 Event 包）
pub const EVENT_OPEN: &str = "open";
pub const EVENT_CLOSE: &str = "close";
pub const EVENT_CONNECT: &str = "connect";
pub const EVENT_DISCONNECT: &str = "disconnect";
pub const EVENT_ERROR: &str = "error";

/// 交给订阅者的事件，构造后不可变
#[derive(Debug, Clone, PartialEq)]
pub struct SocketIoEvent {
    name: String,
    data: Option<Value>,
}

impl SocketIoEvent {
    pub fn new(name: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// 无数据的合成事件
    pub fn named(name: &str) -> Self {
        Self::new(name, None)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// 从 Event 包负载 `["name", arg...]` 解析
    ///
    /// 单个参数直接作为 data，多个参数打包为数组，没有参数时为 `None`。
    pub fn from_payload(payload: &Value) -> Result<Self, DecodeError> {
        let items = payload
            .as_array()
            .ok_or_else(|| DecodeError::InvalidEvent("payload is not an array".into()))?;
        let (first, args) = items
            .split_first()
            .ok_or_else(|| DecodeError::InvalidEvent("empty event array".into()))?;
        let name = first
            .as_str()
            .ok_or_else(|| DecodeError::InvalidEvent("event name is not a string".into()))?;

        let data = match args {
            [] => None,
            [single] => Some(single.clone()),
            many => Some(Value::Array(many.to_vec())),
        };
        Ok(Self::new(name, data))
    }
}

/// Open 包携带的握手信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    /// 毫秒
    #[serde(default)]
    pub ping_interval: Option<u64>,
    /// 毫秒
    #[serde(default)]
    pub ping_timeout: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_payload_single_argument() {
        let event = SocketIoEvent::from_payload(&json!(["chat", {"msg": "hi"}])).unwrap();
        assert_eq!(event.name(), "chat");
        assert_eq!(event.data(), Some(&json!({"msg": "hi"})));
    }

    #[test]
    fn test_from_payload_argument_counts() {
        let event = SocketIoEvent::from_payload(&json!(["boop"])).unwrap();
        assert_eq!(event.data(), None);

        let event = SocketIoEvent::from_payload(&json!(["move", 1, 2])).unwrap();
        assert_eq!(event.data(), Some(&json!([1, 2])));
    }

    #[test]
    fn test_from_payload_rejects_malformed() {
        assert!(SocketIoEvent::from_payload(&json!({"name": "x"})).is_err());
        assert!(SocketIoEvent::from_payload(&json!([])).is_err());
        assert!(SocketIoEvent::from_payload(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_handshake_deserialize() {
        let hs: Handshake = serde_json::from_value(json!({
            "sid": "abc",
            "upgrades": [],
            "pingInterval": 25000,
            "pingTimeout": 60000
        }))
        .unwrap();
        assert_eq!(hs.sid, "abc");
        assert_eq!(hs.ping_interval, Some(25000));

        let minimal: Handshake = serde_json::from_value(json!({"sid": "x"})).unwrap();
        assert!(minimal.upgrades.is_empty());
        assert_eq!(minimal.ping_timeout, None);
    }
}
