//! 线路帧编解码
//!
//! 帧格式：
//!
//! ```text
//! <engine 类型> [ <socket 类型> [<namespace>,] [<id>] ] <JSON 负载>
//! ```
//!
//! 例如 `42["chat",{"msg":"hi"}]` 表示 Message + Event，默认命名空间，无 id。

use crate::error::DecodeError;
use serde_json::Value;
use std::fmt::Write;

/// 默认命名空间
pub const DEFAULT_NAMESPACE: &str = "/";

/// Engine.IO 层包类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EnginePacketType {
    Open = 0,
    Close = 1,
    Ping = 2,
    Pong = 3,
    Message = 4,
    Upgrade = 5,
    Noop = 6,
}

impl EnginePacketType {
    pub fn from_digit(c: char) -> Option<Self> {
        match c {
            '0' => Some(Self::Open),
            '1' => Some(Self::Close),
            '2' => Some(Self::Ping),
            '3' => Some(Self::Pong),
            '4' => Some(Self::Message),
            '5' => Some(Self::Upgrade),
            '6' => Some(Self::Noop),
            _ => None,
        }
    }

    pub fn digit(self) -> char {
        char::from(b'0' + self as u8)
    }
}

/// Socket.IO 层包类型，只在 Message 帧内有意义
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SocketPacketType {
    Connect = 0,
    Disconnect = 1,
    Event = 2,
    Ack = 3,
    Error = 4,
    BinaryEvent = 5,
    BinaryAck = 6,
}

impl SocketPacketType {
    pub fn from_digit(c: char) -> Option<Self> {
        match c {
            '0' => Some(Self::Connect),
            '1' => Some(Self::Disconnect),
            '2' => Some(Self::Event),
            '3' => Some(Self::Ack),
            '4' => Some(Self::Error),
            '5' => Some(Self::BinaryEvent),
            '6' => Some(Self::BinaryAck),
            _ => None,
        }
    }

    pub fn digit(self) -> char {
        char::from(b'0' + self as u8)
    }
}

/// 包的形态
///
/// socket 类型、命名空间、id 只存在于 `Message` 中，其他类型无法误读这些字段。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketKind {
    Open,
    Close,
    Ping,
    Pong,
    Message {
        socket_type: SocketPacketType,
        namespace: String,
        /// `None` 表示不需要 ack
        id: Option<u64>,
    },
    Upgrade,
    Noop,
}

/// 线路上的一个包
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub kind: PacketKind,
    pub payload: Option<Value>,
}

impl Packet {
    pub fn new(kind: PacketKind, payload: Option<Value>) -> Self {
        Self { kind, payload }
    }

    pub fn ping() -> Self {
        Self::new(PacketKind::Ping, None)
    }

    pub fn pong() -> Self {
        Self::new(PacketKind::Pong, None)
    }

    pub fn close() -> Self {
        Self::new(PacketKind::Close, None)
    }

    /// 默认命名空间下的 Message 包
    pub fn message(socket_type: SocketPacketType, id: Option<u64>, payload: Option<Value>) -> Self {
        Self::new(
            PacketKind::Message {
                socket_type,
                namespace: DEFAULT_NAMESPACE.to_string(),
                id,
            },
            payload,
        )
    }

    /// 事件包，负载为 `[name, data?]`
    pub fn event(name: &str, data: Option<Value>, id: Option<u64>) -> Self {
        let mut args = vec![Value::String(name.to_string())];
        args.extend(data);
        Self::message(SocketPacketType::Event, id, Some(Value::Array(args)))
    }

    pub fn disconnect() -> Self {
        Self::message(SocketPacketType::Disconnect, None, None)
    }

    pub fn engine_type(&self) -> EnginePacketType {
        match self.kind {
            PacketKind::Open => EnginePacketType::Open,
            PacketKind::Close => EnginePacketType::Close,
            PacketKind::Ping => EnginePacketType::Ping,
            PacketKind::Pong => EnginePacketType::Pong,
            PacketKind::Message { .. } => EnginePacketType::Message,
            PacketKind::Upgrade => EnginePacketType::Upgrade,
            PacketKind::Noop => EnginePacketType::Noop,
        }
    }

    /// Message 包的 socket 类型
    pub fn socket_type(&self) -> Option<SocketPacketType> {
        match self.kind {
            PacketKind::Message { socket_type, .. } => Some(socket_type),
            _ => None,
        }
    }

    /// Message 包的 id
    pub fn id(&self) -> Option<u64> {
        match self.kind {
            PacketKind::Message { id, .. } => id,
            _ => None,
        }
    }
}

/// 编码为线路文本
pub fn encode(packet: &Packet) -> String {
    let mut out = String::new();
    out.push(packet.engine_type().digit());

    if let PacketKind::Message {
        socket_type,
        namespace,
        id,
    } = &packet.kind
    {
        out.push(socket_type.digit());
        if namespace != DEFAULT_NAMESPACE {
            out.push_str(namespace);
            out.push(',');
        }
        if let Some(id) = id {
            let _ = write!(out, "{}", id);
        }
    }

    if let Some(payload) = &packet.payload {
        out.push_str(&payload.to_string());
    }
    out
}

/// 解码线路文本
///
/// Message 负载永远不会是裸数字：紧跟在类型位之后的数字总被当作 id。
pub fn decode(raw: &str) -> Result<Packet, DecodeError> {
    let first = raw.chars().next().ok_or(DecodeError::Empty)?;
    let engine =
        EnginePacketType::from_digit(first).ok_or(DecodeError::UnknownEngineType(first))?;
    let rest = &raw[first.len_utf8()..];

    let kind = match engine {
        EnginePacketType::Message => return decode_message(rest),
        EnginePacketType::Open => PacketKind::Open,
        EnginePacketType::Close => PacketKind::Close,
        EnginePacketType::Ping => PacketKind::Ping,
        EnginePacketType::Pong => PacketKind::Pong,
        EnginePacketType::Upgrade => PacketKind::Upgrade,
        EnginePacketType::Noop => PacketKind::Noop,
    };

    Ok(Packet::new(kind, parse_payload(rest)?))
}

fn decode_message(body: &str) -> Result<Packet, DecodeError> {
    let first = body.chars().next().ok_or(DecodeError::MissingSocketType)?;
    let socket_type =
        SocketPacketType::from_digit(first).ok_or(DecodeError::UnknownSocketType(first))?;
    let mut rest = &body[first.len_utf8()..];

    let mut namespace = DEFAULT_NAMESPACE.to_string();
    if rest.starts_with('/') {
        match rest.find(',') {
            Some(end) => {
                namespace = rest[..end].to_string();
                rest = &rest[end + 1..];
            }
            None => {
                namespace = rest.to_string();
                rest = "";
            }
        }
    }

    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    let id = if digits > 0 {
        let id = rest[..digits]
            .parse::<u64>()
            .map_err(|e| DecodeError::InvalidId(e.to_string()))?;
        rest = &rest[digits..];
        Some(id)
    } else {
        None
    };

    Ok(Packet::new(
        PacketKind::Message {
            socket_type,
            namespace,
            id,
        },
        parse_payload(rest)?,
    ))
}

fn parse_payload(text: &str) -> Result<Option<Value>, DecodeError> {
    if text.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(text)
        .map(Some)
        .map_err(|e| DecodeError::InvalidPayload(e.to_string()))
}
