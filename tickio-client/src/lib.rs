//! Socket.IO 客户端
//!
//! Engine.IO v3 / Socket.IO v2 文本协议（仅 WebSocket）。
//! 网络 I/O 在后台 tokio 任务上进行，所有用户回调只在宿主调用 `tick()` 时触发。

mod ack;
mod client;
mod config;
mod connection;
mod dispatch;
mod error;
mod event;
mod handlers;
mod heartbeat;
pub mod packet;
mod transport;

pub use ack::{AckCallback, AckRegistry};
pub use client::{SocketClient, TickReport};
pub use config::{SocketConfig, TlsConfig, DEFAULT_URL};
pub use connection::ConnectionManager;
pub use dispatch::{AckReply, DispatchQueue};
pub use error::{DecodeError, ErrorKind, HandlerError, SocketError, TransportError};
pub use event::{
    Handshake, SocketIoEvent, EVENT_CLOSE, EVENT_CONNECT, EVENT_DISCONNECT, EVENT_ERROR,
    EVENT_OPEN,
};
pub use handlers::{Handler, HandlerRegistry};
pub use heartbeat::{ping_cycle, CycleOutcome, Heartbeat};
pub use packet::{EnginePacketType, Packet, PacketKind, SocketPacketType};
pub use transport::{Transport, TransportListener, WsTransport};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// 加锁；回调在锁外执行，锁中毒时数据仍然一致，直接取回
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
