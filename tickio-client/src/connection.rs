//! 连接管理
//!
//! 持有传输层生命周期与会话状态，把解码后的包分发给心跳、Ack 注册表和事件队列。
//! 所有用户回调都只进入队列，绝不在 I/O 任务上直接调用。

use crate::ack::AckRegistry;
use crate::config::SocketConfig;
use crate::dispatch::{AckReply, DispatchQueue};
use crate::error::{ErrorKind, TransportError};
use crate::event::{
    Handshake, SocketIoEvent, EVENT_CLOSE, EVENT_CONNECT, EVENT_DISCONNECT, EVENT_ERROR,
    EVENT_OPEN,
};
use crate::heartbeat::Heartbeat;
use crate::lock;
use crate::packet::{self, Packet, PacketKind, SocketPacketType, DEFAULT_NAMESPACE};
use crate::transport::{Transport, TransportListener};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// 睡眠 `duration`，期间收到 shutdown 则提前返回 `true`
pub(crate) async fn sleep_or_shutdown(
    duration: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

/// 连接管理器
pub struct ConnectionManager {
    config: SocketConfig,
    transport: Arc<dyn Transport>,
    /// 调用方是否要求保持连接
    requested: AtomicBool,
    /// 是否已发出 `open`（防止重复 open/close）
    is_open: AtomicBool,
    /// tick 线程最后一次观察到的传输层状态
    observed_connected: AtomicBool,
    handshake: Mutex<Option<Handshake>>,
    heartbeat: Heartbeat,
    acks: AckRegistry,
    queue: DispatchQueue,
}

impl ConnectionManager {
    pub fn new(config: SocketConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            requested: AtomicBool::new(false),
            is_open: AtomicBool::new(false),
            observed_connected: AtomicBool::new(false),
            handshake: Mutex::new(None),
            heartbeat: Heartbeat::new(),
            acks: AckRegistry::new(),
            queue: DispatchQueue::new(),
        }
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    pub fn acks(&self) -> &AckRegistry {
        &self.acks
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// 设置请求状态，返回之前的值
    pub(crate) fn set_requested(&self, requested: bool) -> bool {
        self.requested.swap(requested, Ordering::SeqCst)
    }

    pub fn sid(&self) -> Option<String> {
        lock(&self.handshake).as_ref().map(|h| h.sid.clone())
    }

    pub fn handshake(&self) -> Option<Handshake> {
        lock(&self.handshake).clone()
    }

    /// 编码并发送；失败时转成 `error` 事件并返回错误
    pub fn send_packet(&self, packet: &Packet) -> Result<(), TransportError> {
        let frame = packet::encode(packet);
        debug!("[Connection] Send {}", frame);
        self.transport.send(frame).map_err(|e| {
            warn!("[Connection] Send failed: {}", e);
            self.surface_error(ErrorKind::TransportSend, &e.to_string());
            e
        })
    }

    /// 把错误作为 `error` 事件排队
    pub fn surface_error(&self, kind: ErrorKind, message: &str) {
        self.queue.enqueue_event(SocketIoEvent::new(
            EVENT_ERROR,
            Some(json!({ "kind": kind, "message": message })),
        ));
    }

    /// 检测传输层连接状态的跳变，只在变化时返回事件名
    pub fn poll_connection_edge(&self) -> Option<&'static str> {
        let now = self.transport.is_connected();
        let before = self.observed_connected.swap(now, Ordering::SeqCst);
        if before == now {
            return None;
        }
        Some(if now { EVENT_CONNECT } else { EVENT_DISCONNECT })
    }

    fn mark_open(&self) {
        if !self.is_open.swap(true, Ordering::SeqCst) {
            info!("[Connection] Open");
            self.queue.enqueue_event(SocketIoEvent::named(EVENT_OPEN));
        }
    }

    fn mark_closed(&self) {
        if self.is_open.swap(false, Ordering::SeqCst) {
            info!("[Connection] Closed");
            self.queue.enqueue_event(SocketIoEvent::named(EVENT_CLOSE));
        }
    }

    /// 本端主动关闭传输层；传输层不会再回调 `on_close`，在这里补发 `close`
    pub(crate) fn close_transport(&self) {
        self.transport.close();
        self.mark_closed();
    }

    fn route(&self, packet: Packet) {
        match packet.kind {
            PacketKind::Open => {
                self.record_handshake(packet.payload);
                self.mark_open();
            }
            PacketKind::Close => self.mark_closed(),
            PacketKind::Ping => {
                let _ = self.send_packet(&Packet::pong());
            }
            PacketKind::Pong => self.heartbeat.on_pong(),
            PacketKind::Message {
                socket_type,
                namespace,
                id,
            } => self.route_message(socket_type, &namespace, id, packet.payload),
            PacketKind::Upgrade | PacketKind::Noop => {}
        }
    }

    fn record_handshake(&self, payload: Option<Value>) {
        let Some(payload) = payload else {
            warn!("[Connection] Open packet without handshake");
            return;
        };
        match serde_json::from_value::<Handshake>(payload) {
            Ok(handshake) => {
                info!("[Connection] Session id {}", handshake.sid);
                *lock(&self.handshake) = Some(handshake);
            }
            Err(e) => {
                warn!("[Connection] Bad handshake: {}", e);
                self.surface_error(ErrorKind::Decode, &format!("invalid handshake: {}", e));
            }
        }
    }

    fn route_message(
        &self,
        socket_type: SocketPacketType,
        namespace: &str,
        id: Option<u64>,
        payload: Option<Value>,
    ) {
        // 只加入了默认命名空间，其他命名空间的事件和应答不属于本客户端
        if namespace != DEFAULT_NAMESPACE
            && matches!(socket_type, SocketPacketType::Event | SocketPacketType::Ack)
        {
            debug!(
                "[Connection] Dropping {:?} on namespace {}",
                socket_type, namespace
            );
            return;
        }
        match socket_type {
            SocketPacketType::Event => {
                let Some(payload) = payload else {
                    self.surface_error(ErrorKind::Decode, "event packet without payload");
                    return;
                };
                match SocketIoEvent::from_payload(&payload) {
                    Ok(event) => {
                        debug!("[Connection] Event '{}'", event.name());
                        self.queue.enqueue_event(event);
                    }
                    Err(e) => self.surface_error(ErrorKind::Decode, &e.to_string()),
                }
            }
            SocketPacketType::Ack => match id {
                Some(id) if self.acks.contains(id) => {
                    self.queue.enqueue_ack(AckReply {
                        id,
                        payload: payload.unwrap_or(Value::Null),
                    });
                }
                Some(id) => debug!("[Connection] Ack {} has no pending callback", id),
                None => debug!("[Connection] Ack packet without id"),
            },
            SocketPacketType::Error => {
                let message = payload.map(|p| p.to_string()).unwrap_or_default();
                warn!("[Connection] Server error on {}: {}", namespace, message);
                self.surface_error(ErrorKind::Server, &message);
            }
            SocketPacketType::Connect => debug!("[Connection] Namespace {} connected", namespace),
            SocketPacketType::Disconnect => {
                info!("[Connection] Namespace {} disconnected by server", namespace)
            }
            SocketPacketType::BinaryEvent | SocketPacketType::BinaryAck => {
                debug!("[Connection] Binary packets are not supported, dropped")
            }
        }
    }

    /// 传输维持循环：未连接就连，已连接就等；唯一的重连机制，无次数上限
    pub(crate) async fn run_transport_loop(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("[Connection] Transport loop started");
        let delay = self.config.reconnect_delay;
        while self.is_requested() && !*shutdown.borrow() {
            if !self.transport.is_connected() {
                let listener: Arc<dyn TransportListener> = self.clone();
                if let Err(e) = self.transport.connect(listener).await {
                    warn!("[Connection] Connect failed: {}, retrying in {:?}", e, delay);
                    self.surface_error(ErrorKind::Transport, &e.to_string());
                } else if !self.is_requested() || *shutdown.borrow() {
                    // 握手期间调用了 close()，刚建立的连接不能留下
                    info!("[Connection] Closed while connecting, dropping new transport");
                    self.close_transport();
                    break;
                }
            }
            if sleep_or_shutdown(delay, &mut shutdown).await {
                break;
            }
        }
        info!("[Connection] Transport loop stopped");
    }
}

impl TransportListener for ConnectionManager {
    fn on_open(&self) {
        self.mark_open();
    }

    fn on_message(&self, raw: &str) {
        match packet::decode(raw) {
            Ok(packet) => self.route(packet),
            Err(e) => {
                warn!("[Connection] Dropping malformed frame {:?}: {}", raw, e);
                self.surface_error(ErrorKind::Decode, &e.to_string());
            }
        }
    }

    fn on_close(&self) {
        self.mark_closed();
    }

    fn on_error(&self, error: TransportError) {
        warn!("[Connection] Transport error: {}", error);
        self.surface_error(ErrorKind::Transport, &error.to_string());
    }
}
