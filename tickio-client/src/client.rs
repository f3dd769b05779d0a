//! Socket.IO 客户端实现
//!
//! [`SocketClient`] 持有连接管理器、事件处理器和后台任务。宿主按自己的节奏调用
//! [`SocketClient::tick`]，事件、Ack 回调和连接状态变化都在那一刻、那个线程上交付。

use crate::config::SocketConfig;
use crate::connection::ConnectionManager;
use crate::error::{ErrorKind, HandlerError, SocketError, TransportError};
use crate::event::{Handshake, SocketIoEvent, EVENT_ERROR};
use crate::handlers::{Handler, HandlerRegistry};
use crate::heartbeat::run_heartbeat_loop;
use crate::lock;
use crate::packet::{self, Packet};
use crate::transport::{Transport, WsTransport};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, Runtime, RuntimeFlavor};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 关闭时等待后台任务退出的上限
const CLOSE_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// 一次 `tick()` 的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// 交付的事件数（含合成事件）
    pub events: usize,
    pub acks_resolved: usize,
    pub acks_expired: usize,
    /// panic 的回调数
    pub handler_failures: usize,
}

/// 一次 `connect()` 启动的后台任务
struct Loops {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Socket 客户端
pub struct SocketClient {
    conn: Arc<ConnectionManager>,
    handlers: HandlerRegistry,
    handle: Handle,
    /// `new()` 自建的运行时，`with_handle` 时为空
    runtime: Option<Runtime>,
    loops: Mutex<Option<Loops>>,
}

impl SocketClient {
    /// 创建客户端，自带 2 个工作线程的运行时
    pub fn new(config: SocketConfig) -> Result<Self, SocketError> {
        config.validate()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("tickio-io")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let transport = Arc::new(WsTransport::new(&config));
        Self::build(config, handle, transport, Some(runtime))
    }

    /// 使用宿主提供的运行时
    ///
    /// 单线程运行时需要宿主自己驱动（`Runtime::block_on`），否则后台任务不会前进；
    /// 这种情况下 `close()` 不等待后台任务，只把回收交给运行时。
    pub fn with_handle(config: SocketConfig, handle: Handle) -> Result<Self, SocketError> {
        config.validate()?;
        let transport = Arc::new(WsTransport::new(&config));
        Self::build(config, handle, transport, None)
    }

    /// 使用自定义传输层，运行时要求同 [`SocketClient::with_handle`]
    pub fn with_transport(
        config: SocketConfig,
        handle: Handle,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, SocketError> {
        config.validate()?;
        Self::build(config, handle, transport, None)
    }

    fn build(
        config: SocketConfig,
        handle: Handle,
        transport: Arc<dyn Transport>,
        runtime: Option<Runtime>,
    ) -> Result<Self, SocketError> {
        let auto_connect = config.auto_connect;
        let client = Self {
            conn: Arc::new(ConnectionManager::new(config, transport)),
            handlers: HandlerRegistry::new(),
            handle,
            runtime,
            loops: Mutex::new(None),
        };
        if auto_connect {
            client.connect();
        }
        Ok(client)
    }

    /// 请求连接，启动传输维持循环和心跳循环
    ///
    /// 已请求时什么也不做。连接结果通过 `open` / `connect` / `error` 事件报告。
    pub fn connect(&self) {
        if self.conn.set_requested(true) {
            debug!("[SocketClient] Connect already requested");
            return;
        }

        info!("[SocketClient] Connecting to {}", self.conn.config().url);
        let (shutdown, rx) = watch::channel(false);
        let tasks = vec![
            self.handle
                .spawn(self.conn.clone().run_transport_loop(rx.clone())),
            self.handle.spawn(run_heartbeat_loop(self.conn.clone(), rx)),
        ];
        *lock(&self.loops) = Some(Loops { shutdown, tasks });
    }

    /// 断开连接并停止后台任务，可重复调用
    pub fn close(&self) {
        let was_requested = self.conn.set_requested(false);
        let loops = lock(&self.loops).take();
        if !was_requested && loops.is_none() {
            return;
        }

        info!("[SocketClient] Closing");
        let transport = self.conn.transport();
        if transport.is_connected() {
            // 尽力通知服务器，失败不上报
            let _ = transport.send(packet::encode(&Packet::disconnect()));
            let _ = transport.send(packet::encode(&Packet::close()));
        }
        if let Some(loops) = &loops {
            let _ = loops.shutdown.send(true);
        }
        self.conn.close_transport();

        if let Some(loops) = loops {
            self.join_loops(loops);
        }
    }

    fn join_loops(&self, loops: Loops) {
        let Loops { shutdown, tasks } = loops;
        let reaper = async move {
            let joined = async {
                for task in tasks {
                    let _ = task.await;
                }
            };
            if tokio::time::timeout(CLOSE_JOIN_TIMEOUT, joined).await.is_err() {
                warn!(
                    "[SocketClient] Background tasks still running after {:?}",
                    CLOSE_JOIN_TIMEOUT
                );
            }
            drop(shutdown);
        };

        // 运行时内部不能 block_on；单线程运行时的 Handle::block_on 驱动不了定时器和 I/O
        let can_block = Handle::try_current().is_err()
            && matches!(self.handle.runtime_flavor(), RuntimeFlavor::MultiThread);
        if can_block {
            self.handle.block_on(reaper);
        } else {
            debug!("[SocketClient] Background tasks will be reaped by the runtime");
            self.handle.spawn(reaper);
        }
    }

    /// 注册事件回调
    pub fn on(&self, name: &str, handler: Handler) {
        self.handlers.on(name, handler);
    }

    /// 移除事件回调（按 `Arc` 身份）
    pub fn off(&self, name: &str, handler: &Handler) {
        self.handlers.off(name, handler);
    }

    pub fn emit(&self, name: &str) -> Result<(), SocketError> {
        self.send_event(name, None, None)
    }

    pub fn emit_with_data(&self, name: &str, data: Value) -> Result<(), SocketError> {
        self.send_event(name, Some(data), None)
    }

    /// 发送事件并等待服务器回执，返回 packet id
    ///
    /// 回调在之后某次 `tick()` 中以回执的完整参数数组调用；
    /// 超过 `ack_expiration` 未回执则静默丢弃。
    pub fn emit_with_ack<F>(&self, name: &str, callback: F) -> Result<u64, SocketError>
    where
        F: FnOnce(Value) + Send + 'static,
    {
        self.send_event_with_ack(name, None, Box::new(callback))
    }

    pub fn emit_with_data_and_ack<F>(
        &self,
        name: &str,
        data: Value,
        callback: F,
    ) -> Result<u64, SocketError>
    where
        F: FnOnce(Value) + Send + 'static,
    {
        self.send_event_with_ack(name, Some(data), Box::new(callback))
    }

    fn send_event_with_ack(
        &self,
        name: &str,
        data: Option<Value>,
        callback: crate::ack::AckCallback,
    ) -> Result<u64, SocketError> {
        // 先登记再发送，避免回执比登记先到
        let packet_id = self.conn.acks().register(callback);
        if let Err(e) = self.send_event(name, data, Some(packet_id)) {
            self.conn.acks().cancel(packet_id);
            return Err(e);
        }
        Ok(packet_id)
    }

    fn send_event(&self, name: &str, data: Option<Value>, id: Option<u64>) -> Result<(), SocketError> {
        self.conn
            .send_packet(&Packet::event(name, data, id))
            .map_err(|e| match e {
                TransportError::NotConnected => SocketError::NotConnected,
                other => SocketError::EmitFailed(other.to_string()),
            })
    }

    /// 在调用线程上交付积压的事件
    ///
    /// 顺序：队列中的事件 → Ack 回执 → 连接状态变化 → 过期 Ack 清理。
    pub fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        for event in self.conn.queue().drain_events() {
            report.events += 1;
            let failures = self.handlers.dispatch(&event);
            self.record_failures(failures, &mut report);
        }

        for reply in self.conn.queue().drain_acks() {
            match self.conn.acks().resolve(reply.id, reply.payload) {
                Ok(true) => report.acks_resolved += 1,
                // 排队期间已过期
                Ok(false) => {}
                Err(failure) => {
                    report.acks_resolved += 1;
                    self.record_failures(vec![failure], &mut report);
                }
            }
        }

        if let Some(name) = self.conn.poll_connection_edge() {
            report.events += 1;
            let failures = self.handlers.dispatch(&SocketIoEvent::named(name));
            self.record_failures(failures, &mut report);
        }

        report.acks_expired = self
            .conn
            .acks()
            .sweep_expired(Instant::now(), self.conn.config().ack_expiration);
        report
    }

    /// 回调失败在下一次 tick 作为 `error` 事件交付；`error` 回调自身的失败只记日志
    fn record_failures(&self, failures: Vec<HandlerError>, report: &mut TickReport) {
        for failure in failures {
            report.handler_failures += 1;
            if failure.event != EVENT_ERROR {
                self.conn
                    .surface_error(ErrorKind::Handler, &failure.to_string());
            }
        }
    }

    pub fn sid(&self) -> Option<String> {
        self.conn.sid()
    }

    pub fn handshake(&self) -> Option<Handshake> {
        self.conn.handshake()
    }

    pub fn is_connection_requested(&self) -> bool {
        self.conn.is_requested()
    }

    pub fn is_transport_connected(&self) -> bool {
        self.conn.transport().is_connected()
    }

    pub fn pending_acks(&self) -> usize {
        self.conn.acks().len()
    }

    pub fn config(&self) -> &SocketConfig {
        self.conn.config()
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        self.close();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
