//! 心跳检测
//!
//! 客户端周期性发送 Ping，在 `ping_timeout` 内没有 Pong 则强制关闭传输层，
//! 交给连接循环重连。对端发来的 Ping 由连接管理器直接回 Pong，与这里无关。

use crate::connection::{sleep_or_shutdown, ConnectionManager};
use crate::packet::Packet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 等待 Pong 时的轮询间隔
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// 当前 Ping 周期的状态
#[derive(Debug, Default)]
pub struct Heartbeat {
    pinging: AtomicBool,
    pong_received: AtomicBool,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin_cycle(&self) {
        self.pong_received.store(false, Ordering::SeqCst);
        self.pinging.store(true, Ordering::SeqCst);
    }

    fn end_cycle(&self) {
        self.pinging.store(false, Ordering::SeqCst);
    }

    /// 收到 Pong，结束本周期
    pub fn on_pong(&self) {
        self.pong_received.store(true, Ordering::SeqCst);
        self.pinging.store(false, Ordering::SeqCst);
    }

    pub fn is_pinging(&self) -> bool {
        self.pinging.load(Ordering::SeqCst)
    }

    pub fn pong_received(&self) -> bool {
        self.pong_received.load(Ordering::SeqCst)
    }
}

/// 单个周期的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// 传输层未连接，没有发 Ping
    Skipped,
    PongReceived,
    /// 没等到 Pong，传输层已被关闭
    TimedOut,
    Shutdown,
}

/// 执行一次 Ping 周期
pub async fn ping_cycle(
    conn: &ConnectionManager,
    shutdown: &mut watch::Receiver<bool>,
) -> CycleOutcome {
    let transport = conn.transport();
    let config = conn.config();

    if !transport.is_connected() {
        return if sleep_or_shutdown(config.reconnect_delay, shutdown).await {
            CycleOutcome::Shutdown
        } else {
            CycleOutcome::Skipped
        };
    }

    let heartbeat = conn.heartbeat();
    heartbeat.begin_cycle();
    if conn.send_packet(&Packet::ping()).is_err() {
        debug!("[Heartbeat] Ping not sent");
    }
    let started = Instant::now();

    while transport.is_connected()
        && heartbeat.is_pinging()
        && started.elapsed() < config.ping_timeout
    {
        if sleep_or_shutdown(POLL_INTERVAL, shutdown).await {
            heartbeat.end_cycle();
            return CycleOutcome::Shutdown;
        }
    }
    heartbeat.end_cycle();

    if heartbeat.pong_received() {
        debug!("[Heartbeat] Pong after {:?}", started.elapsed());
        CycleOutcome::PongReceived
    } else {
        warn!(
            "[Heartbeat] No pong within {:?}, closing transport",
            config.ping_timeout
        );
        conn.close_transport();
        CycleOutcome::TimedOut
    }
}

/// 心跳循环，直到 shutdown
pub(crate) async fn run_heartbeat_loop(
    conn: Arc<ConnectionManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("[Heartbeat] Loop started");
    loop {
        match ping_cycle(&conn, &mut shutdown).await {
            CycleOutcome::Shutdown => break,
            CycleOutcome::Skipped => continue,
            CycleOutcome::PongReceived | CycleOutcome::TimedOut => {}
        }
        if sleep_or_shutdown(conn.config().ping_interval, &mut shutdown).await {
            break;
        }
    }
    info!("[Heartbeat] Loop stopped");
}
