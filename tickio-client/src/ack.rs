//! Ack 注册表
//!
//! 记录等待服务器回执的回调。插入顺序即 id 顺序即年龄顺序，
//! 所以过期清理只需从队头开始检查。

use crate::error::HandlerError;
use crate::lock;
use serde_json::Value;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Ack 回调，最多调用一次
pub type AckCallback = Box<dyn FnOnce(Value) + Send>;

struct Ack {
    packet_id: u64,
    callback: AckCallback,
    created_at: Instant,
}

struct Inner {
    last_id: u64,
    pending: VecDeque<Ack>,
}

/// 线程安全的 Ack 注册表
pub struct AckRegistry {
    inner: Mutex<Inner>,
}

impl AckRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                last_id: 0,
                pending: VecDeque::new(),
            }),
        }
    }

    /// 分配下一个 packet id 并登记回调
    pub fn register(&self, callback: AckCallback) -> u64 {
        self.register_at(callback, Instant::now())
    }

    pub(crate) fn register_at(&self, callback: AckCallback, now: Instant) -> u64 {
        let mut inner = lock(&self.inner);
        inner.last_id += 1;
        let packet_id = inner.last_id;
        inner.pending.push_back(Ack {
            packet_id,
            callback,
            created_at: now,
        });
        debug!("[AckRegistry] Registered ack {}", packet_id);
        packet_id
    }

    /// 是否仍在等待该 id
    pub fn contains(&self, packet_id: u64) -> bool {
        lock(&self.inner)
            .pending
            .iter()
            .any(|ack| ack.packet_id == packet_id)
    }

    /// 取出匹配的 Ack 并调用回调
    ///
    /// 没有匹配时返回 `Ok(false)`。回调在锁外执行，panic 被捕获为 `HandlerError`。
    pub fn resolve(&self, packet_id: u64, payload: Value) -> Result<bool, HandlerError> {
        let Some(ack) = self.take(packet_id) else {
            debug!("[AckRegistry] No pending ack for {}", packet_id);
            return Ok(false);
        };

        let callback = ack.callback;
        panic::catch_unwind(AssertUnwindSafe(move || callback(payload))).map_err(|panic| {
            let err = HandlerError::from_panic(&format!("ack:{}", packet_id), panic);
            error!("[AckRegistry] {}", err);
            err
        })?;
        Ok(true)
    }

    /// 丢弃一个 Ack 而不调用（例如请求没发出去）
    pub fn cancel(&self, packet_id: u64) -> bool {
        self.take(packet_id).is_some()
    }

    /// 移除所有超过 `window` 的 Ack，回调不会被调用
    pub fn sweep_expired(&self, now: Instant, window: Duration) -> usize {
        let mut inner = lock(&self.inner);
        let mut removed = 0;
        while let Some(front) = inner.pending.front() {
            if now.saturating_duration_since(front.created_at) <= window {
                break;
            }
            if let Some(ack) = inner.pending.pop_front() {
                debug!("[AckRegistry] Ack {} expired", ack.packet_id);
            }
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self, packet_id: u64) -> Option<Ack> {
        let mut inner = lock(&self.inner);
        let index = inner
            .pending
            .iter()
            .position(|ack| ack.packet_id == packet_id)?;
        inner.pending.remove(index)
    }
}

impl Default for AckRegistry {
    fn default() -> Self {
        Self::new()
    }
}
