//! 事件处理器注册表

use crate::error::HandlerError;
use crate::event::SocketIoEvent;
use crate::lock;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tracing::error;

/// 事件回调类型，按 `Arc` 身份移除
pub type Handler = Arc<dyn Fn(&SocketIoEvent) + Send + Sync>;

/// 事件名 → 回调列表（注册顺序即调用顺序）
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Mutex<HashMap<String, Vec<Handler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加回调，同一回调可注册多次
    pub fn on(&self, name: &str, handler: Handler) {
        lock(&self.handlers)
            .entry(name.to_string())
            .or_default()
            .push(handler);
    }

    /// 移除第一个相同的回调，找不到时什么也不做
    pub fn off(&self, name: &str, handler: &Handler) {
        let mut handlers = lock(&self.handlers);
        let Some(list) = handlers.get_mut(name) else {
            return;
        };
        if let Some(index) = list.iter().position(|h| Arc::ptr_eq(h, handler)) {
            list.remove(index);
        }
        if list.is_empty() {
            handlers.remove(name);
        }
    }

    pub fn handler_count(&self, name: &str) -> usize {
        lock(&self.handlers).get(name).map_or(0, Vec::len)
    }

    /// 依次调用该事件的所有回调
    ///
    /// 先在锁内取快照再在锁外调用，回调里可以再次 `on`/`off`。
    /// 某个回调 panic 不影响后面的回调。
    pub fn dispatch(&self, event: &SocketIoEvent) -> Vec<HandlerError> {
        let snapshot = match lock(&self.handlers).get(event.name()) {
            Some(list) => list.clone(),
            None => return Vec::new(),
        };

        let mut failures = Vec::new();
        for handler in snapshot {
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                let err = HandlerError::from_panic(event.name(), panic);
                error!("[Handlers] {}", err);
                failures.push(err);
            }
        }
        failures
    }
}
