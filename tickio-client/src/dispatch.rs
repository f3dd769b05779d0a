//! I/O 线程 → tick 线程的事件交接队列
//!
//! 生产者是传输层回调，消费者只有 `tick()`。每次 drain 在锁内整体换出，
//! 保证不丢、不重、按到达顺序交付。

use crate::event::SocketIoEvent;
use crate::lock;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

/// 等待在 tick 线程上解析的 Ack 回执
#[derive(Debug, Clone, PartialEq)]
pub struct AckReply {
    pub id: u64,
    pub payload: Value,
}

/// 两条独立的 FIFO：事件与 Ack 回执之间不保证相对顺序
#[derive(Default)]
pub struct DispatchQueue {
    events: Mutex<VecDeque<SocketIoEvent>>,
    acks: Mutex<VecDeque<AckReply>>,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_event(&self, event: SocketIoEvent) {
        lock(&self.events).push_back(event);
    }

    pub fn enqueue_ack(&self, reply: AckReply) {
        lock(&self.acks).push_back(reply);
    }

    /// 取走当前所有事件
    pub fn drain_events(&self) -> VecDeque<SocketIoEvent> {
        std::mem::take(&mut *lock(&self.events))
    }

    /// 取走当前所有 Ack 回执
    pub fn drain_acks(&self) -> VecDeque<AckReply> {
        std::mem::take(&mut *lock(&self.acks))
    }

    pub fn pending_events(&self) -> usize {
        lock(&self.events).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;

    fn names(events: VecDeque<SocketIoEvent>) -> Vec<String> {
        events.into_iter().map(|e| e.name().to_string()).collect()
    }

    #[test]
    fn test_fifo_across_partial_drains() {
        let queue = DispatchQueue::new();
        queue.enqueue_event(SocketIoEvent::named("a"));
        let first = queue.drain_events();
        queue.enqueue_event(SocketIoEvent::named("b"));
        queue.enqueue_event(SocketIoEvent::named("c"));
        let second = queue.drain_events();
        let third = queue.drain_events();

        assert_eq!(names(first), vec!["a"]);
        assert_eq!(names(second), vec!["b", "c"]);
        assert!(third.is_empty());
    }

    #[test]
    fn test_ack_queue_is_independent() {
        let queue = DispatchQueue::new();
        queue.enqueue_ack(AckReply {
            id: 2,
            payload: json!(["x"]),
        });
        queue.enqueue_event(SocketIoEvent::named("a"));

        let acks = queue.drain_acks();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].id, 2);
        assert_eq!(queue.pending_events(), 1);
    }

    #[test]
    fn test_concurrent_producers_lose_nothing() {
        let queue = Arc::new(DispatchQueue::new());
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        queue.enqueue_event(SocketIoEvent::new(format!("{}", p), Some(json!(i))));
                    }
                })
            })
            .collect();

        let mut seen: Vec<Vec<i64>> = vec![Vec::new(); 4];
        let mut total = 0;
        while total < 1000 {
            for event in queue.drain_events() {
                let producer: usize = event.name().parse().unwrap();
                seen[producer].push(event.data().unwrap().as_i64().unwrap());
                total += 1;
            }
        }
        for handle in producers {
            handle.join().unwrap();
        }

        assert!(queue.drain_events().is_empty());
        // 每个生产者内部保持顺序
        for per_producer in seen {
            assert_eq!(per_producer, (0..250).collect::<Vec<i64>>());
        }
    }
}
