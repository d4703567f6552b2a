//! Root Hub 事件
//!
//! 中断和定时器路径只负责把变化推进队列，Hub 驱动在任务上下文里取出处理。

use alloc::vec::Vec;
use core::{
    future::Future,
    task::{Poll, Waker},
};

use crossbeam::queue::SegQueue;
use futures::{future::poll_fn, task::AtomicWaker};
use usb_if::host::hub::PortStatusChange;

/// Root Hub 事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    /// 端口状态变化，`port` 为 1-based
    PortChange {
        port: u8,
        change: PortStatusChange,
    },

    /// 复位或恢复信号到期，需要再查询一次端口状态
    PortDeadline { port: u8 },

    /// 总线挂起期间检测到唤醒，需要恢复 Root Hub
    ResumeRootHub,
}

/// Hub 事件处理器
///
/// 使用无锁队列，可在中断上下文中推送。
pub struct HubEventHandler {
    events: SegQueue<HubEvent>,
    waker: AtomicWaker,
}

impl HubEventHandler {
    pub fn new() -> Self {
        Self {
            events: SegQueue::new(),
            waker: AtomicWaker::new(),
        }
    }

    /// 推送事件并唤醒等待者
    pub fn push(&self, event: HubEvent) {
        trace!("hub event: {event:?}");
        self.events.push(event);
        self.waker.wake();
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// 弹出所有待处理事件
    pub fn drain(&self) -> Vec<HubEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.events.pop() {
            events.push(event);
        }
        events
    }

    pub fn register(&self, waker: &Waker) {
        self.waker.register(waker);
    }

    /// 等待至少一个事件
    pub fn wait(&self) -> impl Future<Output = Vec<HubEvent>> + '_ {
        poll_fn(move |cx| {
            if self.has_events() {
                return Poll::Ready(self.drain());
            }
            self.register(cx.waker());
            // 注册之后再查一次，避免丢失注册前推送的事件
            if self.has_events() {
                Poll::Ready(self.drain())
            } else {
                Poll::Pending
            }
        })
    }
}

impl Default for HubEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_wait() {
        let handler = HubEventHandler::new();
        handler.push(HubEvent::PortDeadline { port: 1 });
        handler.push(HubEvent::ResumeRootHub);

        let events = spin_on::spin_on(handler.wait());
        assert_eq!(
            events,
            [HubEvent::PortDeadline { port: 1 }, HubEvent::ResumeRootHub]
        );
        assert!(!handler.has_events());
    }
}
