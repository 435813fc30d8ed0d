//!
//! # 停止事件
//! 可跨任务共享的取消标志，支持带超时的等待；同一个事件可以被多个下载实例引用
//!

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

pub struct StopEvent {
    setted: AtomicBool,
    notify: Notify,
}

impl StopEvent {
    pub fn new() -> Self {
        Self {
            setted: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn set(&self) {
        self.setted.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// 复位后事件可以再次被等待，每次 start 前由引擎调用
    pub fn unset(&self) {
        self.setted.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.setted.load(Ordering::Acquire)
    }

    /// 等待事件被置位，最多等待 timeout，返回当前是否已置位
    pub async fn wait(&self, timeout: Duration) -> bool {
        if self.is_set() {
            return true;
        }

        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
        self.is_set()
    }
}

impl Default for StopEvent {
    fn default() -> Self {
        Self::new()
    }
}
