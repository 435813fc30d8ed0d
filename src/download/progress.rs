//!
//! # 进度与速度上报
//! 两个小组件都只在驱动循环里被 tick，暂停期间自然冻结
//!

use std::time::{Duration, Instant};

use crate::download::downloader::{ProgressCallback, SpeedCallback};

/// 进度回调的最小触发间隔
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);
/// 速度按一秒窗口采样
const SPEED_INTERVAL: Duration = Duration::from_secs(1);

pub struct ProgressReporter {
    total: Option<u64>,
    last_emit: Option<Instant>,
    callback: ProgressCallback,
}

impl ProgressReporter {
    pub fn new(total: Option<u64>, callback: ProgressCallback) -> Self {
        Self {
            total,
            last_emit: None,
            callback,
        }
    }

    pub fn tick(&mut self, downloaded: u64) {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < PROGRESS_INTERVAL => {}
            _ => {
                self.last_emit = Some(now);
                (self.callback)(self.total, downloaded);
            }
        }
    }

    /// 收尾时强制上报一次最终进度
    pub fn finish(&mut self, downloaded: u64) {
        (self.callback)(self.total, downloaded);
    }
}

pub struct SpeedMeter {
    last_sample: Instant,
    last_bytes: u64,
    callback: SpeedCallback,
}

impl SpeedMeter {
    /// initial_bytes 是续传起点的已完成量，否则恢复下载的第一秒会算出夸张的速度
    pub fn new(initial_bytes: u64, callback: SpeedCallback) -> Self {
        Self {
            last_sample: Instant::now(),
            last_bytes: initial_bytes,
            callback,
        }
    }

    pub fn tick(&mut self, downloaded: u64) {
        let elapsed = self.last_sample.elapsed();
        if elapsed < SPEED_INTERVAL {
            return;
        }

        let delta = downloaded.saturating_sub(self.last_bytes);
        let speed = (delta as f64 / elapsed.as_secs_f64()) as u64;
        (self.callback)(speed);

        self.last_sample = Instant::now();
        self.last_bytes = downloaded;
    }
}
