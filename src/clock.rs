//! 时钟抽象
//!
//! 管线里唯一的挂起点是固定时长的等待（采样门限、分块节拍、重连退避），
//! 全部经由 [`Clock::sleep`]，测试中用 [`ManualClock`] 把等待变成时间推进。

use std::cell::{Cell, RefCell};
use std::time::{Duration, Instant};

/// 单调时钟
pub trait Clock {
    /// 自启动以来的毫秒数
    fn now_ms(&self) -> u64;

    /// 固定时长等待
    fn sleep(&self, duration: Duration);
}

/// 基于 `Instant` 的系统单调时钟
pub struct MonotonicClock {
    boot: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { boot: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.boot.elapsed().as_millis() as u64
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// 手动推进的时钟（用于测试）
///
/// `sleep` 不阻塞，只推进当前时间并记录等待时长。
#[derive(Default)]
pub struct ManualClock {
    now_ms: Cell<u64>,
    sleeps: RefCell<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接推进时间（不记录为等待）
    pub fn advance(&self, duration: Duration) {
        self.now_ms.set(self.now_ms.get() + duration.as_millis() as u64);
    }

    /// 迄今为止所有 `sleep` 调用的时长
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }

    pub fn clear_sleeps(&self) {
        self.sleeps.borrow_mut().clear();
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.get()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
        self.sleeps.borrow_mut().push(duration);
    }
}
