//! 连接循环运行状态
//!
//! 三个健康检查线程在每轮迭代开始时读取这个标志：
//!
//! - **Running**: 正常轮询
//! - **Paused**: 线程保留，跳过总线 IO（`resume` 只需翻转标志）
//! - **Stopped**: 线程退出，由 `stop_control_loop()` join

use std::sync::atomic::{AtomicU8, Ordering};

/// 循环状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum LoopState {
    Running = 0,
    Paused = 1,
    /// 默认状态：线程尚未启动或已经退出
    #[default]
    Stopped = 2,
}

impl LoopState {
    /// 从 u8 转换
    ///
    /// 无效值按 Stopped 处理，线程宁可退出也不做未知行为。
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Paused,
            _ => Self::Stopped,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_running(self) -> bool {
        self == Self::Running
    }

    pub fn is_stopped(self) -> bool {
        self == Self::Stopped
    }
}

/// 循环状态（原子版本，用于线程间共享）
#[derive(Debug)]
pub struct AtomicLoopState {
    inner: AtomicU8,
}

impl AtomicLoopState {
    pub fn new(state: LoopState) -> Self {
        Self {
            inner: AtomicU8::new(state.as_u8()),
        }
    }

    pub fn get(&self) -> LoopState {
        LoopState::from_u8(self.inner.load(Ordering::Acquire))
    }

    pub fn set(&self, state: LoopState) {
        self.inner.store(state.as_u8(), Ordering::Release);
    }

    /// 比较并交换，成功返回 `true`
    pub fn transition(&self, from: LoopState, to: LoopState) -> bool {
        self.inner
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for AtomicLoopState {
    fn default() -> Self {
        Self::new(LoopState::default())
    }
}
