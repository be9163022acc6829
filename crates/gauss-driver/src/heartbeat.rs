//! 连接健康监测
//!
//! - [`ConnectionMonitor`]: 单个设备距上次反馈的时间（CAN 步进电机按此判断掉线）
//! - [`HealthTracker`]: 单条总线的 [`ConnectionState`]，按连续失败次数在
//!   Ok → Degraded → Lost 之间切换
//!
//! 时间使用以进程启动为锚点的单调时钟，不受系统时间调整影响，可以存放在 `AtomicU64` 中。

use crate::error::HardwareError;
use crate::state::{BusKind, ConnectionHealth, ConnectionState};
use parking_lot::Mutex;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

static APP_START: OnceLock<Instant> = OnceLock::new();

fn get_monotonic_micros() -> u64 {
    let start = APP_START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}

/// 设备反馈时间监测
pub struct ConnectionMonitor {
    last_feedback: AtomicU64,
    timeout: Duration,
}

impl ConnectionMonitor {
    /// 创建监测器，创建时刻视为收到过一次反馈
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_feedback: AtomicU64::new(get_monotonic_micros()),
            timeout,
        }
    }

    /// 超时窗口内收到过反馈
    pub fn check_connection(&self) -> bool {
        self.time_since_last_feedback() < self.timeout
    }

    pub fn register_feedback(&self) {
        self.last_feedback
            .store(get_monotonic_micros(), Ordering::Relaxed);
    }

    pub fn time_since_last_feedback(&self) -> Duration {
        let last_us = self.last_feedback.load(Ordering::Relaxed);
        Duration::from_micros(get_monotonic_micros().saturating_sub(last_us))
    }
}

/// 总线连接状态跟踪
///
/// 规则：
/// - 成功 → Ok，失败计数清零
/// - 协议错误 → Degraded（一次丢失的轮询，不累计）
/// - 连接错误 → 失败计数 +1，达到 `lost_after` 时 Lost，否则 Degraded
///
/// 状态锁只在读写状态时持有，不跨越总线 IO。
pub struct HealthTracker {
    bus: BusKind,
    lost_after: u32,
    consecutive_failures: AtomicU32,
    state: Mutex<ConnectionState>,
}

impl HealthTracker {
    /// 初始状态为 Lost：尚未成功通讯过
    pub fn new(bus: BusKind, lost_after: u32) -> Self {
        Self {
            bus,
            lost_after: lost_after.max(1),
            consecutive_failures: AtomicU32::new(0),
            state: Mutex::new(ConnectionState::lost(format!("{} bus not polled yet", bus))),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().clone()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// 记录一次轮询结果，返回新状态
    pub fn record(&self, result: &Result<(), HardwareError>) -> ConnectionState {
        let next = match result {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                ConnectionState::ok()
            },
            Err(e) if e.is_transient() => {
                warn!("{} bus: transient error, poll skipped: {}", self.bus, e);
                ConnectionState::degraded(format!("{} bus: {}", self.bus, e))
            },
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                let message = format!("{} bus: {}", self.bus, e);
                if failures >= self.lost_after {
                    ConnectionState::lost(message)
                } else {
                    ConnectionState::degraded(message)
                }
            },
        };

        let previous = {
            let mut state = self.state.lock();
            std::mem::replace(&mut *state, next.clone())
        };
        if previous.health != next.health {
            match next.health {
                ConnectionHealth::Ok => debug!("{} bus connection restored", self.bus),
                ConnectionHealth::Degraded => warn!("{} bus degraded: {}", self.bus, next.message),
                ConnectionHealth::Lost => warn!("{} bus lost: {}", self.bus, next.message),
            }
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gauss_protocol::ProtocolError;
    use std::thread;

    #[test]
    fn test_connection_monitor_initially_alive() {
        let monitor = ConnectionMonitor::new(Duration::from_secs(1));
        assert!(monitor.check_connection());
    }

    #[test]
    fn test_connection_monitor_timeout_after_delay() {
        let monitor = ConnectionMonitor::new(Duration::from_millis(30));
        thread::sleep(Duration::from_millis(60));
        assert!(!monitor.check_connection());
        monitor.register_feedback();
        assert!(monitor.check_connection());
    }

    #[test]
    fn test_tracker_starts_lost() {
        let tracker = HealthTracker::new(BusKind::Can, 3);
        assert!(tracker.state().is_lost());
    }

    #[test]
    fn test_tracker_degrades_then_loses() {
        let tracker = HealthTracker::new(BusKind::Dxl, 2);
        assert!(tracker.record(&Ok(())).is_ok());

        let err = Err(HardwareError::connection(BusKind::Dxl, "Read timeout"));
        assert_eq!(tracker.record(&err).health, ConnectionHealth::Degraded);
        let state = tracker.record(&err);
        assert!(state.is_lost());
        assert_eq!(state.message, "DXL bus: DXL connection error: Read timeout");

        assert!(tracker.record(&Ok(())).is_ok());
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn test_protocol_errors_never_escalate() {
        let tracker = HealthTracker::new(BusKind::Can, 1);
        tracker.record(&Ok(()));
        let err = Err(HardwareError::Protocol(ProtocolError::InvalidHeader));
        for _ in 0..5 {
            assert_eq!(tracker.record(&err).health, ConnectionHealth::Degraded);
        }
        assert_eq!(tracker.consecutive_failures(), 0);
    }
}
