//! 校准状态机
//!
//! ```text
//!            request_new_calibration()
//!   Idle ─────────────────────────────▶ RequestPending ◀──────┐
//!   Done ─────────────────────────────▶       │                │ 任一总线失败 / 派发失败
//!                                             │ begin()        │
//!                                             ▼                │
//!                                        InProgress ───────────┘
//!                                             │ 所有启用总线成功
//!                                             ▼
//!                                           Done
//! ```
//!
//! 状态只能经由编排层调用改变，总线驱动只通过 [`CalibrationReport`] 异步上报结果。
//! 所有迁移都在同一把锁内完成，所以任意时刻至多一个校准处于 InProgress。

use crate::error::HardwareError;
use crate::state::{BusKind, ConnectionState};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// 校准状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalibrationState {
    #[default]
    Idle,
    RequestPending,
    InProgress,
    Done,
}

/// 校准模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationMode {
    /// 电机自行寻找限位
    Automatic = 1,
    /// 用户把机械臂摆到零位后确认
    Manual = 2,
}

impl TryFrom<i32> for CalibrationMode {
    type Error = HardwareError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(CalibrationMode::Automatic),
            2 => Ok(CalibrationMode::Manual),
            other => Err(HardwareError::Configuration(format!(
                "unknown calibration mode {}",
                other
            ))),
        }
    }
}

impl CalibrationMode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// 总线上报的校准结果
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationReport {
    pub bus: BusKind,
    /// 对应 [`CalibrationTicket::attempt`]，用于丢弃过期的上报
    pub attempt: u64,
    pub outcome: Result<(), String>,
}

/// 一次获准开始的校准
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationTicket {
    pub attempt: u64,
    pub mode: CalibrationMode,
    pub buses: Vec<BusKind>,
}

#[derive(Debug, Default)]
struct Inner {
    state: CalibrationState,
    attempt: u64,
    awaiting: BTreeSet<BusKind>,
    failures: Vec<String>,
    last_error: Option<String>,
}

/// 校准控制器（进程内唯一实例由编排层持有）
#[derive(Debug, Default)]
pub struct CalibrationController {
    inner: Mutex<Inner>,
}

impl CalibrationController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CalibrationState {
        self.inner.lock().state
    }

    pub fn is_calibration_in_progress(&self) -> bool {
        self.state() == CalibrationState::InProgress
    }

    /// 有待处理的校准请求
    pub fn calibration_needed(&self) -> bool {
        self.state() == CalibrationState::RequestPending
    }

    /// 最近一次失败的原因
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    /// 请求新的校准
    ///
    /// Idle / Done → RequestPending，返回 `true`；已是 RequestPending 时什么都不做；
    /// InProgress 时忽略（当前校准结束后可以再次请求）。
    pub fn request_new_calibration(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CalibrationState::Idle | CalibrationState::Done => {
                inner.state = CalibrationState::RequestPending;
                debug!("Calibration requested");
                true
            },
            CalibrationState::RequestPending => false,
            CalibrationState::InProgress => {
                warn!("Calibration request ignored: calibration in progress");
                false
            },
        }
    }

    /// 尝试开始校准
    ///
    /// `buses` 为所有启用总线的当前连接状态。成功时进入 InProgress 并返回派发凭据，
    /// 失败时状态不变。
    pub fn begin(
        &self,
        mode: CalibrationMode,
        buses: &[(BusKind, ConnectionState)],
    ) -> Result<CalibrationTicket, HardwareError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CalibrationState::InProgress => return Err(HardwareError::CalibrationConflict),
            CalibrationState::RequestPending => {},
            CalibrationState::Idle | CalibrationState::Done => {
                return Err(HardwareError::CalibrationNotRequested);
            },
        }

        let not_ready: Vec<String> = buses
            .iter()
            .filter(|(_, state)| !state.is_ok())
            .map(|(bus, state)| {
                if state.message.is_empty() {
                    format!("{} bus not ok", bus)
                } else {
                    state.message.clone()
                }
            })
            .collect();
        if !not_ready.is_empty() {
            return Err(HardwareError::CalibrationNotReady(not_ready.join("; ")));
        }

        inner.attempt += 1;
        inner.state = CalibrationState::InProgress;
        inner.awaiting = buses.iter().map(|(bus, _)| *bus).collect();
        inner.failures.clear();
        inner.last_error = None;
        info!("Calibration #{} started ({:?})", inner.attempt, mode);

        Ok(CalibrationTicket {
            attempt: inner.attempt,
            mode,
            buses: buses.iter().map(|(bus, _)| *bus).collect(),
        })
    }

    /// 派发失败：回到 RequestPending 以便重试
    pub fn abort(&self, attempt: u64, reason: &str) {
        let mut inner = self.inner.lock();
        if inner.state == CalibrationState::InProgress && inner.attempt == attempt {
            warn!("Calibration #{} aborted: {}", attempt, reason);
            inner.state = CalibrationState::RequestPending;
            inner.awaiting.clear();
            inner.last_error = Some(reason.to_string());
        }
    }

    /// 处理总线上报，返回处理后的状态
    ///
    /// 所有启用总线都成功 → Done；有任一失败 → 等其余总线上报完后回到
    /// RequestPending。过期或重复的上报被忽略。
    pub fn report(&self, report: CalibrationReport) -> CalibrationState {
        let mut inner = self.inner.lock();
        if inner.state != CalibrationState::InProgress || inner.attempt != report.attempt {
            debug!(
                "Ignoring stale calibration report from {} (attempt {})",
                report.bus, report.attempt
            );
            return inner.state;
        }
        if !inner.awaiting.remove(&report.bus) {
            return inner.state;
        }

        if let Err(reason) = report.outcome {
            warn!("{} bus calibration failed: {}", report.bus, reason);
            inner.failures.push(format!("{} bus: {}", report.bus, reason));
        }

        if inner.awaiting.is_empty() {
            if inner.failures.is_empty() {
                info!("Calibration #{} done", inner.attempt);
                inner.state = CalibrationState::Done;
            } else {
                let reason = inner.failures.join("; ");
                warn!("Calibration #{} failed, retry allowed: {}", inner.attempt, reason);
                inner.last_error = Some(reason);
                inner.state = CalibrationState::RequestPending;
            }
        }
        inner.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_ok() -> Vec<(BusKind, ConnectionState)> {
        vec![
            (BusKind::Can, ConnectionState::ok()),
            (BusKind::Dxl, ConnectionState::ok()),
        ]
    }

    fn ok_report(bus: BusKind, attempt: u64) -> CalibrationReport {
        CalibrationReport {
            bus,
            attempt,
            outcome: Ok(()),
        }
    }

    #[test]
    fn test_request_is_idempotent() {
        let controller = CalibrationController::new();
        assert_eq!(controller.state(), CalibrationState::Idle);
        assert!(controller.request_new_calibration());
        assert!(!controller.request_new_calibration());
        assert_eq!(controller.state(), CalibrationState::RequestPending);
        assert!(controller.calibration_needed());
    }

    #[test]
    fn test_begin_without_request() {
        let controller = CalibrationController::new();
        assert_eq!(
            controller.begin(CalibrationMode::Automatic, &all_ok()),
            Err(HardwareError::CalibrationNotRequested)
        );
        assert_eq!(controller.state(), CalibrationState::Idle);
    }

    #[test]
    fn test_begin_while_in_progress_conflicts() {
        let controller = CalibrationController::new();
        controller.request_new_calibration();
        controller.begin(CalibrationMode::Automatic, &all_ok()).unwrap();
        assert!(controller.is_calibration_in_progress());

        assert_eq!(
            controller.begin(CalibrationMode::Manual, &all_ok()),
            Err(HardwareError::CalibrationConflict)
        );
        assert_eq!(controller.state(), CalibrationState::InProgress);
    }

    #[test]
    fn test_begin_requires_all_buses_ok() {
        let controller = CalibrationController::new();
        controller.request_new_calibration();
        let buses = vec![
            (BusKind::Can, ConnectionState::lost("CAN bus: stepper 2 silent")),
            (BusKind::Dxl, ConnectionState::ok()),
        ];
        let err = controller.begin(CalibrationMode::Automatic, &buses).unwrap_err();
        assert!(matches!(err, HardwareError::CalibrationNotReady(msg) if msg.contains("stepper 2")));
        assert_eq!(controller.state(), CalibrationState::RequestPending);
    }

    #[test]
    fn test_all_buses_succeed() {
        let controller = CalibrationController::new();
        controller.request_new_calibration();
        let ticket = controller.begin(CalibrationMode::Automatic, &all_ok()).unwrap();
        assert_eq!(ticket.buses, vec![BusKind::Can, BusKind::Dxl]);

        assert_eq!(
            controller.report(ok_report(BusKind::Can, ticket.attempt)),
            CalibrationState::InProgress
        );
        assert_eq!(
            controller.report(ok_report(BusKind::Dxl, ticket.attempt)),
            CalibrationState::Done
        );
        assert!(!controller.calibration_needed());
    }

    #[test]
    fn test_partial_failure_allows_retry() {
        let controller = CalibrationController::new();
        controller.request_new_calibration();
        let ticket = controller.begin(CalibrationMode::Automatic, &all_ok()).unwrap();

        controller.report(CalibrationReport {
            bus: BusKind::Can,
            attempt: ticket.attempt,
            outcome: Err("stepper 3: Timeout".to_string()),
        });
        assert!(controller.is_calibration_in_progress());
        assert_eq!(
            controller.report(ok_report(BusKind::Dxl, ticket.attempt)),
            CalibrationState::RequestPending
        );
        assert!(controller.last_error().unwrap().contains("stepper 3"));

        let retry = controller.begin(CalibrationMode::Automatic, &all_ok()).unwrap();
        assert_eq!(retry.attempt, ticket.attempt + 1);
    }

    #[test]
    fn test_stale_report_ignored() {
        let controller = CalibrationController::new();
        controller.request_new_calibration();
        let first = controller.begin(CalibrationMode::Automatic, &all_ok()).unwrap();
        controller.abort(first.attempt, "dispatch failed");
        assert_eq!(controller.state(), CalibrationState::RequestPending);

        let second = controller.begin(CalibrationMode::Automatic, &all_ok()).unwrap();
        controller.report(ok_report(BusKind::Can, first.attempt));
        controller.report(ok_report(BusKind::Dxl, first.attempt));
        assert!(controller.is_calibration_in_progress());

        controller.report(ok_report(BusKind::Can, second.attempt));
        controller.report(ok_report(BusKind::Can, second.attempt));
        assert!(controller.is_calibration_in_progress());
        controller.report(ok_report(BusKind::Dxl, second.attempt));
        assert_eq!(controller.state(), CalibrationState::Done);
    }

    #[test]
    fn test_request_after_done() {
        let controller = CalibrationController::new();
        controller.request_new_calibration();
        let ticket = controller
            .begin(CalibrationMode::Manual, &all_ok()[..1])
            .unwrap();
        controller.report(ok_report(BusKind::Can, ticket.attempt));
        assert_eq!(controller.state(), CalibrationState::Done);
        assert!(controller.request_new_calibration());
    }

    #[test]
    fn test_mode_from_int() {
        assert_eq!(CalibrationMode::try_from(1), Ok(CalibrationMode::Automatic));
        assert_eq!(CalibrationMode::try_from(2), Ok(CalibrationMode::Manual));
        assert!(CalibrationMode::try_from(0).is_err());
    }
}
