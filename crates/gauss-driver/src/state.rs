//! 状态快照类型
//!
//! 总线轮询线程不断覆盖这些快照，读取方拿到的总是一份完整的副本
//! （`ArcSwap` 或短暂持锁后 clone），不会看到写了一半的数据。

use crate::error::HardwareError;
use gauss_protocol::LedColor;
use std::fmt;

/// 逻辑关节数
pub const JOINT_COUNT: usize = 6;

/// 六轴位姿（弧度），下标即逻辑关节槽位 `1..=6` 减一
///
/// 长度由类型保证，与硬件版本、总线是否禁用无关。
pub type JointPose = [f64; JOINT_COUNT];

/// 总线类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BusKind {
    /// 步进电机 CAN 总线（底座/肩部关节）
    Can,
    /// Dynamixel 串口总线（腕部关节与工具）
    Dxl,
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusKind::Can => f.write_str("CAN"),
            BusKind::Dxl => f.write_str("DXL"),
        }
    }
}

/// 连接健康度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionHealth {
    Ok,
    /// 本轮轮询失败，但尚未达到判定断线的次数
    Degraded,
    /// 连续失败次数达到阈值，或尚未成功通讯过
    #[default]
    Lost,
}

/// 单条总线的连接状态
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionState {
    pub health: ConnectionHealth,
    /// 人类可读的错误信息（Ok 时为空）
    pub message: String,
}

impl ConnectionState {
    pub fn ok() -> Self {
        Self {
            health: ConnectionHealth::Ok,
            message: String::new(),
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            health: ConnectionHealth::Degraded,
            message: message.into(),
        }
    }

    pub fn lost(message: impl Into<String>) -> Self {
        Self {
            health: ConnectionHealth::Lost,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.health == ConnectionHealth::Ok
    }

    pub fn is_lost(&self) -> bool {
        self.health == ConnectionHealth::Lost
    }
}

/// 总体连接状态：只统计启用的总线，禁用的总线视为 Ok
pub fn aggregate_ok(can: Option<&ConnectionState>, dxl: Option<&ConnectionState>) -> bool {
    can.is_none_or(ConnectionState::is_ok) && dxl.is_none_or(ConnectionState::is_ok)
}

/// 单个电机的遥测数据
#[derive(Debug, Clone, PartialEq)]
pub struct MotorTelemetry {
    /// 电机名（如 "Axis 5"、"Tool gripper1"）
    pub name: String,
    /// 电机类型（如 "Stepper"、"XL-320"）
    pub motor_type: String,
    /// 温度（℃）
    pub temperature: i32,
    /// 电压（V）
    pub voltage: f64,
    /// 硬件错误码（0 表示无错误）
    pub error_code: i32,
}

/// 固件版本
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub motor_name: String,
    pub version: String,
}

/// `get_hardware_status()` 返回的快照
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HardwareStatus {
    pub connection_ok: bool,
    pub error_message: String,
    pub calibration_needed: bool,
    pub calibration_in_progress: bool,
    /// 按总线扫描顺序拼接：CAN 在前，DXL 在后，工具最后
    pub motors: Vec<MotorTelemetry>,
    /// 有启用的总线当前不可达，`motors` 是最后一次成功读取的数据
    pub stale: bool,
}

/// LED 模式
///
/// 每个腕部执行器一个颜色码（`0..=7`），整体校验，不合法时不做任何写入。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LedPattern {
    pub codes: Vec<i32>,
}

impl LedPattern {
    pub fn new(codes: impl Into<Vec<i32>>) -> Self {
        Self {
            codes: codes.into(),
        }
    }

    /// 整体校验并转换为颜色（`expected` 为 LED 数量）
    pub fn to_colors(&self, expected: usize) -> Result<Vec<LedColor>, HardwareError> {
        if self.codes.len() != expected {
            return Err(HardwareError::InvalidLedPattern(format!(
                "expected {} LED codes, got {}",
                expected,
                self.codes.len()
            )));
        }
        self.codes
            .iter()
            .map(|code| {
                u8::try_from(*code)
                    .ok()
                    .and_then(|raw| LedColor::try_from(raw).ok())
                    .ok_or_else(|| {
                        HardwareError::InvalidLedPattern(format!("LED code {} out of range 0..=7", code))
                    })
            })
            .collect()
    }
}

/// `set_leds()` 的应答
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedReply {
    pub ok: bool,
    pub message: String,
}

impl LedReply {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_ignores_disabled_bus() {
        let lost = ConnectionState::lost("CAN bus down");
        let ok = ConnectionState::ok();
        assert!(aggregate_ok(None, Some(&ok)));
        assert!(aggregate_ok(Some(&ok), None));
        assert!(aggregate_ok(None, None));
        assert!(!aggregate_ok(Some(&lost), Some(&ok)));
        assert!(!aggregate_ok(Some(&ok), Some(&ConnectionState::degraded("x"))));
    }

    #[test]
    fn test_default_connection_state_is_lost() {
        let state = ConnectionState::default();
        assert!(state.is_lost());
        assert!(!state.is_ok());
    }

    #[test]
    fn test_led_pattern_validation() {
        assert_eq!(
            LedPattern::new([1, 2, 7]).to_colors(3).unwrap(),
            vec![LedColor::Red, LedColor::Green, LedColor::White]
        );
        assert!(matches!(
            LedPattern::new([1, 2]).to_colors(3),
            Err(HardwareError::InvalidLedPattern(_))
        ));
        assert!(LedPattern::new([1, 8, 0]).to_colors(3).is_err());
        assert!(LedPattern::new([-1, 0, 0]).to_colors(3).is_err());
    }
}
