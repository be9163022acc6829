//! # 硬件配置
//!
//! 轮询频率、单次 IO 超时、判定断线的失败次数，以及硬件版本选择。
//!
//! ```toml
//! hardware_version = "auto"   # "auto" | "v1" | "v2"
//! can_enabled = true
//! dxl_enabled = true
//! hardware_check_frequency_hz = 2.0
//!
//! [can]
//! interface = "can0"
//! frequency_hz = 100.0
//!
//! [dxl]
//! port = "/dev/ttyAMA0"
//! baud_rate = 1000000
//! ```
//!
//! 未出现的字段使用默认值。

use crate::error::HardwareError;
use crate::version::HardwareVersion;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// 硬件版本选择
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionSelection {
    /// 通过 Dynamixel 电机型号自动探测
    #[default]
    Auto,
    V1,
    V2,
}

impl VersionSelection {
    /// 显式指定的版本（`Auto` 返回 `None`）
    pub fn explicit(self) -> Option<HardwareVersion> {
        match self {
            VersionSelection::Auto => None,
            VersionSelection::V1 => Some(HardwareVersion::V1),
            VersionSelection::V2 => Some(HardwareVersion::V2),
        }
    }
}

impl From<HardwareVersion> for VersionSelection {
    fn from(version: HardwareVersion) -> Self {
        match version {
            HardwareVersion::V1 => VersionSelection::V1,
            HardwareVersion::V2 => VersionSelection::V2,
        }
    }
}

/// 硬件通讯层配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub hardware_version: VersionSelection,
    pub can_enabled: bool,
    pub dxl_enabled: bool,
    /// 总体监督循环频率（Hz）
    pub hardware_check_frequency_hz: f64,
    pub can: CanBusConfig,
    pub dxl: DxlBusConfig,
    pub calibration: CalibrationConfig,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            hardware_version: VersionSelection::Auto,
            can_enabled: true,
            dxl_enabled: true,
            hardware_check_frequency_hz: 2.0,
            can: CanBusConfig::default(),
            dxl: DxlBusConfig::default(),
            calibration: CalibrationConfig::default(),
        }
    }
}

/// CAN 步进电机总线配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanBusConfig {
    /// SocketCAN 接口名
    pub interface: String,
    /// 轮询频率（Hz）
    pub frequency_hz: f64,
    /// 单帧接收超时（毫秒），超时即认为本轮反馈已读完
    pub receive_timeout_ms: u64,
    /// 单个电机超过该时间无反馈视为掉线（毫秒）
    pub feedback_timeout_ms: u64,
    /// 连续失败多少次判定为 Lost
    pub lost_after_failures: u32,
    /// 回零校准超时（秒）
    pub calibration_timeout_s: u8,
    /// 每轮最多处理的反馈帧数
    pub max_frames_per_poll: usize,
}

impl Default for CanBusConfig {
    fn default() -> Self {
        Self {
            interface: "can0".to_string(),
            frequency_hz: 100.0,
            receive_timeout_ms: 2,
            feedback_timeout_ms: 500,
            lost_after_failures: 3,
            calibration_timeout_s: 30,
            max_frames_per_poll: 64,
        }
    }
}

impl CanBusConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn feedback_timeout(&self) -> Duration {
        Duration::from_millis(self.feedback_timeout_ms)
    }

    pub fn calibration_timeout(&self) -> Duration {
        Duration::from_secs(self.calibration_timeout_s as u64)
    }
}

/// Dynamixel 串口总线配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DxlBusConfig {
    /// 串口设备路径
    pub port: String,
    pub baud_rate: u32,
    /// 轮询频率（Hz）
    pub frequency_hz: f64,
    /// 单次事务（指令包 → 状态包）超时（毫秒）
    pub timeout_ms: u64,
    /// 每隔多少轮读取一次温度/电压/错误（位置每轮都读）
    pub telemetry_every: u32,
    /// 连续失败多少次判定为 Lost
    pub lost_after_failures: u32,
    /// 夹爪闭合/真空泵动作后切换到保持力矩前的等待时间（毫秒）
    pub gripper_settle_ms: u64,
}

impl Default for DxlBusConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyAMA0".to_string(),
            baud_rate: 1_000_000,
            frequency_hz: 100.0,
            timeout_ms: 10,
            telemetry_every: 10,
            lost_after_failures: 3,
            gripper_settle_ms: 500,
        }
    }
}

impl DxlBusConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn gripper_settle(&self) -> Duration {
        Duration::from_millis(self.gripper_settle_ms)
    }
}

/// 校准配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// 启动时是否要求校准（仅在 CAN 总线启用时生效）
    pub required_at_startup: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            required_at_startup: true,
        }
    }
}

/// 频率（Hz）→ 周期
pub(crate) fn period(frequency_hz: f64) -> Duration {
    Duration::from_secs_f64(1.0 / frequency_hz)
}

impl HardwareConfig {
    /// 从 TOML 字符串解析并校验
    pub fn from_toml_str(content: &str) -> Result<Self, HardwareError> {
        let config: HardwareConfig = toml::from_str(content)
            .map_err(|e| HardwareError::Configuration(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, HardwareError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            HardwareError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// 序列化为 TOML
    pub fn to_toml_string(&self) -> Result<String, HardwareError> {
        toml::to_string_pretty(self)
            .map_err(|e| HardwareError::Configuration(format!("cannot serialize: {}", e)))
    }

    /// 校验配置
    ///
    /// - 所有频率 > 0
    /// - 失败阈值 ≥ 1
    /// - 至少启用一条总线
    pub fn validate(&self) -> Result<(), HardwareError> {
        let frequencies = [
            ("hardware_check_frequency_hz", self.hardware_check_frequency_hz),
            ("can.frequency_hz", self.can.frequency_hz),
            ("dxl.frequency_hz", self.dxl.frequency_hz),
        ];
        for (name, value) in frequencies {
            if !(value.is_finite() && value > 0.0) {
                return Err(HardwareError::Configuration(format!(
                    "{} must be a positive number, got {}",
                    name, value
                )));
            }
        }

        if self.can.lost_after_failures == 0 || self.dxl.lost_after_failures == 0 {
            return Err(HardwareError::Configuration(
                "lost_after_failures must be at least 1".to_string(),
            ));
        }
        if self.dxl.telemetry_every == 0 {
            return Err(HardwareError::Configuration(
                "dxl.telemetry_every must be at least 1".to_string(),
            ));
        }
        if self.can.max_frames_per_poll == 0 {
            return Err(HardwareError::Configuration(
                "can.max_frames_per_poll must be at least 1".to_string(),
            ));
        }
        if !self.can_enabled && !self.dxl_enabled {
            return Err(HardwareError::Configuration(
                "at least one bus must be enabled".to_string(),
            ));
        }
        if !self.dxl_enabled && self.hardware_version == VersionSelection::Auto {
            return Err(HardwareError::Configuration(
                "hardware version auto-detection needs the DXL bus; set hardware_version explicitly"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
