//! 驱动层错误类型定义

use crate::state::BusKind;
use gauss_bus::BusError;
use gauss_protocol::ProtocolError;
use thiserror::Error;

/// 硬件通讯层错误类型
///
/// 除 [`HardwareError::Configuration`] 在 `init()` 时是致命错误外，其余错误都只影响
/// 当次调用。需要整数返回值的传输层使用 [`HardwareError::status_code`]。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HardwareError {
    /// 总线不可达或应答超时
    #[error("{bus} connection error: {message}")]
    Connection { bus: BusKind, message: String },

    /// 应答格式错误（按一次丢失的轮询处理）
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 配置无效，或硬件版本探测失败
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// 校准已在进行中
    #[error("Calibration already in progress")]
    CalibrationConflict,

    /// 有总线未处于 Ok 状态
    #[error("Calibration not ready: {0}")]
    CalibrationNotReady(String),

    /// 没有待处理的校准请求
    #[error("No calibration has been requested")]
    CalibrationNotRequested,

    /// 工具（夹爪/真空泵）命令失败
    #[error("Tool error (id {id}): {message}")]
    Tool { id: u8, message: String },

    /// 指定 ID 上没有设备应答
    #[error("Device not found (id {id})")]
    DeviceNotFound { id: u8 },

    /// LED 模式格式错误
    #[error("Invalid LED pattern: {0}")]
    InvalidLedPattern(String),

    /// 总线在配置中被禁用
    #[error("{0} bus is disabled")]
    BusDisabled(BusKind),

    /// 尚未调用 `init()`
    #[error("Hardware not initialized")]
    NotInitialized,
}

impl HardwareError {
    /// 把总线层错误归类到某条总线上的连接错误
    pub fn connection(bus: BusKind, err: impl std::fmt::Display) -> Self {
        HardwareError::Connection {
            bus,
            message: err.to_string(),
        }
    }

    /// 总线层错误转换，超时和 IO 错误都视为连接错误
    pub fn from_bus(bus: BusKind, err: BusError) -> Self {
        Self::connection(bus, err)
    }

    /// 稳定的整数状态码（成功为 0）
    pub fn status_code(&self) -> i32 {
        match self {
            HardwareError::Connection { .. } => -1,
            HardwareError::Protocol(_) => -2,
            HardwareError::Configuration(_) => -3,
            HardwareError::CalibrationConflict => -4,
            HardwareError::CalibrationNotReady(_) => -5,
            HardwareError::CalibrationNotRequested => -6,
            HardwareError::Tool { .. } => -7,
            HardwareError::DeviceNotFound { .. } => -8,
            HardwareError::InvalidLedPattern(_) => -9,
            HardwareError::BusDisabled(_) => -10,
            HardwareError::NotInitialized => -11,
        }
    }

    /// 是否只是一次丢失的轮询（不会单独把总线推到 Lost）
    pub fn is_transient(&self) -> bool {
        matches!(self, HardwareError::Protocol(_))
    }
}

/// `Result` 转整数状态码
pub fn status_code<T>(result: &Result<T, HardwareError>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.status_code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardware_error_display() {
        let err = HardwareError::Connection {
            bus: BusKind::Can,
            message: "Read timeout".to_string(),
        };
        assert_eq!(err.to_string(), "CAN connection error: Read timeout");

        let err = HardwareError::Tool {
            id: 11,
            message: "no response".to_string(),
        };
        assert!(err.to_string().contains("id 11"));

        assert_eq!(
            HardwareError::BusDisabled(BusKind::Dxl).to_string(),
            "DXL bus is disabled"
        );
    }

    #[test]
    fn test_from_protocol_error() {
        let err: HardwareError = ProtocolError::InvalidHeader.into();
        assert!(err.is_transient());
        assert_eq!(err.status_code(), -2);
    }

    #[test]
    fn test_from_bus_error() {
        let err = HardwareError::from_bus(BusKind::Dxl, BusError::Timeout);
        match err {
            HardwareError::Connection { bus, message } => {
                assert_eq!(bus, BusKind::Dxl);
                assert_eq!(message, "Read timeout");
            },
            other => panic!("Expected Connection variant, got {:?}", other),
        }
    }

    #[test]
    fn test_status_codes_are_distinct() {
        let errors = [
            HardwareError::connection(BusKind::Can, "x"),
            HardwareError::Protocol(ProtocolError::InvalidHeader),
            HardwareError::Configuration("x".into()),
            HardwareError::CalibrationConflict,
            HardwareError::CalibrationNotReady("x".into()),
            HardwareError::CalibrationNotRequested,
            HardwareError::Tool {
                id: 1,
                message: "x".into(),
            },
            HardwareError::DeviceNotFound { id: 1 },
            HardwareError::InvalidLedPattern("x".into()),
            HardwareError::BusDisabled(BusKind::Can),
            HardwareError::NotInitialized,
        ];
        let mut codes: Vec<i32> = errors.iter().map(|e| e.status_code()).collect();
        assert!(codes.iter().all(|c| *c < 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert_eq!(status_code::<()>(&Ok(())), 0);
    }
}
