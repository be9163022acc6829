//! # Gauss Protocol
//!
//! Gauss 机械臂两条电机总线的协议定义（无硬件依赖）
//!
//! ## 模块
//!
//! - `ids`: 步进电机 CAN ID 常量与命令/数据码
//! - `stepper`: 步进电机 CAN 控制帧构建与反馈帧解析
//! - `dxl`: Dynamixel 协议 2.0 指令包/状态包编解码、电机控制表
//!
//! ## 字节序
//!
//! - CAN 步进协议使用 Motorola (MSB) 高位在前（大端字节序）。
//! - Dynamixel 协议使用小端字节序（低字节在前）。

pub mod dxl;
pub mod ids;
pub mod stepper;

// 重新导出常用类型
pub use dxl::{
    HardwareErrorStatus, Instruction, InstructionPacket, LedColor, MotorModel, StatusPacket,
};
pub use ids::*;
pub use stepper::{CalibrationOutcome, StepperCommand, StepperFault, StepperFeedback};

/// CAN 2.0 标准帧的统一抽象
///
/// `GaussFrame` 是协议层和硬件层之间的中间抽象：
///
/// ```text
/// Protocol Layer (gauss-protocol)
///     ↓ TryFrom<GaussFrame> 解析 / new_standard() 构建
/// GaussFrame (此类型)
///     ↓ 转换逻辑在总线层实现
/// Bus Layer (gauss-bus)
///     ↓ SocketCAN / Mock 适配器
/// Hardware
/// ```
///
/// - **Copy trait**：零成本复制
/// - **固定 8 字节**：避免堆分配
///
/// ```rust
/// use gauss_protocol::GaussFrame;
///
/// let frame = GaussFrame::new_standard(0x101, &[0x03, 0, 0, 1, 0]);
/// assert_eq!(frame.id(), 0x101);
/// assert_eq!(frame.data_slice(), &[0x03, 0, 0, 1, 0]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GaussFrame {
    /// CAN ID（标准帧或扩展帧）
    pub id: u32,

    /// 帧数据（固定 8 字节，未使用部分为 0）
    pub data: [u8; 8],

    /// 有效数据长度 (0-8)
    pub len: u8,

    /// 是否为扩展帧（29-bit ID）
    pub is_extended: bool,

    /// 硬件时间戳（微秒），0 表示不可用
    pub timestamp_us: u64,
}

impl GaussFrame {
    /// 创建标准帧
    pub fn new_standard(id: u16, data: &[u8]) -> Self {
        Self::new(id as u32, data, false)
    }

    /// 创建扩展帧
    pub fn new_extended(id: u32, data: &[u8]) -> Self {
        Self::new(id, data, true)
    }

    fn new(id: u32, data: &[u8], is_extended: bool) -> Self {
        let mut fixed_data = [0u8; 8];
        let len = data.len().min(8);
        fixed_data[..len].copy_from_slice(&data[..len]);

        Self {
            id,
            data: fixed_data,
            len: len as u8,
            is_extended,
            timestamp_us: 0,
        }
    }

    /// 获取数据切片（只包含有效数据）
    pub fn data_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// 获取 CAN ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// 获取完整数据（8字节固定数组）
    pub fn data(&self) -> &[u8; 8] {
        &self.data
    }
}

use thiserror::Error;

/// 协议解析错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid CAN ID: 0x{id:X}")]
    InvalidCanId { id: u32 },

    #[error("Invalid packet header")]
    InvalidHeader,

    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    #[error("Unexpected reply from id {actual} (expected {expected})")]
    UnexpectedId { expected: u8, actual: u8 },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid value for field {field}: {value}")]
    InvalidValue { field: String, value: u32 },
}

/// 大端字节序转 i32
pub fn bytes_to_i32_be(bytes: [u8; 4]) -> i32 {
    i32::from_be_bytes(bytes)
}

/// 大端字节序转 i16
pub fn bytes_to_i16_be(bytes: [u8; 2]) -> i16 {
    i16::from_be_bytes(bytes)
}

/// i32 转大端字节序
pub fn i32_to_bytes_be(value: i32) -> [u8; 4] {
    value.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_truncates_long_payload() {
        let frame = GaussFrame::new_standard(0x100, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(frame.len, 8);
        assert_eq!(frame.data_slice(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(!frame.is_extended);
    }

    #[test]
    fn test_bytes_to_i32_be_negative() {
        assert_eq!(bytes_to_i32_be([0xFF, 0xFF, 0xFF, 0xFF]), -1);
        assert_eq!(bytes_to_i32_be([0x12, 0x34, 0x56, 0x78]), 0x12345678);
    }

    #[test]
    fn test_bytes_to_i16_be() {
        assert_eq!(bytes_to_i16_be([0x12, 0x34]), 0x1234);
        assert_eq!(bytes_to_i16_be([0xFF, 0xFE]), -2);
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::CrcMismatch {
            expected: 0x1234,
            actual: 0xABCD,
        };
        assert_eq!(err.to_string(), "CRC mismatch: expected 0x1234, got 0xABCD");
    }
}
