//! Dynamixel 协议 2.0
//!
//! 串口半双工链路上的指令包 / 状态包编解码，以及 XL-320 / XL-430 控制表。
//!
//! ```text
//! FF FF FD 00 | ID | LEN_L LEN_H | INST | PARAM... | CRC_L CRC_H
//! ```
//!
//! - `LEN` = INST（1）+ 字节填充后的参数长度 + CRC（2）
//! - CRC-16（多项式 0x8005，初值 0），覆盖包头到最后一个参数
//! - 参数中出现 `FF FF FD` 时追加一个 `FD`

mod model;
mod packet;

pub use model::{ControlTable, MotorModel};
pub use packet::{
    HEADER, HEADER_LEN, InstructionPacket, StatusPacket, crc16, decode_le, encode_le,
    remaining_len,
};

use bilge::prelude::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// 广播 ID（所有电机执行，无状态包返回）
pub const BROADCAST_ID: u8 = 0xFE;

/// 指令码
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
    /// 写入后等待 ACTION 再生效
    RegWrite = 0x04,
    Action = 0x05,
    /// 状态包
    Status = 0x55,
    SyncWrite = 0x83,
}

/// 状态包错误字节中的错误号（Bit 0-6）
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum StatusError {
    ResultFail = 0x01,
    InstructionError = 0x02,
    CrcError = 0x03,
    DataRangeError = 0x04,
    DataLengthError = 0x05,
    DataLimitError = 0x06,
    AccessError = 0x07,
}

/// 电机硬件错误状态位域（控制表 Hardware Error Status）
///
/// - Bit 0: 输入电压异常
/// - Bit 1: 角度限位（XL-320）
/// - Bit 2: 过热
/// - Bit 3: 编码器异常（XL-430）
/// - Bit 4: 电气冲击
/// - Bit 5: 过载
#[bitsize(8)]
#[derive(FromBits, DebugBits, Clone, Copy, Default, PartialEq)]
pub struct HardwareErrorStatus {
    pub input_voltage: bool,
    pub angle_limit: bool,
    pub overheating: bool,
    pub motor_encoder: bool,
    pub electrical_shock: bool,
    pub overload: bool,
    pub bit6: bool,
    pub bit7: bool,
}

impl HardwareErrorStatus {
    pub fn code(self) -> u8 {
        u8::from(self)
    }
}

/// XL-320 LED 颜色（控制表 LED 地址的取值）
///
/// XL-430 只有单色 LED：`Off` 熄灭，其余任意值点亮。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum LedColor {
    #[default]
    Off = 0,
    Red = 1,
    Green = 2,
    Yellow = 3,
    Blue = 4,
    Pink = 5,
    Cyan = 6,
    White = 7,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_led_color_range() {
        assert_eq!(LedColor::try_from(7u8).unwrap(), LedColor::White);
        assert!(LedColor::try_from(8u8).is_err());
    }

    #[test]
    fn test_hardware_error_bits() {
        let status = HardwareErrorStatus::from(u8::new(0b0010_0100));
        assert!(status.overheating());
        assert!(status.overload());
        assert!(!status.input_voltage());
        assert_eq!(status.code(), 0x24);
    }
}
