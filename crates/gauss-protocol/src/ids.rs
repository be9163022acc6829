//! CAN ID 常量定义
//!
//! 步进电机控制板使用 11-bit 标准帧：
//! - 命令帧：`0x100 + motor_id`（`motor_id = 0` 为广播）
//! - 反馈帧：`0x200 + motor_id`
//!
//! 帧的 Byte 0 为命令码（命令帧）或数据码（反馈帧）。

/// 命令帧基址（`+ motor_id`）
pub const ID_STEPPER_COMMAND_BASE: u32 = 0x100;

/// 广播命令帧（所有步进电机）
pub const ID_STEPPER_BROADCAST: u32 = ID_STEPPER_COMMAND_BASE;

/// 反馈帧基址（`+ motor_id`）
pub const ID_STEPPER_FEEDBACK_BASE: u32 = 0x200;

/// 单条总线上允许的最大步进电机 ID
pub const MAX_STEPPER_ID: u8 = 0x0F;

// ============================================================================
// 命令码（命令帧 Byte 0）
// ============================================================================

/// 目标位置指令（Byte 1-4: i32 steps）
pub const CMD_POSITION: u8 = 0x03;

/// 力矩使能指令（Byte 1: 0 失能 / 1 使能）
pub const CMD_TORQUE: u8 = 0x04;

/// 回零校准指令（Byte 1: mode, Byte 2: direction, Byte 3: timeout s）
pub const CMD_CALIBRATE: u8 = 0x15;

/// 轨迹同步指令（Byte 1: begin_traj）
pub const CMD_SYNCHRONIZE: u8 = 0x16;

/// 请求固件版本指令
pub const CMD_REQUEST_FIRMWARE: u8 = 0x1A;

// ============================================================================
// 数据码（反馈帧 Byte 0）
// ============================================================================

/// 当前位置反馈（Byte 1-4: i32 steps）
pub const DATA_POSITION: u8 = 0x03;

/// 诊断反馈（温度、电压、故障位域）
pub const DATA_DIAGNOSTICS: u8 = 0x08;

/// 校准结果反馈
pub const DATA_CALIBRATION_RESULT: u8 = 0x09;

/// 固件版本反馈（Byte 1-3: major, minor, patch）
pub const DATA_FIRMWARE_VERSION: u8 = 0x10;

/// 命令帧 ID
pub fn command_id(motor_id: u8) -> u32 {
    ID_STEPPER_COMMAND_BASE + motor_id as u32
}

/// 反馈帧 ID
pub fn feedback_id(motor_id: u8) -> u32 {
    ID_STEPPER_FEEDBACK_BASE + motor_id as u32
}

/// 从反馈帧 ID 推导电机 ID
///
/// 不在反馈帧范围内的 ID 返回 `None`。
pub fn motor_id_from_feedback(id: u32) -> Option<u8> {
    if (ID_STEPPER_FEEDBACK_BASE + 1..=ID_STEPPER_FEEDBACK_BASE + MAX_STEPPER_ID as u32)
        .contains(&id)
    {
        Some((id - ID_STEPPER_FEEDBACK_BASE) as u8)
    } else {
        None
    }
}

/// 从命令帧 ID 推导电机 ID（0 表示广播）
pub fn motor_id_from_command(id: u32) -> Option<u8> {
    if (ID_STEPPER_COMMAND_BASE..=ID_STEPPER_COMMAND_BASE + MAX_STEPPER_ID as u32).contains(&id) {
        Some((id - ID_STEPPER_COMMAND_BASE) as u8)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feedback_id_range() {
        assert_eq!(motor_id_from_feedback(0x201), Some(1));
        assert_eq!(motor_id_from_feedback(0x20F), Some(15));
        assert_eq!(motor_id_from_feedback(0x200), None);
        assert_eq!(motor_id_from_feedback(0x210), None);
        assert_eq!(motor_id_from_feedback(0x101), None);
    }

    #[test]
    fn test_command_id_broadcast() {
        assert_eq!(command_id(0), ID_STEPPER_BROADCAST);
        assert_eq!(motor_id_from_command(ID_STEPPER_BROADCAST), Some(0));
        assert_eq!(motor_id_from_command(command_id(4)), Some(4));
    }
}
