//! 步进电机 CAN 帧
//!
//! 控制帧由 [`StepperCommand::to_frame`] 构建，反馈帧通过
//! `TryFrom<GaussFrame>` 解析为 [`StepperFeedback`]。

use crate::ids::*;
use crate::{GaussFrame, ProtocolError, bytes_to_i16_be, bytes_to_i32_be, i32_to_bytes_be};
use bilge::prelude::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};

// ============================================================================
// 位域结构定义（使用 bilge）
// ============================================================================

/// 步进驱动故障位域（诊断帧 Byte 5）
///
/// - Bit 0: 驱动过温
/// - Bit 1: 供电欠压
/// - Bit 2: 过流
/// - Bit 3: 堵转
/// - Bit 4: 编码器异常
/// - Bit 5: 未校准
/// - Bit 6: 驱动器错误
/// - Bit 7: 指令超时
#[bitsize(8)]
#[derive(FromBits, DebugBits, Clone, Copy, Default, PartialEq)]
pub struct StepperFault {
    pub over_temperature: bool,
    pub under_voltage: bool,
    pub over_current: bool,
    pub stall: bool,
    pub encoder_error: bool,
    pub not_calibrated: bool,
    pub driver_error: bool,
    pub command_timeout: bool,
}

impl StepperFault {
    pub fn from_code(code: u8) -> Self {
        Self::from(u8::new(code))
    }

    /// 原始故障码
    pub fn code(self) -> u8 {
        u8::from(self)
    }

    /// 是否有任意故障位
    pub fn any(self) -> bool {
        self.code() != 0
    }
}

/// 校准结果（校准结果帧 Byte 1）
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CalibrationOutcome {
    /// 校准成功
    Ok = 0x01,
    /// 未找到限位（超时）
    Timeout = 0x02,
    /// 参数无效
    BadParameter = 0x03,
    /// 被中断
    Aborted = 0x04,
}

impl CalibrationOutcome {
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

// ============================================================================
// 命令帧
// ============================================================================

/// 步进电机命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepperCommand {
    /// 目标位置（步数）
    Position { motor_id: u8, steps: i32 },
    /// 力矩使能（学习模式下失能）
    Torque { motor_id: u8, enabled: bool },
    /// 回零校准
    Calibrate {
        motor_id: u8,
        mode: u8,
        direction: i8,
        timeout_s: u8,
    },
    /// 轨迹同步（广播）
    Synchronize { begin_trajectory: bool },
    /// 请求固件版本（广播）
    RequestFirmware,
}

impl StepperCommand {
    /// 转换为 CAN 帧
    pub fn to_frame(self) -> GaussFrame {
        match self {
            StepperCommand::Position { motor_id, steps } => {
                let mut data = [0u8; 5];
                data[0] = CMD_POSITION;
                data[1..5].copy_from_slice(&i32_to_bytes_be(steps));
                GaussFrame::new_standard(command_id(motor_id) as u16, &data)
            },
            StepperCommand::Torque { motor_id, enabled } => GaussFrame::new_standard(
                command_id(motor_id) as u16,
                &[CMD_TORQUE, enabled as u8],
            ),
            StepperCommand::Calibrate {
                motor_id,
                mode,
                direction,
                timeout_s,
            } => GaussFrame::new_standard(
                command_id(motor_id) as u16,
                &[CMD_CALIBRATE, mode, direction as u8, timeout_s],
            ),
            StepperCommand::Synchronize { begin_trajectory } => GaussFrame::new_standard(
                ID_STEPPER_BROADCAST as u16,
                &[CMD_SYNCHRONIZE, begin_trajectory as u8],
            ),
            StepperCommand::RequestFirmware => {
                GaussFrame::new_standard(ID_STEPPER_BROADCAST as u16, &[CMD_REQUEST_FIRMWARE])
            },
        }
    }
}

impl TryFrom<GaussFrame> for StepperCommand {
    type Error = ProtocolError;

    fn try_from(frame: GaussFrame) -> Result<Self, Self::Error> {
        let motor_id =
            motor_id_from_command(frame.id).ok_or(ProtocolError::InvalidCanId { id: frame.id })?;
        require_len(&frame, 1)?;

        match frame.data[0] {
            CMD_POSITION => {
                require_len(&frame, 5)?;
                Ok(StepperCommand::Position {
                    motor_id,
                    steps: bytes_to_i32_be([frame.data[1], frame.data[2], frame.data[3], frame.data[4]]),
                })
            },
            CMD_TORQUE => {
                require_len(&frame, 2)?;
                Ok(StepperCommand::Torque {
                    motor_id,
                    enabled: frame.data[1] != 0,
                })
            },
            CMD_CALIBRATE => {
                require_len(&frame, 4)?;
                Ok(StepperCommand::Calibrate {
                    motor_id,
                    mode: frame.data[1],
                    direction: frame.data[2] as i8,
                    timeout_s: frame.data[3],
                })
            },
            CMD_SYNCHRONIZE => {
                require_len(&frame, 2)?;
                Ok(StepperCommand::Synchronize {
                    begin_trajectory: frame.data[1] != 0,
                })
            },
            CMD_REQUEST_FIRMWARE => Ok(StepperCommand::RequestFirmware),
            other => Err(ProtocolError::InvalidValue {
                field: "StepperCommand".to_string(),
                value: other as u32,
            }),
        }
    }
}

// ============================================================================
// 反馈帧
// ============================================================================

/// 反馈帧负载
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeedbackData {
    /// 当前位置（步数）
    Position { steps: i32 },
    /// 诊断信息
    ///
    /// - 温度单位：1℃
    /// - 电压单位：1mV
    Diagnostics {
        temperature: i16,
        voltage_mv: u16,
        fault: StepperFault,
    },
    /// 校准结果
    Calibration { outcome: CalibrationOutcome },
    /// 固件版本
    Firmware { major: u8, minor: u8, patch: u8 },
}

/// 步进电机反馈帧 (0x201~0x20F)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepperFeedback {
    pub motor_id: u8, // 从 ID 推导：0x201 -> 1, 0x202 -> 2, ...
    pub data: FeedbackData,
}

impl StepperFeedback {
    /// 转换为 CAN 帧（用于仿真硬件）
    pub fn to_frame(&self) -> GaussFrame {
        let id = feedback_id(self.motor_id) as u16;
        match self.data {
            FeedbackData::Position { steps } => {
                let mut data = [0u8; 5];
                data[0] = DATA_POSITION;
                data[1..5].copy_from_slice(&i32_to_bytes_be(steps));
                GaussFrame::new_standard(id, &data)
            },
            FeedbackData::Diagnostics {
                temperature,
                voltage_mv,
                fault,
            } => {
                let mut data = [0u8; 6];
                data[0] = DATA_DIAGNOSTICS;
                data[1..3].copy_from_slice(&temperature.to_be_bytes());
                data[3..5].copy_from_slice(&voltage_mv.to_be_bytes());
                data[5] = fault.code();
                GaussFrame::new_standard(id, &data)
            },
            FeedbackData::Calibration { outcome } => {
                GaussFrame::new_standard(id, &[DATA_CALIBRATION_RESULT, outcome.into()])
            },
            FeedbackData::Firmware {
                major,
                minor,
                patch,
            } => GaussFrame::new_standard(id, &[DATA_FIRMWARE_VERSION, major, minor, patch]),
        }
    }
}

impl TryFrom<GaussFrame> for StepperFeedback {
    type Error = ProtocolError;

    fn try_from(frame: GaussFrame) -> Result<Self, Self::Error> {
        let motor_id =
            motor_id_from_feedback(frame.id).ok_or(ProtocolError::InvalidCanId { id: frame.id })?;
        require_len(&frame, 1)?;

        let data = match frame.data[0] {
            DATA_POSITION => {
                require_len(&frame, 5)?;
                FeedbackData::Position {
                    steps: bytes_to_i32_be([frame.data[1], frame.data[2], frame.data[3], frame.data[4]]),
                }
            },
            DATA_DIAGNOSTICS => {
                require_len(&frame, 6)?;
                FeedbackData::Diagnostics {
                    temperature: bytes_to_i16_be([frame.data[1], frame.data[2]]),
                    voltage_mv: u16::from_be_bytes([frame.data[3], frame.data[4]]),
                    // 使用 bilge 解析位域（Byte 5）
                    fault: StepperFault::from(u8::new(frame.data[5])),
                }
            },
            DATA_CALIBRATION_RESULT => {
                require_len(&frame, 2)?;
                let outcome = CalibrationOutcome::try_from(frame.data[1]).map_err(|e| {
                    ProtocolError::InvalidValue {
                        field: "CalibrationOutcome".to_string(),
                        value: e.number as u32,
                    }
                })?;
                FeedbackData::Calibration { outcome }
            },
            DATA_FIRMWARE_VERSION => {
                require_len(&frame, 4)?;
                FeedbackData::Firmware {
                    major: frame.data[1],
                    minor: frame.data[2],
                    patch: frame.data[3],
                }
            },
            other => {
                return Err(ProtocolError::InvalidValue {
                    field: "StepperFeedback".to_string(),
                    value: other as u32,
                });
            },
        };

        Ok(Self { motor_id, data })
    }
}

fn require_len(frame: &GaussFrame, expected: usize) -> Result<(), ProtocolError> {
    if (frame.len as usize) < expected {
        return Err(ProtocolError::InvalidLength {
            expected,
            actual: frame.len as usize,
        });
    }
    Ok(())
}
