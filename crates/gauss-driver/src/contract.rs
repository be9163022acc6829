//! 通讯层对外接口
//!
//! 传输层（机器人中间件或 CLI）只通过 [`RobotCommunication`] 访问硬件，
//! 实现有两种：真实硬件的 [`HardwareOrchestrator`] 和测试用的 [`FakeCommunication`]，
//! 在构造时选定。

use crate::builder::OrchestratorBuilder;
use crate::calibration::CalibrationMode;
use crate::command::ToolCommand;
use crate::config::HardwareConfig;
use crate::error::HardwareError;
use crate::fake::FakeCommunication;
use crate::orchestrator::HardwareOrchestrator;
use crate::state::{FirmwareVersion, HardwareStatus, JointPose, LedPattern, LedReply};
use crate::version::HardwareVersion;

/// 机器人通讯接口
///
/// 所有返回遥测的调用都是非阻塞的快照读取。需要整数返回值的传输层使用
/// [`HardwareError::status_code`] 转换错误。
pub trait RobotCommunication: Send + Sync {
    fn init(&self) -> Result<(), HardwareError>;

    /// 一次同步的连接监督过程
    fn manage_hardware_connection(&self) -> Result<(), HardwareError>;

    fn is_connection_ok(&self) -> bool;

    fn start_control_loop(&self) -> Result<(), HardwareError>;
    fn stop_control_loop(&self);
    fn resume_control_loop(&self) -> Result<(), HardwareError>;

    fn get_current_position(&self) -> JointPose;
    fn get_hardware_status(&self) -> HardwareStatus;
    fn get_firmware_versions(&self) -> Vec<FirmwareVersion>;

    /// 不等待执行，后写覆盖先写
    fn send_position_to_robot(&self, pose: JointPose) -> Result<(), HardwareError>;

    fn activate_learning_mode(&self, activate: bool) -> Result<(), HardwareError>;
    fn set_leds(&self, pattern: &LedPattern) -> LedReply;
    fn synchronize_motors(&self, begin_trajectory: bool) -> Result<(), HardwareError>;

    fn allow_motors_calibration_to_start(&self, mode: CalibrationMode) -> Result<(), HardwareError>;
    fn request_new_calibration(&self);
    fn is_calibration_in_progress(&self) -> bool;

    fn ping_and_set_tool(&self, id: u8, name: &str) -> Result<(), HardwareError>;
    fn send_tool_command(&self, id: u8, command: ToolCommand) -> Result<(), HardwareError>;

    fn open_gripper(&self, id: u8, position: u16, speed: u16, hold_torque: u16) -> Result<(), HardwareError> {
        self.send_tool_command(
            id,
            ToolCommand::OpenGripper {
                position,
                speed,
                hold_torque,
            },
        )
    }

    fn close_gripper(
        &self,
        id: u8,
        position: u16,
        speed: u16,
        hold_torque: u16,
        max_torque: u16,
    ) -> Result<(), HardwareError> {
        self.send_tool_command(
            id,
            ToolCommand::CloseGripper {
                position,
                speed,
                hold_torque,
                max_torque,
            },
        )
    }

    fn pull_air_vacuum_pump(&self, id: u8, position: u16, hold_torque: u16) -> Result<(), HardwareError> {
        self.send_tool_command(
            id,
            ToolCommand::PullVacuum {
                position,
                hold_torque,
            },
        )
    }

    fn push_air_vacuum_pump(&self, id: u8, position: u16) -> Result<(), HardwareError> {
        self.send_tool_command(id, ToolCommand::PushVacuum { position })
    }
}

impl RobotCommunication for HardwareOrchestrator {
    fn init(&self) -> Result<(), HardwareError> {
        HardwareOrchestrator::init(self)
    }

    fn manage_hardware_connection(&self) -> Result<(), HardwareError> {
        HardwareOrchestrator::manage_hardware_connection(self)
    }

    fn is_connection_ok(&self) -> bool {
        HardwareOrchestrator::is_connection_ok(self)
    }

    fn start_control_loop(&self) -> Result<(), HardwareError> {
        HardwareOrchestrator::start_control_loop(self)
    }

    fn stop_control_loop(&self) {
        HardwareOrchestrator::stop_control_loop(self)
    }

    fn resume_control_loop(&self) -> Result<(), HardwareError> {
        HardwareOrchestrator::resume_control_loop(self)
    }

    fn get_current_position(&self) -> JointPose {
        HardwareOrchestrator::get_current_position(self)
    }

    fn get_hardware_status(&self) -> HardwareStatus {
        HardwareOrchestrator::get_hardware_status(self)
    }

    fn get_firmware_versions(&self) -> Vec<FirmwareVersion> {
        HardwareOrchestrator::get_firmware_versions(self)
    }

    fn send_position_to_robot(&self, pose: JointPose) -> Result<(), HardwareError> {
        HardwareOrchestrator::send_position_to_robot(self, pose)
    }

    fn activate_learning_mode(&self, activate: bool) -> Result<(), HardwareError> {
        HardwareOrchestrator::activate_learning_mode(self, activate)
    }

    fn set_leds(&self, pattern: &LedPattern) -> LedReply {
        HardwareOrchestrator::set_leds(self, pattern)
    }

    fn synchronize_motors(&self, begin_trajectory: bool) -> Result<(), HardwareError> {
        HardwareOrchestrator::synchronize_motors(self, begin_trajectory)
    }

    fn allow_motors_calibration_to_start(&self, mode: CalibrationMode) -> Result<(), HardwareError> {
        HardwareOrchestrator::allow_motors_calibration_to_start(self, mode)
    }

    fn request_new_calibration(&self) {
        HardwareOrchestrator::request_new_calibration(self);
    }

    fn is_calibration_in_progress(&self) -> bool {
        HardwareOrchestrator::is_calibration_in_progress(self)
    }

    fn ping_and_set_tool(&self, id: u8, name: &str) -> Result<(), HardwareError> {
        HardwareOrchestrator::ping_and_set_tool(self, id, name)
    }

    fn send_tool_command(&self, id: u8, command: ToolCommand) -> Result<(), HardwareError> {
        HardwareOrchestrator::send_tool_command(self, id, command)
    }
}

/// 通讯层实现选择
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// 真实硬件
    #[default]
    Hardware,
    /// 无硬件的替身（回显位置，固定遥测）
    Fake,
}

/// 按配置构造通讯层
pub fn create_communication(
    backend: Backend,
    config: HardwareConfig,
) -> Result<Box<dyn RobotCommunication>, HardwareError> {
    match backend {
        Backend::Hardware => Ok(Box::new(OrchestratorBuilder::new().config(config).build()?)),
        Backend::Fake => {
            config.validate()?;
            Ok(Box::new(FakeCommunication::new(
                config.hardware_version.explicit().unwrap_or(HardwareVersion::V2),
            )))
        },
    }
}
