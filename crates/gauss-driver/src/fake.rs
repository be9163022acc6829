//! 无硬件的通讯层替身
//!
//! 用于在没有机械臂的机器上运行上层栈：写入的位姿原样回显，遥测和固件版本是固定值，
//! 校准请求立即完成。

use crate::calibration::{CalibrationController, CalibrationMode, CalibrationReport};
use crate::command::ToolCommand;
use crate::contract::RobotCommunication;
use crate::error::HardwareError;
use crate::mode::{AtomicLoopState, LoopState};
use crate::state::{
    BusKind, ConnectionState, FirmwareVersion, HardwareStatus, JOINT_COUNT, JointPose, LedPattern,
    LedReply, MotorTelemetry,
};
use crate::version::{HardwareVersion, JointMapping, resolve};
use gauss_protocol::{LedColor, MotorModel};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

const FAKE_STEPPER_FIRMWARE: &str = "2.1.0";
const FAKE_SERVO_FIRMWARE: &str = "45";

/// 回显位姿的通讯层替身
pub struct FakeCommunication {
    version: HardwareVersion,
    mapping: &'static JointMapping,
    initialized: AtomicBool,
    pose: Mutex<JointPose>,
    leds: Mutex<Vec<LedColor>>,
    tool: Mutex<Option<(u8, String)>>,
    learning_mode: AtomicBool,
    loop_state: AtomicLoopState,
    calibration: CalibrationController,
}

impl FakeCommunication {
    pub fn new(version: HardwareVersion) -> Self {
        let mapping = resolve(version);
        Self {
            version,
            mapping,
            initialized: AtomicBool::new(false),
            pose: Mutex::new(mapping.merge(None, None)),
            leds: Mutex::new(vec![LedColor::Off; mapping.led_count()]),
            tool: Mutex::new(None),
            learning_mode: AtomicBool::new(false),
            loop_state: AtomicLoopState::new(LoopState::Stopped),
            calibration: CalibrationController::new(),
        }
    }

    pub fn hardware_version(&self) -> HardwareVersion {
        self.version
    }

    pub fn is_learning_mode(&self) -> bool {
        self.learning_mode.load(Ordering::Acquire)
    }

    pub fn led_state(&self) -> Vec<LedColor> {
        self.leds.lock().clone()
    }

    pub fn loop_state(&self) -> LoopState {
        self.loop_state.get()
    }

    fn ensure_initialized(&self) -> Result<(), HardwareError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(HardwareError::NotInitialized)
        }
    }

    fn telemetry(&self) -> Vec<MotorTelemetry> {
        let steppers = self.mapping.steppers.iter().map(|stepper| MotorTelemetry {
            name: stepper.name.to_string(),
            motor_type: "Stepper".to_string(),
            temperature: 30,
            voltage: 12.0,
            error_code: 0,
        });
        let servos = self.mapping.servos.iter().map(|servo| MotorTelemetry {
            name: servo.name.to_string(),
            motor_type: servo.model.name().to_string(),
            temperature: 30,
            voltage: 7.4,
            error_code: 0,
        });
        steppers.chain(servos).collect()
    }
}

impl RobotCommunication for FakeCommunication {
    fn init(&self) -> Result<(), HardwareError> {
        if !self.initialized.swap(true, Ordering::AcqRel) {
            info!("Fake hardware {:?} initialized", self.version);
        }
        Ok(())
    }

    fn manage_hardware_connection(&self) -> Result<(), HardwareError> {
        self.ensure_initialized()
    }

    fn is_connection_ok(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn start_control_loop(&self) -> Result<(), HardwareError> {
        self.ensure_initialized()?;
        self.loop_state.set(LoopState::Running);
        Ok(())
    }

    fn stop_control_loop(&self) {
        self.loop_state.set(LoopState::Stopped);
    }

    fn resume_control_loop(&self) -> Result<(), HardwareError> {
        self.start_control_loop()
    }

    fn get_current_position(&self) -> JointPose {
        if self.ensure_initialized().is_err() {
            return [0.0; JOINT_COUNT];
        }
        *self.pose.lock()
    }

    fn get_hardware_status(&self) -> HardwareStatus {
        let initialized = self.is_connection_ok();
        HardwareStatus {
            connection_ok: initialized,
            error_message: if initialized {
                String::new()
            } else {
                HardwareError::NotInitialized.to_string()
            },
            calibration_needed: self.calibration.calibration_needed(),
            calibration_in_progress: self.calibration.is_calibration_in_progress(),
            motors: if initialized { self.telemetry() } else { Vec::new() },
            stale: !initialized,
        }
    }

    fn get_firmware_versions(&self) -> Vec<FirmwareVersion> {
        if !self.is_connection_ok() {
            return Vec::new();
        }
        let steppers = self.mapping.steppers.iter().map(|stepper| FirmwareVersion {
            motor_name: stepper.name.to_string(),
            version: FAKE_STEPPER_FIRMWARE.to_string(),
        });
        let servos = self.mapping.servos.iter().map(|servo| FirmwareVersion {
            motor_name: servo.name.to_string(),
            version: FAKE_SERVO_FIRMWARE.to_string(),
        });
        steppers.chain(servos).collect()
    }

    fn send_position_to_robot(&self, pose: JointPose) -> Result<(), HardwareError> {
        self.ensure_initialized()?;
        *self.pose.lock() = pose;
        Ok(())
    }

    fn activate_learning_mode(&self, activate: bool) -> Result<(), HardwareError> {
        self.ensure_initialized()?;
        self.learning_mode.store(activate, Ordering::Release);
        Ok(())
    }

    fn set_leds(&self, pattern: &LedPattern) -> LedReply {
        match pattern.to_colors(self.mapping.led_count()) {
            Ok(colors) => {
                *self.leds.lock() = colors;
                LedReply::ok("LEDs set")
            },
            Err(e) => LedReply::failed(e.to_string()),
        }
    }

    fn synchronize_motors(&self, _begin_trajectory: bool) -> Result<(), HardwareError> {
        self.ensure_initialized()
    }

    fn allow_motors_calibration_to_start(&self, mode: CalibrationMode) -> Result<(), HardwareError> {
        self.ensure_initialized()?;
        let buses = [
            (BusKind::Can, ConnectionState::ok()),
            (BusKind::Dxl, ConnectionState::ok()),
        ];
        let ticket = self.calibration.begin(mode, &buses)?;
        for bus in ticket.buses {
            self.calibration.report(CalibrationReport {
                bus,
                attempt: ticket.attempt,
                outcome: Ok(()),
            });
        }
        debug!("Fake calibration #{} finished", ticket.attempt);
        Ok(())
    }

    fn request_new_calibration(&self) {
        self.calibration.request_new_calibration();
    }

    fn is_calibration_in_progress(&self) -> bool {
        self.calibration.is_calibration_in_progress()
    }

    fn ping_and_set_tool(&self, id: u8, name: &str) -> Result<(), HardwareError> {
        self.ensure_initialized()?;
        if id == 0 {
            self.tool.lock().take();
            return Ok(());
        }
        if self.mapping.servos.iter().any(|servo| servo.id == id) {
            return Err(HardwareError::Tool {
                id,
                message: "id belongs to a joint actuator".to_string(),
            });
        }
        *self.tool.lock() = Some((id, name.to_string()));
        Ok(())
    }

    fn send_tool_command(&self, id: u8, command: ToolCommand) -> Result<(), HardwareError> {
        self.ensure_initialized()?;
        if !self.tool.lock().as_ref().is_some_and(|(bound, _)| *bound == id) {
            return Err(HardwareError::DeviceNotFound { id });
        }
        command
            .validate(MotorModel::Xl320)
            .map_err(|message| HardwareError::Tool { id, message })
    }
}
