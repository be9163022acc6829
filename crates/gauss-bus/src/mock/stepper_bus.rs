//! 步进电机 CAN 总线仿真

use crate::{BusError, CanAdapter, GaussFrame};
use gauss_protocol::stepper::FeedbackData;
use gauss_protocol::{CalibrationOutcome, StepperCommand, StepperFault, StepperFeedback};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::Arc;
use tracing::trace;

struct SimStepper {
    steps: i32,
    torque: bool,
    online: bool,
    firmware: (u8, u8, u8),
    temperature: i16,
    voltage_mv: u16,
    fault: u8,
    calibration_outcome: CalibrationOutcome,
}

impl Default for SimStepper {
    fn default() -> Self {
        Self {
            steps: 0,
            torque: true,
            online: true,
            firmware: (2, 1, 0),
            temperature: 35,
            voltage_mv: 11_800,
            fault: 0,
            calibration_outcome: CalibrationOutcome::Ok,
        }
    }
}

#[derive(Default)]
struct BusState {
    steppers: BTreeMap<u8, SimStepper>,
    rx: VecDeque<GaussFrame>,
    /// 本轮反馈已发出，下一次空队列返回超时
    round_emitted: bool,
    /// 为 `true` 时校准结果等待 [`SimulatedStepperBus::finish_calibration`]
    hold_calibration: bool,
    pending_calibration: Vec<u8>,
    sent: Vec<StepperCommand>,
    disconnected: bool,
}

impl BusState {
    fn push(&mut self, motor_id: u8, data: FeedbackData) {
        self.rx.push_back(StepperFeedback { motor_id, data }.to_frame());
    }

    fn emit_round(&mut self) {
        let frames: Vec<_> = self
            .steppers
            .iter()
            .filter(|(_, s)| s.online)
            .flat_map(|(id, s)| {
                [
                    StepperFeedback {
                        motor_id: *id,
                        data: FeedbackData::Position { steps: s.steps },
                    },
                    StepperFeedback {
                        motor_id: *id,
                        data: FeedbackData::Diagnostics {
                            temperature: s.temperature,
                            voltage_mv: s.voltage_mv,
                            fault: StepperFault::from_code(s.fault),
                        },
                    },
                ]
            })
            .map(|fb| fb.to_frame())
            .collect();
        self.rx.extend(frames);
    }

    fn report_calibration(&mut self, motor_id: u8) {
        let Some(stepper) = self.steppers.get_mut(&motor_id).filter(|s| s.online) else {
            return;
        };
        let outcome = stepper.calibration_outcome;
        if outcome.is_ok() {
            stepper.steps = 0;
        }
        self.push(motor_id, FeedbackData::Calibration { outcome });
    }

    fn handle(&mut self, command: StepperCommand) {
        match command {
            StepperCommand::Position { motor_id, steps } => {
                if let Some(s) = self.steppers.get_mut(&motor_id).filter(|s| s.online && s.torque) {
                    s.steps = steps;
                }
            },
            StepperCommand::Torque { motor_id, enabled } => {
                if let Some(s) = self.steppers.get_mut(&motor_id) {
                    s.torque = enabled;
                }
            },
            StepperCommand::Calibrate { motor_id, .. } => {
                if self.hold_calibration {
                    self.pending_calibration.push(motor_id);
                } else {
                    self.report_calibration(motor_id);
                }
            },
            StepperCommand::RequestFirmware => {
                let versions: Vec<_> = self
                    .steppers
                    .iter()
                    .filter(|(_, s)| s.online)
                    .map(|(id, s)| (*id, s.firmware))
                    .collect();
                for (id, (major, minor, patch)) in versions {
                    self.push(id, FeedbackData::Firmware { major, minor, patch });
                }
            },
            StepperCommand::Synchronize { .. } => {},
        }
    }
}

/// 仿真步进电机总线
///
/// 命令帧立即生效；接收队列为空时发出一轮反馈（每个在线电机一帧位置 + 一帧诊断），
/// 再次为空时返回 [`BusError::Timeout`]，对应真实总线上"一个周期的反馈已读完"。
#[derive(Clone, Default)]
pub struct SimulatedStepperBus {
    state: Arc<Mutex<BusState>>,
}

impl SimulatedStepperBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_steppers(self, ids: impl IntoIterator<Item = u8>) -> Self {
        {
            let mut state = self.state.lock();
            for id in ids {
                state.steppers.insert(id, SimStepper::default());
            }
        }
        self
    }

    pub fn set_online(&self, id: u8, online: bool) {
        if let Some(s) = self.state.lock().steppers.get_mut(&id) {
            s.online = online;
        }
    }

    /// 所有电机在线 / 离线
    pub fn set_all_online(&self, online: bool) {
        for s in self.state.lock().steppers.values_mut() {
            s.online = online;
        }
    }

    /// 模拟 CAN 接口故障：收发返回 IO 错误
    pub fn set_disconnected(&self, disconnected: bool) {
        self.state.lock().disconnected = disconnected;
    }

    pub fn set_firmware(&self, id: u8, version: (u8, u8, u8)) {
        if let Some(s) = self.state.lock().steppers.get_mut(&id) {
            s.firmware = version;
        }
    }

    pub fn set_fault(&self, id: u8, fault: u8) {
        if let Some(s) = self.state.lock().steppers.get_mut(&id) {
            s.fault = fault;
        }
    }

    pub fn set_calibration_outcome(&self, id: u8, outcome: CalibrationOutcome) {
        if let Some(s) = self.state.lock().steppers.get_mut(&id) {
            s.calibration_outcome = outcome;
        }
    }

    /// 校准指令不立即应答，直到调用 [`Self::finish_calibration`]
    pub fn hold_calibration(&self, hold: bool) {
        self.state.lock().hold_calibration = hold;
    }

    /// 发出所有等待中的校准结果
    pub fn finish_calibration(&self) {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending_calibration);
        for id in pending {
            state.report_calibration(id);
        }
    }

    pub fn steps(&self, id: u8) -> Option<i32> {
        self.state.lock().steppers.get(&id).map(|s| s.steps)
    }

    pub fn torque_enabled(&self, id: u8) -> Option<bool> {
        self.state.lock().steppers.get(&id).map(|s| s.torque)
    }

    /// 收到的全部命令（按顺序）
    pub fn sent_commands(&self) -> Vec<StepperCommand> {
        self.state.lock().sent.clone()
    }

    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }
}

fn unplugged() -> BusError {
    BusError::Io(io::Error::new(
        io::ErrorKind::NotConnected,
        "simulated CAN interface down",
    ))
}

impl CanAdapter for SimulatedStepperBus {
    fn send(&mut self, frame: GaussFrame) -> Result<(), BusError> {
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(unplugged());
        }
        match StepperCommand::try_from(frame) {
            Ok(command) => {
                trace!("SimulatedStepperBus <- {:?}", command);
                state.sent.push(command);
                state.handle(command);
            },
            Err(e) => trace!("SimulatedStepperBus ignored frame 0x{:X}: {}", frame.id, e),
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<GaussFrame, BusError> {
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(unplugged());
        }
        if let Some(frame) = state.rx.pop_front() {
            return Ok(frame);
        }
        if state.round_emitted {
            state.round_emitted = false;
            return Err(BusError::Timeout);
        }
        state.round_emitted = true;
        state.emit_round();
        state.rx.pop_front().ok_or(BusError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(bus: &mut SimulatedStepperBus) -> Vec<StepperFeedback> {
        let mut out = Vec::new();
        while let Ok(frame) = bus.receive() {
            out.push(StepperFeedback::try_from(frame).unwrap());
        }
        out
    }

    #[test]
    fn test_one_round_per_drain() {
        let mut bus = SimulatedStepperBus::new().with_steppers([1, 2, 3]);
        assert_eq!(drain(&mut bus).len(), 6);
        assert_eq!(drain(&mut bus).len(), 6);
    }

    #[test]
    fn test_position_command_moves_stepper() {
        let mut bus = SimulatedStepperBus::new().with_steppers([1]);
        bus.send(StepperCommand::Position { motor_id: 1, steps: 1234 }.to_frame())
            .unwrap();
        assert_eq!(bus.steps(1), Some(1234));
        let feedback = drain(&mut bus);
        assert!(feedback.contains(&StepperFeedback {
            motor_id: 1,
            data: FeedbackData::Position { steps: 1234 }
        }));
    }

    #[test]
    fn test_offline_stepper_is_silent() {
        let mut bus = SimulatedStepperBus::new().with_steppers([1, 2]);
        bus.set_online(2, false);
        assert!(drain(&mut bus).iter().all(|fb| fb.motor_id == 1));
    }

    #[test]
    fn test_held_calibration() {
        let mut bus = SimulatedStepperBus::new().with_steppers([1]);
        bus.hold_calibration(true);
        bus.send(
            StepperCommand::Calibrate {
                motor_id: 1,
                mode: 1,
                direction: 1,
                timeout_s: 30,
            }
            .to_frame(),
        )
        .unwrap();
        let before = drain(&mut bus);
        assert!(!before.iter().any(|fb| matches!(fb.data, FeedbackData::Calibration { .. })));

        bus.finish_calibration();
        let after = drain(&mut bus);
        assert!(matches!(
            after[0].data,
            FeedbackData::Calibration {
                outcome: CalibrationOutcome::Ok
            }
        ));
    }

    #[test]
    fn test_disconnected_bus_errors() {
        let mut bus = SimulatedStepperBus::new().with_steppers([1]);
        bus.set_disconnected(true);
        assert!(matches!(bus.receive(), Err(BusError::Io(_))));
    }
}
