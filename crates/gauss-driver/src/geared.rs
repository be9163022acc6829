//! CAN 步进电机总线
//!
//! 减速步进电机（肩、肘等大关节）挂在一条 CAN 总线上。命令是单向的：位置帧发出即
//! 认为完成，不等待应答；电机周期性上报位置和诊断帧，每个电机的最近一次反馈时间由
//! [`ConnectionMonitor`] 记录，超时视为掉线。
//!
//! 回零校准期间不发送位置目标，校准结果帧汇总后通过 channel 上报给编排层。

use crate::calibration::{CalibrationMode, CalibrationReport};
use crate::command::GoalMailbox;
use crate::config::CanBusConfig;
use crate::error::HardwareError;
use crate::heartbeat::{ConnectionMonitor, HealthTracker};
use crate::state::{BusKind, ConnectionState, FirmwareVersion, MotorTelemetry};
use crate::version::{StepperSpec, SubPose};
use arc_swap::ArcSwap;
use crossbeam_channel::Sender;
use gauss_bus::{BusError, CanAdapter};
use gauss_protocol::stepper::FeedbackData;
use gauss_protocol::{CalibrationOutcome, GaussFrame, ProtocolError, StepperCommand, StepperFeedback};
use parking_lot::Mutex;
use semver::Version;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// 低于该版本的步进电机固件只告警，不拒绝
pub const MIN_STEPPER_FIRMWARE: Version = Version::new(2, 0, 0);

/// 步进电机类型名（遥测中的 `motor_type`）
pub const STEPPER_MOTOR_TYPE: &str = "Stepper";

#[derive(Debug)]
struct HomingSession {
    attempt: u64,
    pending: BTreeSet<u8>,
    failures: Vec<String>,
    deadline: Instant,
}

/// 一次接收循环的结果
#[derive(Debug, Default)]
struct DrainSummary {
    seen: BTreeSet<u8>,
    malformed: Option<ProtocolError>,
}

/// CAN 步进电机总线驱动
pub struct GearedJointBus {
    adapter: Mutex<Box<dyn CanAdapter>>,
    steppers: &'static [StepperSpec],
    config: CanBusConfig,
    health: HealthTracker,
    monitors: Vec<ConnectionMonitor>,
    positions: ArcSwap<Vec<f64>>,
    telemetry: ArcSwap<Vec<Option<MotorTelemetry>>>,
    firmware: ArcSwap<Vec<Option<FirmwareVersion>>>,
    goals: GoalMailbox,
    torque_enabled: AtomicBool,
    homing: Mutex<Option<HomingSession>>,
    poll_count: AtomicU64,
    reports: Sender<CalibrationReport>,
}

impl GearedJointBus {
    pub fn new(
        adapter: Box<dyn CanAdapter>,
        steppers: &'static [StepperSpec],
        config: CanBusConfig,
        reports: Sender<CalibrationReport>,
    ) -> Self {
        let monitors = steppers
            .iter()
            .map(|_| ConnectionMonitor::new(config.feedback_timeout()))
            .collect();
        Self {
            adapter: Mutex::new(adapter),
            steppers,
            health: HealthTracker::new(BusKind::Can, config.lost_after_failures),
            config,
            monitors,
            positions: ArcSwap::from_pointee(vec![0.0; steppers.len()]),
            telemetry: ArcSwap::from_pointee(vec![None; steppers.len()]),
            firmware: ArcSwap::from_pointee(vec![None; steppers.len()]),
            goals: GoalMailbox::new(),
            torque_enabled: AtomicBool::new(true),
            homing: Mutex::new(None),
            poll_count: AtomicU64::new(0),
            reports,
        }
    }

    pub fn steppers(&self) -> &'static [StepperSpec] {
        self.steppers
    }

    fn index_of(&self, motor_id: u8) -> Option<usize> {
        self.steppers.iter().position(|s| s.motor_id == motor_id)
    }

    fn send(adapter: &mut dyn CanAdapter, command: StepperCommand) -> Result<(), HardwareError> {
        trace!("CAN TX {:?}", command);
        adapter
            .send(command.to_frame())
            .map_err(|e| HardwareError::from_bus(BusKind::Can, e))
    }

    /// 初始化扫描：请求固件版本，等待每个电机至少上报一次
    pub fn scan(&self) -> Result<(), HardwareError> {
        let result = self.scan_inner();
        self.health.record(&result);
        result
    }

    fn scan_inner(&self) -> Result<(), HardwareError> {
        let mut adapter = self.adapter.lock();
        Self::send(&mut **adapter, StepperCommand::RequestFirmware)?;

        let deadline = Instant::now() + self.config.feedback_timeout();
        let mut seen = BTreeSet::new();
        loop {
            seen.extend(self.drain(&mut **adapter)?.seen);
            let all_seen = self.steppers.iter().all(|s| seen.contains(&s.motor_id));
            if all_seen || Instant::now() >= deadline {
                break;
            }
        }
        drop(adapter);

        let missing: Vec<u8> = self
            .steppers
            .iter()
            .map(|s| s.motor_id)
            .filter(|id| !seen.contains(id))
            .collect();
        if missing.is_empty() {
            info!("CAN bus: {} steppers found", self.steppers.len());
            Ok(())
        } else {
            Err(HardwareError::connection(
                BusKind::Can,
                format!("steppers {:?} not responding", missing),
            ))
        }
    }

    /// 一次轮询并更新连接状态
    pub fn check_connection(&self) -> ConnectionState {
        let result = self.poll();
        self.health.record(&result)
    }

    /// 一次轮询：发出待发目标 → 读完本轮反馈 → 校准超时检查 → 掉线检查
    pub fn poll(&self) -> Result<(), HardwareError> {
        self.poll_count.fetch_add(1, Ordering::Relaxed);
        let summary = {
            let mut adapter = self.adapter.lock();
            self.flush_goals(&mut **adapter)?;
            self.drain(&mut **adapter)?
        };
        self.expire_homing();

        let stale: Vec<u8> = self
            .steppers
            .iter()
            .zip(&self.monitors)
            .filter(|(_, monitor)| !monitor.check_connection())
            .map(|(spec, _)| spec.motor_id)
            .collect();
        if !stale.is_empty() {
            return Err(HardwareError::connection(
                BusKind::Can,
                format!(
                    "steppers {:?} silent for more than {}ms",
                    stale, self.config.feedback_timeout_ms
                ),
            ));
        }
        match summary.malformed {
            Some(e) => Err(HardwareError::Protocol(e)),
            None => Ok(()),
        }
    }

    fn flush_goals(&self, adapter: &mut dyn CanAdapter) -> Result<(), HardwareError> {
        let Some(goal) = self.goals.take() else {
            return Ok(());
        };
        if self.homing.lock().is_some() {
            trace!("CAN goal discarded: calibration in progress");
            return Ok(());
        }
        if !self.torque_enabled.load(Ordering::Acquire) {
            trace!("CAN goal discarded: learning mode active");
            return Ok(());
        }
        for (spec, rad) in self.steppers.iter().zip(goal.iter()) {
            Self::send(
                adapter,
                StepperCommand::Position {
                    motor_id: spec.motor_id,
                    steps: spec.rad_to_steps(*rad),
                },
            )?;
        }
        Ok(())
    }

    /// 读取反馈帧直到接收超时（本轮读完）或达到单轮上限
    fn drain(&self, adapter: &mut dyn CanAdapter) -> Result<DrainSummary, HardwareError> {
        let mut summary = DrainSummary::default();
        let mut positions: Vec<f64> = self.positions.load().as_ref().clone();
        let mut telemetry = self.telemetry.load().as_ref().clone();
        let mut firmware = self.firmware.load().as_ref().clone();

        for _ in 0..self.config.max_frames_per_poll {
            let frame = match adapter.receive_timeout(self.config.receive_timeout()) {
                Ok(frame) => frame,
                Err(BusError::Timeout) => break,
                Err(e) => return Err(HardwareError::from_bus(BusKind::Can, e)),
            };
            let feedback = match parse_feedback(frame) {
                Ok(Some(feedback)) => feedback,
                Ok(None) => continue,
                Err(e) => {
                    debug!("CAN frame 0x{:X} malformed: {}", frame.id, e);
                    summary.malformed.get_or_insert(e);
                    continue;
                },
            };
            let Some(index) = self.index_of(feedback.motor_id) else {
                trace!("CAN feedback from unknown stepper {}", feedback.motor_id);
                continue;
            };
            let spec = &self.steppers[index];
            self.monitors[index].register_feedback();
            summary.seen.insert(spec.motor_id);

            match feedback.data {
                FeedbackData::Position { steps } => positions[index] = spec.steps_to_rad(steps),
                FeedbackData::Diagnostics {
                    temperature,
                    voltage_mv,
                    fault,
                } => {
                    if fault.any() {
                        trace!("{} fault: {:?}", spec.name, fault);
                    }
                    telemetry[index] = Some(MotorTelemetry {
                        name: spec.name.to_string(),
                        motor_type: STEPPER_MOTOR_TYPE.to_string(),
                        temperature: temperature as i32,
                        voltage: voltage_mv as f64 / 1000.0,
                        error_code: fault.code() as i32,
                    });
                },
                FeedbackData::Firmware {
                    major,
                    minor,
                    patch,
                } => {
                    let version = Version::new(major as u64, minor as u64, patch as u64);
                    if version < MIN_STEPPER_FIRMWARE {
                        warn!(
                            "{} firmware {} is older than {}",
                            spec.name, version, MIN_STEPPER_FIRMWARE
                        );
                    }
                    firmware[index] = Some(FirmwareVersion {
                        motor_name: spec.name.to_string(),
                        version: version.to_string(),
                    });
                },
                FeedbackData::Calibration { outcome } => self.on_calibration_result(spec, outcome),
            }
        }

        self.positions.store(Arc::new(positions));
        self.telemetry.store(Arc::new(telemetry));
        self.firmware.store(Arc::new(firmware));
        Ok(summary)
    }

    fn on_calibration_result(&self, spec: &StepperSpec, outcome: CalibrationOutcome) {
        let mut homing = self.homing.lock();
        let Some(session) = homing.as_mut() else {
            debug!("{} calibration result {:?} outside a calibration", spec.name, outcome);
            return;
        };
        if !session.pending.remove(&spec.motor_id) {
            return;
        }
        if outcome.is_ok() {
            info!("{} calibrated", spec.name);
        } else {
            warn!("{} calibration failed: {:?}", spec.name, outcome);
            session
                .failures
                .push(format!("{}: {:?}", spec.name, outcome));
        }

        if session.pending.is_empty()
            && let Some(done) = homing.take()
        {
            let outcome = if done.failures.is_empty() {
                Ok(())
            } else {
                Err(done.failures.join("; "))
            };
            self.report(done.attempt, outcome);
        }
    }

    fn expire_homing(&self) {
        let mut homing = self.homing.lock();
        if homing.as_ref().is_some_and(|s| Instant::now() >= s.deadline)
            && let Some(expired) = homing.take()
        {
            let message = format!(
                "calibration timed out waiting for steppers {:?}",
                expired.pending
            );
            warn!("CAN bus: {}", message);
            self.report(expired.attempt, Err(message));
        }
    }

    fn report(&self, attempt: u64, outcome: Result<(), String>) {
        let report = CalibrationReport {
            bus: BusKind::Can,
            attempt,
            outcome,
        };
        if self.reports.send(report).is_err() {
            warn!("CAN bus: calibration report dropped, receiver closed");
        }
    }

    /// 开始回零校准
    ///
    /// 结果在后续轮询中收到校准结果帧后上报；超过 `calibration_timeout_s` 仍未收齐
    /// 则上报失败。
    pub fn request_homing(&self, mode: CalibrationMode, attempt: u64) -> Result<(), HardwareError> {
        let mut adapter = self.adapter.lock();
        self.goals.take();
        for spec in self.steppers {
            Self::send(
                &mut **adapter,
                StepperCommand::Calibrate {
                    motor_id: spec.motor_id,
                    mode: mode.as_u8(),
                    direction: spec.direction,
                    timeout_s: self.config.calibration_timeout_s,
                },
            )?;
        }
        *self.homing.lock() = Some(HomingSession {
            attempt,
            pending: self.steppers.iter().map(|s| s.motor_id).collect(),
            failures: Vec::new(),
            deadline: Instant::now() + self.config.calibration_timeout(),
        });
        info!("CAN bus: calibration #{} started ({:?})", attempt, mode);
        Ok(())
    }

    pub fn is_homing(&self) -> bool {
        self.homing.lock().is_some()
    }

    /// 写入关节目标（覆盖尚未发出的上一条）
    pub fn write_goals(&self, goal: SubPose) {
        if goal.len() != self.steppers.len() {
            warn!(
                "CAN goal has {} joints, expected {}; ignored",
                goal.len(),
                self.steppers.len()
            );
            return;
        }
        self.goals.put(goal);
    }

    /// 力矩使能（学习模式下关闭）
    pub fn set_torque(&self, enabled: bool) -> Result<(), HardwareError> {
        let mut adapter = self.adapter.lock();
        for spec in self.steppers {
            Self::send(
                &mut **adapter,
                StepperCommand::Torque {
                    motor_id: spec.motor_id,
                    enabled,
                },
            )?;
        }
        drop(adapter);

        self.torque_enabled.store(enabled, Ordering::Release);
        if !enabled {
            self.goals.take();
        }
        debug!("CAN torque {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    pub fn is_torque_enabled(&self) -> bool {
        self.torque_enabled.load(Ordering::Acquire)
    }

    /// 轨迹同步边界（广播）
    pub fn mark_sync_boundary(&self, begin_trajectory: bool) -> Result<(), HardwareError> {
        Self::send(
            &mut **self.adapter.lock(),
            StepperCommand::Synchronize { begin_trajectory },
        )
    }

    pub fn positions(&self) -> Vec<f64> {
        self.positions.load().as_ref().clone()
    }

    /// 收到过诊断帧的电机
    pub fn telemetry(&self) -> Vec<MotorTelemetry> {
        self.telemetry.load().iter().flatten().cloned().collect()
    }

    pub fn firmware_versions(&self) -> Vec<FirmwareVersion> {
        self.firmware.load().iter().flatten().cloned().collect()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.health.state()
    }

    pub fn poll_count(&self) -> u64 {
        self.poll_count.load(Ordering::Relaxed)
    }
}

/// 解析反馈帧；不是反馈帧 ID 的帧（例如其他节点的命令帧）返回 `None`
fn parse_feedback(frame: GaussFrame) -> Result<Option<StepperFeedback>, ProtocolError> {
    match StepperFeedback::try_from(frame) {
        Ok(feedback) => Ok(Some(feedback)),
        Err(ProtocolError::InvalidCanId { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}
