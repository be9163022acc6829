//! Dynamixel 执行器总线
//!
//! 半双工串口上的菊花链：腕部关节执行器 + 可选的工具（夹爪/真空泵）。
//!
//! 串口上同一时刻只能有一个事务，所以 [`DxlLink`] 放在互斥锁里，由轮询线程和
//! 工具/LED 调用方串行使用。位置、遥测、固件等快照用 `ArcSwap` 发布，读取方
//! 从不等待串口 IO。

use crate::calibration::{CalibrationMode, CalibrationReport};
use crate::command::{GoalMailbox, SettleAction, ToolCommand};
use crate::config::DxlBusConfig;
use crate::error::HardwareError;
use crate::heartbeat::HealthTracker;
use crate::state::{BusKind, ConnectionState, FirmwareVersion, MotorTelemetry};
use crate::version::{ServoSpec, SubPose};
use arc_swap::ArcSwap;
use crossbeam_channel::Sender;
use gauss_bus::{BusError, SerialAdapter};
use gauss_protocol::dxl::{HEADER_LEN, encode_le, remaining_len};
use gauss_protocol::{InstructionPacket, LedColor, MotorModel, ProtocolError, StatusPacket};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// 单次串口事务的错误
#[derive(Error, Debug)]
pub enum LinkError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// 状态包错误号非零
    #[error("id {id} replied with error 0x{code:02X}")]
    Status { id: u8, code: u8 },
}

impl LinkError {
    /// 设备没有应答
    pub fn is_timeout(&self) -> bool {
        matches!(self, LinkError::Bus(e) if e.is_timeout())
    }
}

/// 串口事务层：指令包 → 状态包
pub struct DxlLink {
    adapter: Box<dyn SerialAdapter>,
    timeout: Duration,
}

impl DxlLink {
    pub fn new(adapter: Box<dyn SerialAdapter>, timeout: Duration) -> Self {
        Self { adapter, timeout }
    }

    /// 取回底层适配器
    pub fn into_adapter(self) -> Box<dyn SerialAdapter> {
        self.adapter
    }

    /// 发送指令包并读取状态包（广播包返回 `None`）
    pub fn transact(&mut self, packet: &InstructionPacket) -> Result<Option<StatusPacket>, LinkError> {
        self.adapter.clear_input()?;
        self.adapter.write_all(&packet.encode())?;
        trace!("DXL TX {:?} id={}", packet.instruction, packet.id);

        if !packet.expects_status() {
            return Ok(None);
        }

        let mut prefix = [0u8; HEADER_LEN];
        self.adapter.read_exact_timeout(&mut prefix, self.timeout)?;
        let remaining = remaining_len(&prefix)?;

        let mut bytes = vec![0u8; HEADER_LEN + remaining];
        bytes[..HEADER_LEN].copy_from_slice(&prefix);
        self.adapter
            .read_exact_timeout(&mut bytes[HEADER_LEN..], self.timeout)?;

        let status = StatusPacket::decode(&bytes)?;
        if status.id != packet.id {
            return Err(ProtocolError::UnexpectedId {
                expected: packet.id,
                actual: status.id,
            }
            .into());
        }
        if status.error_number() != 0 {
            return Err(LinkError::Status {
                id: status.id,
                code: status.error_number(),
            });
        }
        Ok(Some(status))
    }

    fn request(&mut self, packet: &InstructionPacket) -> Result<StatusPacket, LinkError> {
        self.transact(packet)?
            .ok_or_else(|| ProtocolError::ParseError("missing status packet".to_string()).into())
    }

    /// PING，返回 (型号编号, 固件版本)
    pub fn ping(&mut self, id: u8) -> Result<(u16, u8), LinkError> {
        let status = self.request(&InstructionPacket::ping(id))?;
        if status.params.len() < 3 {
            return Err(ProtocolError::InvalidLength {
                expected: 3,
                actual: status.params.len(),
            }
            .into());
        }
        Ok((
            u16::from_le_bytes([status.params[0], status.params[1]]),
            status.params[2],
        ))
    }

    /// 读控制表项
    pub fn read(&mut self, id: u8, (address, len): (u16, u16)) -> Result<u32, LinkError> {
        let status = self.request(&InstructionPacket::read(id, address, len))?;
        if status.params.len() < len as usize {
            return Err(ProtocolError::InvalidLength {
                expected: len as usize,
                actual: status.params.len(),
            }
            .into());
        }
        Ok(gauss_protocol::dxl::decode_le(&status.params[..len as usize]))
    }

    /// 写控制表项
    pub fn write(&mut self, id: u8, (address, len): (u16, u16), value: u32) -> Result<(), LinkError> {
        self.request(&InstructionPacket::write(id, address, &encode_le(value, len as usize)))?;
        Ok(())
    }

    /// 暂存写入，等待 ACTION
    pub fn reg_write(&mut self, id: u8, (address, len): (u16, u16), value: u32) -> Result<(), LinkError> {
        self.request(&InstructionPacket::reg_write(
            id,
            address,
            &encode_le(value, len as usize),
        ))?;
        Ok(())
    }

    /// 发送无应答的广播包
    pub fn broadcast(&mut self, packet: &InstructionPacket) -> Result<(), LinkError> {
        self.transact(packet).map(|_| ())
    }

    /// 按型号分组同步写同一个控制表项
    pub fn sync_write_grouped(
        &mut self,
        targets: &[(u8, MotorModel, u32)],
        entry: fn(MotorModel) -> (u16, u16),
    ) -> Result<(), LinkError> {
        for model in [MotorModel::Xl320, MotorModel::Xl430] {
            let (address, len) = entry(model);
            let entries: Vec<(u8, Vec<u8>)> = targets
                .iter()
                .filter(|(_, m, _)| *m == model)
                .map(|(id, _, value)| (*id, encode_le(*value, len as usize)))
                .collect();
            if !entries.is_empty() {
                self.broadcast(&InstructionPacket::sync_write(address, len, &entries))?;
            }
        }
        Ok(())
    }

    /// 探测若干 ID 上的电机型号（无应答或未知型号的 ID 不出现在结果中）
    pub fn probe_models(&mut self, ids: &[u8]) -> BTreeMap<u8, MotorModel> {
        let mut models = BTreeMap::new();
        for &id in ids {
            match self.ping(id) {
                Ok((number, _)) => match MotorModel::from_model_number(number) {
                    Some(model) => {
                        models.insert(id, model);
                    },
                    None => warn!("DXL id {} has unsupported model number {}", id, number),
                },
                Err(e) if e.is_timeout() => trace!("DXL id {} not present", id),
                Err(e) => warn!("DXL id {} probe failed: {}", id, e),
            }
        }
        models
    }
}

/// 事务错误 → 硬件错误
///
/// 状态包错误号和格式错误都是"异常应答"，按协议错误处理；超时和 IO 错误是连接错误。
fn link_to_hardware(err: LinkError) -> HardwareError {
    match err {
        LinkError::Bus(e) => HardwareError::from_bus(BusKind::Dxl, e),
        LinkError::Protocol(e) => HardwareError::Protocol(e),
        LinkError::Status { code, .. } => HardwareError::Protocol(ProtocolError::InvalidValue {
            field: "status error".to_string(),
            value: code as u32,
        }),
    }
}

/// 当前绑定的工具
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolBinding {
    pub id: u8,
    pub name: String,
    pub model: MotorModel,
    pub firmware: u8,
}

#[derive(Debug)]
struct PendingSettle {
    id: u8,
    model: MotorModel,
    action: SettleAction,
    due: Instant,
}

/// Dynamixel 执行器总线驱动
pub struct ActuatorBus {
    link: Mutex<DxlLink>,
    servos: &'static [ServoSpec],
    config: DxlBusConfig,
    health: HealthTracker,
    positions: ArcSwap<Vec<f64>>,
    telemetry: ArcSwap<Vec<MotorTelemetry>>,
    firmware: ArcSwap<Vec<FirmwareVersion>>,
    goals: GoalMailbox,
    /// 轨迹进行中：目标用 REG_WRITE 暂存，再广播 ACTION 同时生效
    trajectory_active: AtomicBool,
    torque_enabled: AtomicBool,
    tool: Mutex<Option<ToolBinding>>,
    pending_settle: Mutex<Option<PendingSettle>>,
    poll_count: AtomicU64,
    reports: Sender<CalibrationReport>,
}

impl ActuatorBus {
    pub fn new(
        link: DxlLink,
        servos: &'static [ServoSpec],
        config: DxlBusConfig,
        reports: Sender<CalibrationReport>,
    ) -> Self {
        Self {
            link: Mutex::new(link),
            servos,
            health: HealthTracker::new(BusKind::Dxl, config.lost_after_failures),
            config,
            positions: ArcSwap::from_pointee(vec![0.0; servos.len()]),
            telemetry: ArcSwap::from_pointee(Vec::new()),
            firmware: ArcSwap::from_pointee(Vec::new()),
            goals: GoalMailbox::new(),
            trajectory_active: AtomicBool::new(false),
            torque_enabled: AtomicBool::new(true),
            tool: Mutex::new(None),
            pending_settle: Mutex::new(None),
            poll_count: AtomicU64::new(0),
            reports,
        }
    }

    pub fn servos(&self) -> &'static [ServoSpec] {
        self.servos
    }

    /// 初始化扫描：PING 所有关节执行器，记录固件版本，读取第一份位置和遥测
    pub fn scan(&self) -> Result<(), HardwareError> {
        let mut firmware = Vec::with_capacity(self.servos.len());
        let mut missing = Vec::new();
        {
            let mut link = self.link.lock();
            for servo in self.servos {
                match link.ping(servo.id) {
                    Ok((number, version)) => {
                        if MotorModel::from_model_number(number) != Some(servo.model) {
                            warn!(
                                "{} (DXL id {}): expected {}, found model number {}",
                                servo.name,
                                servo.id,
                                servo.model.name(),
                                number
                            );
                        }
                        firmware.push(FirmwareVersion {
                            motor_name: servo.name.to_string(),
                            version: version.to_string(),
                        });
                    },
                    Err(e) => {
                        warn!("{} (DXL id {}) not found: {}", servo.name, servo.id, e);
                        missing.push(servo.id);
                    },
                }
            }
            if missing.is_empty() {
                if let Err(e) = self.read_positions(&mut link) {
                    debug!("DXL bus: initial position read failed: {}", e);
                }
                self.refresh_telemetry(&mut link);
            }
        }
        self.firmware.store(Arc::new(firmware));

        let result = if missing.is_empty() {
            info!("DXL bus: {} actuators found", self.servos.len());
            Ok(())
        } else {
            Err(HardwareError::connection(
                BusKind::Dxl,
                format!("motors {:?} not responding", missing),
            ))
        };
        self.health.record(&result);
        result
    }

    /// 一次轮询并更新连接状态
    pub fn check_connection(&self) -> ConnectionState {
        let result = self.poll();
        self.health.record(&result)
    }

    /// 一次轮询：发出待发目标 → 读位置 →（按间隔）读遥测 → 到期的工具动作
    pub fn poll(&self) -> Result<(), HardwareError> {
        let count = self.poll_count.fetch_add(1, Ordering::Relaxed);
        let mut link = self.link.lock();

        let flushed = self.flush_goals(&mut link);
        let read = self.read_positions(&mut link);
        if count % self.config.telemetry_every as u64 == 0 {
            self.refresh_telemetry(&mut link);
        }
        self.apply_due_settle(&mut link);
        drop(link);

        flushed.and(read)
    }

    fn flush_goals(&self, link: &mut DxlLink) -> Result<(), HardwareError> {
        let Some(goal) = self.goals.take() else {
            return Ok(());
        };
        if !self.torque_enabled.load(Ordering::Acquire) {
            trace!("DXL goal discarded: learning mode active");
            return Ok(());
        }

        let targets: Vec<(u8, MotorModel, u32)> = self
            .servos
            .iter()
            .zip(goal.iter())
            .map(|(servo, rad)| (servo.id, servo.model, servo.rad_to_ticks(*rad)))
            .collect();

        if self.trajectory_active.load(Ordering::Acquire) {
            for (id, model, ticks) in &targets {
                link.reg_write(*id, model.table().goal_position, *ticks)
                    .map_err(link_to_hardware)?;
            }
            link.broadcast(&InstructionPacket::action())
                .map_err(link_to_hardware)
        } else {
            link.sync_write_grouped(&targets, |m| m.table().goal_position)
                .map_err(link_to_hardware)
        }
    }

    fn read_positions(&self, link: &mut DxlLink) -> Result<(), HardwareError> {
        let mut positions: Vec<f64> = self.positions.load().as_ref().clone();
        let mut missing = Vec::new();
        let mut malformed = None;

        for (value, servo) in positions.iter_mut().zip(self.servos) {
            match link.read(servo.id, servo.model.table().present_position) {
                Ok(ticks) => *value = servo.ticks_to_rad(ticks),
                Err(e) if matches!(e, LinkError::Bus(_)) => {
                    trace!("DXL id {} position read failed: {}", servo.id, e);
                    missing.push(servo.id);
                },
                Err(e) => {
                    malformed.get_or_insert(e);
                },
            }
        }
        self.positions.store(Arc::new(positions));

        if !missing.is_empty() {
            return Err(HardwareError::connection(
                BusKind::Dxl,
                format!("motors {:?} not responding", missing),
            ));
        }
        match malformed {
            Some(e) => Err(link_to_hardware(e)),
            None => Ok(()),
        }
    }

    fn read_telemetry_of(
        link: &mut DxlLink,
        id: u8,
        name: &str,
        model: MotorModel,
    ) -> Result<MotorTelemetry, LinkError> {
        let table = model.table();
        let temperature = link.read(id, table.present_temperature)?;
        let voltage = link.read(id, table.present_voltage)?;
        let error_code = link.read(id, table.hardware_error)?;
        Ok(MotorTelemetry {
            name: name.to_string(),
            motor_type: model.name().to_string(),
            temperature: temperature as i32,
            voltage: model.raw_to_volts(voltage),
            error_code: error_code as i32,
        })
    }

    /// 读取失败的电机保留上一份遥测
    fn refresh_telemetry(&self, link: &mut DxlLink) {
        let previous = self.telemetry.load_full();
        let keep = |name: &str| previous.iter().find(|t| t.name == name).cloned();

        let mut telemetry = Vec::with_capacity(self.servos.len() + 1);
        for servo in self.servos {
            match Self::read_telemetry_of(link, servo.id, servo.name, servo.model) {
                Ok(entry) => telemetry.push(entry),
                Err(e) => {
                    trace!("DXL id {} telemetry read failed: {}", servo.id, e);
                    telemetry.extend(keep(servo.name));
                },
            }
        }

        let tool = self.tool.lock().clone();
        if let Some(tool) = tool {
            let name = tool_motor_name(&tool.name);
            match Self::read_telemetry_of(link, tool.id, &name, tool.model) {
                Ok(entry) => telemetry.push(entry),
                Err(e) => {
                    trace!("Tool id {} telemetry read failed: {}", tool.id, e);
                    telemetry.extend(keep(&name));
                },
            }
        }
        self.telemetry.store(Arc::new(telemetry));
    }

    fn apply_due_settle(&self, link: &mut DxlLink) {
        let due = {
            let mut pending = self.pending_settle.lock();
            if pending.as_ref().is_some_and(|p| p.due <= Instant::now()) {
                pending.take()
            } else {
                None
            }
        };
        let Some(settle) = due else {
            return;
        };

        let table = settle.model.table();
        let result = match settle.action {
            SettleAction::HoldTorque(torque) => link.write(settle.id, table.torque_limit, torque as u32),
            SettleAction::Release => link.write(settle.id, table.torque_enable, 0),
        };
        match result {
            Ok(()) => debug!("Tool id {}: {:?} applied", settle.id, settle.action),
            Err(e) => warn!("Tool id {}: {:?} failed: {}", settle.id, settle.action, e),
        }
    }

    /// 写入关节目标（覆盖尚未发出的上一条）
    pub fn write_goals(&self, goal: SubPose) {
        if goal.len() != self.servos.len() {
            warn!(
                "DXL goal has {} joints, expected {}; ignored",
                goal.len(),
                self.servos.len()
            );
            return;
        }
        self.goals.put(goal);
    }

    /// 轨迹同步边界
    ///
    /// `begin = true` 之后的目标改为 REG_WRITE + 广播 ACTION，整条链同时生效；
    /// `begin = false` 回到 SYNC_WRITE。两种情况都立即广播一次 ACTION，
    /// 让已暂存的目标生效。
    pub fn mark_sync_boundary(&self, begin_trajectory: bool) -> Result<(), HardwareError> {
        self.trajectory_active
            .store(begin_trajectory, Ordering::Release);
        self.link
            .lock()
            .broadcast(&InstructionPacket::action())
            .map_err(link_to_hardware)
    }

    /// 力矩使能（学习模式下关闭）
    ///
    /// 重新上力矩前先把目标设为当前位置，避免关节跳回旧目标。
    pub fn set_torque(&self, enabled: bool) -> Result<(), HardwareError> {
        let mut link = self.link.lock();
        if enabled {
            let positions = self.positions.load();
            let targets: Vec<(u8, MotorModel, u32)> = self
                .servos
                .iter()
                .zip(positions.iter())
                .map(|(servo, rad)| (servo.id, servo.model, servo.rad_to_ticks(*rad)))
                .collect();
            link.sync_write_grouped(&targets, |m| m.table().goal_position)
                .map_err(link_to_hardware)?;
        }

        let targets: Vec<(u8, MotorModel, u32)> = self
            .servos
            .iter()
            .map(|servo| (servo.id, servo.model, enabled as u32))
            .collect();
        link.sync_write_grouped(&targets, |m| m.table().torque_enable)
            .map_err(link_to_hardware)?;
        drop(link);

        self.torque_enabled.store(enabled, Ordering::Release);
        if !enabled {
            self.goals.take();
        }
        debug!("DXL torque {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    pub fn is_torque_enabled(&self) -> bool {
        self.torque_enabled.load(Ordering::Acquire)
    }

    /// 写入 LED 颜色（每个关节执行器一个）
    pub fn set_leds(&self, colors: &[LedColor]) -> Result<(), HardwareError> {
        if colors.len() != self.servos.len() {
            return Err(HardwareError::InvalidLedPattern(format!(
                "expected {} LED codes, got {}",
                self.servos.len(),
                colors.len()
            )));
        }
        let mut link = self.link.lock();
        for (servo, color) in self.servos.iter().zip(colors) {
            link.write(servo.id, servo.model.table().led, u8::from(*color) as u32)
                .map_err(link_to_hardware)?;
        }
        Ok(())
    }

    /// 探测并绑定工具（`id = 0` 解除绑定）
    pub fn detect_tool(&self, id: u8, name: &str) -> Result<(), HardwareError> {
        if id == 0 {
            if let Some(previous) = self.tool.lock().take() {
                info!("Tool '{}' (id {}) unbound", previous.name, previous.id);
            }
            return Ok(());
        }
        self.reject_joint_id(id)?;

        let ping = self.link.lock().ping(id);
        match ping {
            Ok((number, firmware)) => {
                let model = MotorModel::from_model_number(number).ok_or_else(|| HardwareError::Tool {
                    id,
                    message: format!("unsupported model number {}", number),
                })?;
                info!("Tool '{}' found on DXL id {} ({})", name, id, model.name());
                *self.tool.lock() = Some(ToolBinding {
                    id,
                    name: name.to_string(),
                    model,
                    firmware,
                });
                Ok(())
            },
            Err(e) if e.is_timeout() => {
                debug!("Tool '{}' not found on DXL id {}", name, id);
                Err(HardwareError::DeviceNotFound { id })
            },
            Err(e) => Err(HardwareError::Tool {
                id,
                message: e.to_string(),
            }),
        }
    }

    fn reject_joint_id(&self, id: u8) -> Result<(), HardwareError> {
        if self.servos.iter().any(|s| s.id == id) {
            return Err(HardwareError::Tool {
                id,
                message: "id belongs to a joint actuator".to_string(),
            });
        }
        Ok(())
    }

    pub fn tool(&self) -> Option<ToolBinding> {
        self.tool.lock().clone()
    }

    /// 发送工具命令
    ///
    /// 失败只体现在返回值上，不改变总线连接状态。关节执行器的 id 一律拒绝；
    /// 未绑定的 id 按 XL-320 处理。
    pub fn send_tool_command(&self, id: u8, command: ToolCommand) -> Result<(), HardwareError> {
        self.reject_joint_id(id)?;
        let model = self
            .tool
            .lock()
            .as_ref()
            .filter(|t| t.id == id)
            .map(|t| t.model)
            .unwrap_or(MotorModel::Xl320);
        command
            .validate(model)
            .map_err(|message| HardwareError::Tool { id, message })?;

        let result = write_tool_command(&mut self.link.lock(), id, model, &command);
        result.map_err(|e| HardwareError::Tool {
            id,
            message: if e.is_timeout() {
                "no response".to_string()
            } else {
                e.to_string()
            },
        })?;

        let mut pending = self.pending_settle.lock();
        match command.settle_action() {
            Some(action) => {
                *pending = Some(PendingSettle {
                    id,
                    model,
                    action,
                    due: Instant::now() + self.config.gripper_settle(),
                });
            },
            None => {
                if pending.as_ref().is_some_and(|p| p.id == id) {
                    *pending = None;
                }
            },
        }
        debug!("Tool id {}: {} sent", id, command.name());
        Ok(())
    }

    /// 校准：执行器是绝对编码器，只需确认全部在线
    pub fn request_calibration(&self, mode: CalibrationMode, attempt: u64) -> Result<(), HardwareError> {
        let missing: Vec<u8> = {
            let mut link = self.link.lock();
            self.servos
                .iter()
                .filter(|servo| link.ping(servo.id).is_err())
                .map(|servo| servo.id)
                .collect()
        };
        let outcome = if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("motors {:?} not responding", missing))
        };
        debug!("DXL calibration ({:?}) check: {:?}", mode, outcome);
        self.reports
            .send(CalibrationReport {
                bus: BusKind::Dxl,
                attempt,
                outcome,
            })
            .map_err(|_| HardwareError::connection(BusKind::Dxl, "calibration report channel closed"))
    }

    pub fn positions(&self) -> Vec<f64> {
        self.positions.load().as_ref().clone()
    }

    pub fn telemetry(&self) -> Vec<MotorTelemetry> {
        self.telemetry.load().as_ref().clone()
    }

    /// 关节执行器固件 + 工具固件
    pub fn firmware_versions(&self) -> Vec<FirmwareVersion> {
        let mut versions = self.firmware.load().as_ref().clone();
        if let Some(tool) = self.tool.lock().as_ref() {
            versions.push(FirmwareVersion {
                motor_name: tool_motor_name(&tool.name),
                version: tool.firmware.to_string(),
            });
        }
        versions
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.health.state()
    }

    pub fn poll_count(&self) -> u64 {
        self.poll_count.load(Ordering::Relaxed)
    }
}

fn write_tool_command(
    link: &mut DxlLink,
    id: u8,
    model: MotorModel,
    command: &ToolCommand,
) -> Result<(), LinkError> {
    let table = model.table();
    link.write(id, table.torque_enable, 1)?;
    if let Some(speed) = command.speed() {
        link.write(id, table.moving_speed, speed as u32)?;
    }
    link.write(id, table.torque_limit, command.moving_torque(model) as u32)?;
    link.write(id, table.goal_position, command.position() as u32)
}

fn tool_motor_name(name: &str) -> String {
    format!("Tool {}", name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::{HardwareVersion, resolve};
    use gauss_bus::mock::SimulatedServoChain;
    use gauss_protocol::Instruction;
    use smallvec::smallvec;

    fn config() -> DxlBusConfig {
        DxlBusConfig {
            telemetry_every: 1,
            lost_after_failures: 2,
            gripper_settle_ms: 0,
            ..Default::default()
        }
    }

    fn v2_chain() -> SimulatedServoChain {
        SimulatedServoChain::new()
            .with_servo(2, MotorModel::Xl430)
            .with_servo(3, MotorModel::Xl430)
            .with_servo(6, MotorModel::Xl320)
    }

    fn v2_bus(chain: &SimulatedServoChain) -> (ActuatorBus, crossbeam_channel::Receiver<CalibrationReport>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let link = DxlLink::new(Box::new(chain.clone()), Duration::from_millis(5));
        let bus = ActuatorBus::new(link, resolve(HardwareVersion::V2).servos, config(), tx);
        (bus, rx)
    }

    #[test]
    fn test_scan_records_firmware() {
        let chain = v2_chain();
        let (bus, _rx) = v2_bus(&chain);
        bus.scan().unwrap();
        let firmware = bus.firmware_versions();
        assert_eq!(firmware.len(), 3);
        assert_eq!(firmware[0].motor_name, "Axis 4");
        assert_eq!(firmware[0].version, "45");
        assert!(bus.connection_state().is_ok());
        assert_eq!(bus.telemetry().len(), 3);
    }

    #[test]
    fn test_scan_missing_motor() {
        let chain = v2_chain();
        chain.set_online(6, false);
        let (bus, _rx) = v2_bus(&chain);
        let err = bus.scan().unwrap_err();
        assert!(err.to_string().contains("[6]"));
        assert!(!bus.connection_state().is_ok());
    }

    #[test]
    fn test_goal_flush_uses_sync_write() {
        let chain = v2_chain();
        let (bus, _rx) = v2_bus(&chain);
        bus.scan().unwrap();
        chain.clear_log();

        bus.write_goals(smallvec![0.5, 0.0, -0.25]);
        bus.poll().unwrap();

        let log = chain.instruction_log();
        assert_eq!(log.iter().filter(|i| **i == Instruction::SyncWrite).count(), 2);
        let positions = bus.positions();
        assert!((positions[0] - 0.5).abs() < MotorModel::Xl430.rad_per_tick());
        assert!((positions[2] + 0.25).abs() < MotorModel::Xl320.rad_per_tick());
    }

    #[test]
    fn test_last_write_wins() {
        let chain = v2_chain();
        let (bus, _rx) = v2_bus(&chain);
        bus.write_goals(smallvec![0.5, 0.5, 0.5]);
        bus.write_goals(smallvec![0.1, 0.2, 0.3]);
        chain.clear_log();
        bus.poll().unwrap();
        assert_eq!(
            chain.goal_ticks(2),
            Some(MotorModel::Xl430.rad_to_ticks(0.1))
        );
        assert_eq!(
            chain.instruction_log()
                .iter()
                .filter(|i| **i == Instruction::SyncWrite)
                .count(),
            2
        );
    }

    #[test]
    fn test_trajectory_uses_reg_write_and_action() {
        let chain = v2_chain();
        let (bus, _rx) = v2_bus(&chain);
        bus.mark_sync_boundary(true).unwrap();
        chain.clear_log();

        bus.write_goals(smallvec![0.2, 0.2, 0.2]);
        bus.poll().unwrap();
        let log = chain.instruction_log();
        assert_eq!(log.iter().filter(|i| **i == Instruction::RegWrite).count(), 3);
        assert!(log.contains(&Instruction::Action));
        assert!(!chain.has_staged(2));
        assert_eq!(chain.present_ticks(2), Some(MotorModel::Xl430.rad_to_ticks(0.2)));

        bus.mark_sync_boundary(false).unwrap();
        chain.clear_log();
        bus.write_goals(smallvec![0.0, 0.0, 0.0]);
        bus.poll().unwrap();
        assert!(!chain.instruction_log().contains(&Instruction::RegWrite));
    }

    #[test]
    fn test_connection_degrades_then_lost() {
        let chain = v2_chain();
        let (bus, _rx) = v2_bus(&chain);
        bus.scan().unwrap();

        chain.set_online(3, false);
        assert_eq!(
            bus.check_connection().health,
            crate::state::ConnectionHealth::Degraded
        );
        let state = bus.check_connection();
        assert!(state.is_lost());
        assert!(state.message.contains("[3]"));

        chain.set_online(3, true);
        assert!(bus.check_connection().is_ok());
    }

    #[test]
    fn test_corrupt_reply_is_transient() {
        let chain = v2_chain();
        let (bus, _rx) = v2_bus(&chain);
        bus.scan().unwrap();
        chain.set_corrupt_replies(true);
        for _ in 0..5 {
            assert_eq!(
                bus.check_connection().health,
                crate::state::ConnectionHealth::Degraded
            );
        }
    }

    #[test]
    fn test_learning_mode_discards_goals() {
        let chain = v2_chain();
        let (bus, _rx) = v2_bus(&chain);
        bus.set_torque(false).unwrap();
        assert_eq!(chain.torque_enabled(2), Some(false));

        bus.write_goals(smallvec![1.0, 1.0, 1.0]);
        bus.poll().unwrap();
        assert_eq!(chain.goal_ticks(2), Some(2048));

        bus.set_torque(true).unwrap();
        assert_eq!(chain.torque_enabled(6), Some(true));
    }

    #[test]
    fn test_detect_tool() {
        let chain = v2_chain().with_servo(11, MotorModel::Xl320);
        let (bus, _rx) = v2_bus(&chain);

        assert_eq!(
            bus.detect_tool(12, "gripper2"),
            Err(HardwareError::DeviceNotFound { id: 12 })
        );
        assert!(bus.tool().is_none());

        bus.detect_tool(11, "gripper1").unwrap();
        assert_eq!(bus.tool().map(|t| t.id), Some(11));
        assert_eq!(bus.firmware_versions().last().unwrap().motor_name, "Tool gripper1");

        assert!(matches!(bus.detect_tool(2, "bad"), Err(HardwareError::Tool { id: 2, .. })));

        bus.detect_tool(0, "").unwrap();
        assert!(bus.tool().is_none());
    }

    #[test]
    fn test_close_gripper_applies_hold_torque_after_settle() {
        let chain = v2_chain().with_servo(11, MotorModel::Xl320);
        let (bus, _rx) = v2_bus(&chain);
        bus.detect_tool(11, "gripper1").unwrap();

        bus.send_tool_command(
            11,
            ToolCommand::CloseGripper {
                position: 400,
                speed: 300,
                hold_torque: 128,
                max_torque: 1023,
            },
        )
        .unwrap();
        let table = MotorModel::Xl320.table();
        assert_eq!(chain.register(11, table.torque_limit), Some(1023));
        assert_eq!(chain.goal_ticks(11), Some(400));

        bus.poll().unwrap();
        assert_eq!(chain.register(11, table.torque_limit), Some(128));
    }

    #[test]
    fn test_tool_command_rejects_joint_id() {
        let chain = v2_chain();
        let (bus, _rx) = v2_bus(&chain);
        let before = chain.goal_ticks(6);

        let err = bus
            .send_tool_command(
                6,
                ToolCommand::OpenGripper {
                    position: 100,
                    speed: 100,
                    hold_torque: 100,
                },
            )
            .unwrap_err();
        assert!(matches!(err, HardwareError::Tool { id: 6, .. }));
        assert_eq!(chain.goal_ticks(6), before);
    }

    #[test]
    fn test_push_air_releases_torque() {
        let chain = v2_chain().with_servo(12, MotorModel::Xl320);
        let (bus, _rx) = v2_bus(&chain);
        bus.send_tool_command(12, ToolCommand::PushVacuum { position: 200 })
            .unwrap();
        assert_eq!(chain.torque_enabled(12), Some(true));
        bus.poll().unwrap();
        assert_eq!(chain.torque_enabled(12), Some(false));
    }

    #[test]
    fn test_tool_error_does_not_touch_connection() {
        let chain = v2_chain();
        let (bus, _rx) = v2_bus(&chain);
        bus.scan().unwrap();

        let err = bus
            .send_tool_command(
                13,
                ToolCommand::PullVacuum {
                    position: 600,
                    hold_torque: 100,
                },
            )
            .unwrap_err();
        assert!(matches!(err, HardwareError::Tool { id: 13, message } if message == "no response"));

        let err = bus
            .send_tool_command(
                13,
                ToolCommand::OpenGripper {
                    position: 5000,
                    speed: 100,
                    hold_torque: 100,
                },
            )
            .unwrap_err();
        assert!(matches!(err, HardwareError::Tool { .. }));
        assert!(bus.connection_state().is_ok());
    }

    #[test]
    fn test_set_leds() {
        let chain = v2_chain();
        let (bus, _rx) = v2_bus(&chain);
        bus.set_leds(&[LedColor::Red, LedColor::Green, LedColor::Blue])
            .unwrap();
        assert_eq!(chain.led(6), Some(4));
        assert!(matches!(
            bus.set_leds(&[LedColor::Red]),
            Err(HardwareError::InvalidLedPattern(_))
        ));
    }

    #[test]
    fn test_calibration_report() {
        let chain = v2_chain();
        let (bus, rx) = v2_bus(&chain);
        bus.request_calibration(CalibrationMode::Automatic, 7).unwrap();
        let report = rx.try_recv().unwrap();
        assert_eq!(report.bus, BusKind::Dxl);
        assert_eq!(report.attempt, 7);
        assert!(report.outcome.is_ok());

        chain.set_online(2, false);
        bus.request_calibration(CalibrationMode::Automatic, 8).unwrap();
        assert!(rx.try_recv().unwrap().outcome.is_err());
    }

    #[test]
    fn test_probe_models() {
        let chain = v2_chain();
        let mut link = DxlLink::new(Box::new(chain), Duration::from_millis(5));
        let models = link.probe_models(&[2, 3, 4, 5, 6]);
        assert_eq!(models.len(), 3);
        assert_eq!(models.get(&6), Some(&MotorModel::Xl320));
        assert!(!models.contains_key(&4));
    }
}
