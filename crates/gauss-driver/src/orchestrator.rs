//! 硬件编排层
//!
//! [`HardwareOrchestrator`] 独占两条总线和三个后台线程，把六轴位姿按硬件版本映射
//! 拆分/合并到两条总线上，并仲裁校准。
//!
//! 生命周期：
//!
//! ```text
//! build() ──► init() ──► start_control_loop() ──► pause/resume ──► stop_control_loop()
//!              │                                                    │
//!              └── 版本解析、打开设备、扫描（只执行一次）            └── resume 重新启动线程，不重新 init
//! ```

use crate::actuator::{ActuatorBus, DxlLink, ToolBinding};
use crate::calibration::{CalibrationController, CalibrationMode, CalibrationReport, CalibrationState};
use crate::command::ToolCommand;
use crate::config::{HardwareConfig, period};
use crate::error::HardwareError;
use crate::geared::GearedJointBus;
use crate::mode::{AtomicLoopState, LoopState};
use crate::pipeline::{
    CAN_LOOP_THREAD, DXL_LOOP_THREAD, LoopContext, SUPERVISOR_THREAD, Workers, spawn_loop,
};
use crate::state::{
    BusKind, ConnectionState, FirmwareVersion, HardwareStatus, JOINT_COUNT, JointPose, LedPattern,
    LedReply, aggregate_ok,
};
use crate::version::{HardwareVersion, JointMapping, detect_version, probe_ids, resolve};
use crossbeam_channel::{Receiver, Sender};
use gauss_bus::{CanAdapter, SerialAdapter};
use gauss_protocol::LedColor;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{Dispatch, debug, error, info, warn};

/// 停止循环时等待线程退出的上限
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// 通过 DXL 总线探测硬件版本
///
/// PING 所有可能的执行器 ID，按型号签名匹配版本表；匹配不到或匹配多个都是配置错误。
pub fn check_hardware_version_from_dxl_motors(link: &mut DxlLink) -> Result<HardwareVersion, HardwareError> {
    let models = link.probe_models(&probe_ids());
    debug!("DXL probe found {:?}", models);
    detect_version(&models)
}

#[cfg(any(feature = "auto-backend", feature = "serial"))]
fn open_serial_port(config: &HardwareConfig) -> Result<Box<dyn SerialAdapter>, HardwareError> {
    let adapter = gauss_bus::SerialPortAdapter::open(config.dxl.port.clone(), config.dxl.baud_rate)
        .map_err(|e| HardwareError::from_bus(BusKind::Dxl, e))?;
    Ok(Box::new(adapter))
}

#[cfg(not(any(feature = "auto-backend", feature = "serial")))]
fn open_serial_port(_config: &HardwareConfig) -> Result<Box<dyn SerialAdapter>, HardwareError> {
    Err(HardwareError::Configuration(
        "no serial backend compiled in; supply a serial adapter".to_string(),
    ))
}

#[cfg(target_os = "linux")]
fn open_socketcan(config: &HardwareConfig) -> Result<Box<dyn CanAdapter>, HardwareError> {
    let adapter = gauss_bus::SocketCanAdapter::new(config.can.interface.clone())
        .map_err(|e| HardwareError::from_bus(BusKind::Can, e))?;
    Ok(Box::new(adapter))
}

#[cfg(not(target_os = "linux"))]
fn open_socketcan(_config: &HardwareConfig) -> Result<Box<dyn CanAdapter>, HardwareError> {
    Err(HardwareError::Configuration(
        "SocketCAN is only available on Linux; supply a CAN adapter".to_string(),
    ))
}

fn add_loop(
    workers: &mut Workers,
    ctx: &LoopContext,
    name: &'static str,
    frequency_hz: f64,
    tick: impl FnMut() + Send + 'static,
) -> Result<(), HardwareError> {
    let handle = spawn_loop(name, period(frequency_hz), ctx.clone(), tick).map_err(|e| {
        HardwareError::Configuration(format!("failed to spawn {}: {}", name, e))
    })?;
    workers.push(name, handle);
    Ok(())
}

/// `init()` 之后不再变化的部分
struct Initialized {
    version: HardwareVersion,
    mapping: &'static JointMapping,
    can: Option<Arc<GearedJointBus>>,
    dxl: Option<Arc<ActuatorBus>>,
}

impl Initialized {
    /// 启用总线的当前连接状态
    fn bus_states(&self) -> Vec<(BusKind, ConnectionState)> {
        let mut states = Vec::with_capacity(2);
        if let Some(can) = &self.can {
            states.push((BusKind::Can, can.connection_state()));
        }
        if let Some(dxl) = &self.dxl {
            states.push((BusKind::Dxl, dxl.connection_state()));
        }
        states
    }

    fn connection_ok(&self) -> bool {
        let can = self.can.as_ref().map(|bus| bus.connection_state());
        let dxl = self.dxl.as_ref().map(|bus| bus.connection_state());
        aggregate_ok(can.as_ref(), dxl.as_ref())
    }
}

/// 编排层和后台线程共享的状态
struct Shared {
    config: HardwareConfig,
    dispatch: Dispatch,
    /// Builder 注入的适配器，`init()` 时取走
    can_adapter: Mutex<Option<Box<dyn CanAdapter>>>,
    serial_adapter: Mutex<Option<Box<dyn SerialAdapter>>>,
    init_lock: Mutex<()>,
    hardware: OnceLock<Initialized>,
    calibration: CalibrationController,
    reports_tx: Sender<CalibrationReport>,
    reports_rx: Receiver<CalibrationReport>,
    loop_state: Arc<AtomicLoopState>,
    /// 上一次监督循环看到的整体连接状态（只用于记录变化）
    last_overall_ok: AtomicBool,
    leds: Mutex<Vec<LedColor>>,
    learning_mode: AtomicBool,
}

impl Shared {
    fn hardware(&self) -> Result<&Initialized, HardwareError> {
        self.hardware.get().ok_or(HardwareError::NotInitialized)
    }

    /// 把已到达的校准上报交给控制器
    fn drain_reports(&self) {
        while let Ok(report) = self.reports_rx.try_recv() {
            self.calibration.report(report);
        }
    }

    /// 监督循环主体：处理校准上报，重新计算整体连接状态
    fn supervise(&self) {
        self.drain_reports();
        let Ok(hw) = self.hardware() else {
            return;
        };

        let overall = hw.connection_ok();
        let previous = self.last_overall_ok.swap(overall, Ordering::AcqRel);
        if previous != overall {
            if overall {
                info!("Hardware connection ok");
            } else {
                let reasons: Vec<String> = hw
                    .bus_states()
                    .into_iter()
                    .filter(|(_, state)| !state.is_ok())
                    .map(|(_, state)| state.message)
                    .collect();
                warn!("Hardware connection not ok: {}", reasons.join("; "));
            }
        }
    }
}

/// 硬件编排层
pub struct HardwareOrchestrator {
    shared: Arc<Shared>,
    workers: Mutex<Option<Workers>>,
}

impl HardwareOrchestrator {
    pub(crate) fn from_parts(
        config: HardwareConfig,
        can_adapter: Option<Box<dyn CanAdapter>>,
        serial_adapter: Option<Box<dyn SerialAdapter>>,
        dispatch: Dispatch,
    ) -> Self {
        let (reports_tx, reports_rx) = crossbeam_channel::unbounded();
        Self {
            shared: Arc::new(Shared {
                config,
                dispatch,
                can_adapter: Mutex::new(can_adapter),
                serial_adapter: Mutex::new(serial_adapter),
                init_lock: Mutex::new(()),
                hardware: OnceLock::new(),
                calibration: CalibrationController::new(),
                reports_tx,
                reports_rx,
                loop_state: Arc::new(AtomicLoopState::new(LoopState::Stopped)),
                last_overall_ok: AtomicBool::new(false),
                leds: Mutex::new(Vec::new()),
                learning_mode: AtomicBool::new(false),
            }),
            workers: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HardwareConfig {
        &self.shared.config
    }

    // ------------------------------------------------------------------
    // 初始化
    // ------------------------------------------------------------------

    /// 解析硬件版本，打开设备，构造启用的总线并扫描电机
    ///
    /// 重复调用是空操作。失败时不启动任何循环，可以再次调用。
    pub fn init(&self) -> Result<(), HardwareError> {
        tracing::dispatcher::with_default(&self.shared.dispatch, || self.init_inner())
    }

    fn init_inner(&self) -> Result<(), HardwareError> {
        let _guard = self.shared.init_lock.lock();
        if self.shared.hardware.get().is_some() {
            return Ok(());
        }
        let config = &self.shared.config;
        config.validate()?;

        let mut dxl_link = if config.dxl_enabled {
            Some(DxlLink::new(self.open_serial()?, config.dxl.timeout()))
        } else {
            None
        };

        let version = match Self::resolve_version(config, dxl_link.as_mut()) {
            Ok(version) => version,
            Err(e) => {
                self.restore_serial(dxl_link);
                return Err(e);
            },
        };
        // 设备在构造总线前全部打开，失败时把已取出的适配器放回
        let can_adapter = if config.can_enabled {
            match self.open_can() {
                Ok(adapter) => Some(adapter),
                Err(e) => {
                    self.restore_serial(dxl_link);
                    return Err(e);
                },
            }
        } else {
            None
        };
        let mapping = resolve(version);
        info!("Hardware version {:?}", version);

        let dxl = dxl_link.map(|link| {
            Arc::new(ActuatorBus::new(
                link,
                mapping.servos,
                config.dxl.clone(),
                self.shared.reports_tx.clone(),
            ))
        });
        let can = can_adapter.map(|adapter| {
            Arc::new(GearedJointBus::new(
                adapter,
                mapping.steppers,
                config.can.clone(),
                self.shared.reports_tx.clone(),
            ))
        });

        // 扫描失败只记录，由健康循环持续报告
        if let Some(can) = &can
            && let Err(e) = can.scan()
        {
            warn!("CAN scan incomplete: {}", e);
        }
        if let Some(dxl) = &dxl
            && let Err(e) = dxl.scan()
        {
            warn!("DXL scan incomplete: {}", e);
        }

        *self.shared.leds.lock() = vec![LedColor::Off; mapping.led_count()];
        if can.is_some() && config.calibration.required_at_startup {
            self.shared.calibration.request_new_calibration();
        }

        let initialized = Initialized {
            version,
            mapping,
            can,
            dxl,
        };
        self.shared
            .last_overall_ok
            .store(initialized.connection_ok(), Ordering::Release);
        if self.shared.hardware.set(initialized).is_err() {
            warn!("Hardware already initialized");
        }
        Ok(())
    }

    fn resolve_version(
        config: &HardwareConfig,
        dxl_link: Option<&mut DxlLink>,
    ) -> Result<HardwareVersion, HardwareError> {
        match (config.hardware_version.explicit(), dxl_link) {
            (Some(version), _) => Ok(version),
            (None, Some(link)) => check_hardware_version_from_dxl_motors(link),
            (None, None) => Err(HardwareError::Configuration(
                "hardware version auto-detection requires the DXL bus".to_string(),
            )),
        }
    }

    /// 初始化失败时归还串口适配器，下次 `init` 仍使用同一设备
    fn restore_serial(&self, dxl_link: Option<DxlLink>) {
        if let Some(link) = dxl_link {
            *self.shared.serial_adapter.lock() = Some(link.into_adapter());
        }
    }

    fn open_serial(&self) -> Result<Box<dyn SerialAdapter>, HardwareError> {
        match self.shared.serial_adapter.lock().take() {
            Some(adapter) => Ok(adapter),
            None => open_serial_port(&self.shared.config),
        }
    }

    fn open_can(&self) -> Result<Box<dyn CanAdapter>, HardwareError> {
        match self.shared.can_adapter.lock().take() {
            Some(adapter) => Ok(adapter),
            None => open_socketcan(&self.shared.config),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.hardware.get().is_some()
    }

    pub fn hardware_version(&self) -> Option<HardwareVersion> {
        self.shared.hardware.get().map(|hw| hw.version)
    }

    pub fn mapping(&self) -> Option<&'static JointMapping> {
        self.shared.hardware.get().map(|hw| hw.mapping)
    }

    pub fn can_bus(&self) -> Result<&Arc<GearedJointBus>, HardwareError> {
        self.shared
            .hardware()?
            .can
            .as_ref()
            .ok_or(HardwareError::BusDisabled(BusKind::Can))
    }

    pub fn dxl_bus(&self) -> Result<&Arc<ActuatorBus>, HardwareError> {
        self.shared
            .hardware()?
            .dxl
            .as_ref()
            .ok_or(HardwareError::BusDisabled(BusKind::Dxl))
    }

    // ------------------------------------------------------------------
    // 连接监督
    // ------------------------------------------------------------------

    /// 一次同步的监督过程：轮询每条启用的总线，更新连接状态，处理校准上报
    pub fn manage_hardware_connection(&self) -> Result<(), HardwareError> {
        let hw = self.shared.hardware()?;
        tracing::dispatcher::with_default(&self.shared.dispatch, || {
            if let Some(can) = &hw.can {
                can.check_connection();
            }
            if let Some(dxl) = &hw.dxl {
                dxl.check_connection();
            }
            self.shared.supervise();
        });
        Ok(())
    }

    /// 所有启用的总线都是 Ok（实时计算，不依赖监督循环的节拍）
    pub fn is_connection_ok(&self) -> bool {
        self.shared
            .hardware()
            .map(Initialized::connection_ok)
            .unwrap_or(false)
    }

    /// 每条启用总线的连接状态
    pub fn bus_states(&self) -> Vec<(BusKind, ConnectionState)> {
        self.shared
            .hardware()
            .map(Initialized::bus_states)
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // 后台循环
    // ------------------------------------------------------------------

    /// 启动三个后台循环；已在运行时只解除暂停
    pub fn start_control_loop(&self) -> Result<(), HardwareError> {
        let hw = self.shared.hardware()?;
        let mut workers = self.workers.lock();
        if workers.is_some() {
            self.shared
                .loop_state
                .transition(LoopState::Paused, LoopState::Running);
            return Ok(());
        }

        self.shared.loop_state.set(LoopState::Running);
        match self.spawn_workers(hw) {
            Ok(spawned) => {
                info!("Control loops started: {:?}", spawned.names());
                *workers = Some(spawned);
                Ok(())
            },
            Err(e) => {
                self.shared.loop_state.set(LoopState::Stopped);
                Err(e)
            },
        }
    }

    fn spawn_workers(&self, hw: &Initialized) -> Result<Workers, HardwareError> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(0);
        let ctx = LoopContext {
            state: self.shared.loop_state.clone(),
            stop: stop_rx,
            dispatch: self.shared.dispatch.clone(),
        };
        let config = &self.shared.config;
        let mut workers = Workers::new(stop_tx);

        let shared = self.shared.clone();
        let mut result = add_loop(
            &mut workers,
            &ctx,
            SUPERVISOR_THREAD,
            config.hardware_check_frequency_hz,
            move || shared.supervise(),
        );
        if result.is_ok()
            && let Some(can) = hw.can.clone()
        {
            result = add_loop(&mut workers, &ctx, CAN_LOOP_THREAD, config.can.frequency_hz, move || {
                can.check_connection();
            });
        }
        if result.is_ok()
            && let Some(dxl) = hw.dxl.clone()
        {
            result = add_loop(&mut workers, &ctx, DXL_LOOP_THREAD, config.dxl.frequency_hz, move || {
                dxl.check_connection();
            });
        }

        match result {
            Ok(()) => Ok(workers),
            Err(e) => {
                error!("{}", e);
                self.shared.loop_state.set(LoopState::Stopped);
                workers.shutdown(JOIN_TIMEOUT);
                Err(e)
            },
        }
    }

    /// 暂停：线程保留，跳过轮询
    pub fn pause_control_loop(&self) -> bool {
        let paused = self
            .shared
            .loop_state
            .transition(LoopState::Running, LoopState::Paused);
        if paused {
            debug!("Control loops paused");
        }
        paused
    }

    /// 恢复：暂停时解除暂停；停止后重新启动线程（复用已有总线，不重新 init）
    pub fn resume_control_loop(&self) -> Result<(), HardwareError> {
        if self.workers.lock().is_some() {
            if self
                .shared
                .loop_state
                .transition(LoopState::Paused, LoopState::Running)
            {
                debug!("Control loops resumed");
            }
            return Ok(());
        }
        self.start_control_loop()
    }

    /// 停止并等待所有后台线程退出
    pub fn stop_control_loop(&self) {
        self.shared.loop_state.set(LoopState::Stopped);
        if let Some(workers) = self.workers.lock().take() {
            workers.shutdown(JOIN_TIMEOUT);
            info!("Control loops stopped");
        }
    }

    pub fn loop_state(&self) -> LoopState {
        self.shared.loop_state.get()
    }

    // ------------------------------------------------------------------
    // 位姿
    // ------------------------------------------------------------------

    /// 当前六轴位置；禁用总线的关节取版本表中的替代值
    ///
    /// 初始化之前返回全零。
    pub fn get_current_position(&self) -> JointPose {
        let Ok(hw) = self.shared.hardware() else {
            return [0.0; JOINT_COUNT];
        };
        let can = hw.can.as_ref().map(|bus| bus.positions());
        let dxl = hw.dxl.as_ref().map(|bus| bus.positions());
        hw.mapping.merge(can.as_deref(), dxl.as_deref())
    }

    /// 拆分位姿并写入每条启用总线的目标邮箱（不等待执行，后写覆盖先写）
    pub fn send_position_to_robot(&self, pose: JointPose) -> Result<(), HardwareError> {
        let hw = self.shared.hardware()?;
        let (can_part, dxl_part) = hw.mapping.split(&pose);
        if let Some(can) = &hw.can {
            can.write_goals(can_part);
        }
        if let Some(dxl) = &hw.dxl {
            dxl.write_goals(dxl_part);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // 状态
    // ------------------------------------------------------------------

    pub fn get_hardware_status(&self) -> HardwareStatus {
        self.shared.drain_reports();
        let calibration = &self.shared.calibration;
        let Ok(hw) = self.shared.hardware() else {
            return HardwareStatus {
                connection_ok: false,
                error_message: HardwareError::NotInitialized.to_string(),
                calibration_needed: calibration.calibration_needed(),
                calibration_in_progress: calibration.is_calibration_in_progress(),
                motors: Vec::new(),
                stale: true,
            };
        };

        let states = hw.bus_states();
        let mut messages: Vec<String> = states
            .iter()
            .filter(|(_, state)| !state.is_ok())
            .map(|(_, state)| state.message.clone())
            .collect();
        let calibration_needed = calibration.calibration_needed();
        if calibration_needed && let Some(reason) = calibration.last_error() {
            messages.push(format!("calibration failed: {}", reason));
        }

        let mut motors = Vec::new();
        if let Some(can) = &hw.can {
            motors.extend(can.telemetry());
        }
        if let Some(dxl) = &hw.dxl {
            motors.extend(dxl.telemetry());
        }

        HardwareStatus {
            connection_ok: hw.connection_ok(),
            error_message: messages.join("; "),
            calibration_needed,
            calibration_in_progress: calibration.is_calibration_in_progress(),
            motors,
            stale: states.iter().any(|(_, state)| !state.is_ok()),
        }
    }

    /// CAN 在前，DXL 在后，工具最后
    pub fn get_firmware_versions(&self) -> Vec<FirmwareVersion> {
        let Ok(hw) = self.shared.hardware() else {
            return Vec::new();
        };
        let mut versions = Vec::new();
        if let Some(can) = &hw.can {
            versions.extend(can.firmware_versions());
        }
        if let Some(dxl) = &hw.dxl {
            versions.extend(dxl.firmware_versions());
        }
        versions
    }

    // ------------------------------------------------------------------
    // 学习模式 / 同步 / LED
    // ------------------------------------------------------------------

    /// 学习模式（关闭力矩，可手动拖动），不受校准状态限制
    ///
    /// 两条总线都会尝试，返回第一个错误。
    pub fn activate_learning_mode(&self, activate: bool) -> Result<(), HardwareError> {
        let hw = self.shared.hardware()?;
        let can = hw.can.as_ref().map(|bus| bus.set_torque(!activate));
        let dxl = hw.dxl.as_ref().map(|bus| bus.set_torque(!activate));
        can.unwrap_or(Ok(())).and(dxl.unwrap_or(Ok(())))?;

        self.shared.learning_mode.store(activate, Ordering::Release);
        info!("Learning mode {}", if activate { "on" } else { "off" });
        Ok(())
    }

    pub fn is_learning_mode(&self) -> bool {
        self.shared.learning_mode.load(Ordering::Acquire)
    }

    /// 轨迹同步边界，转发到两条总线
    pub fn synchronize_motors(&self, begin_trajectory: bool) -> Result<(), HardwareError> {
        let hw = self.shared.hardware()?;
        let can = hw
            .can
            .as_ref()
            .map(|bus| bus.mark_sync_boundary(begin_trajectory));
        let dxl = hw
            .dxl
            .as_ref()
            .map(|bus| bus.mark_sync_boundary(begin_trajectory));
        can.unwrap_or(Ok(())).and(dxl.unwrap_or(Ok(())))
    }

    /// 设置腕部执行器 LED
    ///
    /// 整体校验长度和颜色码，不合法时不做任何写入，之前的 LED 状态保持不变。
    pub fn set_leds(&self, pattern: &LedPattern) -> LedReply {
        match self.apply_leds(pattern) {
            Ok(()) => LedReply::ok("LEDs set"),
            Err(e) => {
                warn!("set_leds rejected: {}", e);
                LedReply::failed(e.to_string())
            },
        }
    }

    fn apply_leds(&self, pattern: &LedPattern) -> Result<(), HardwareError> {
        let hw = self.shared.hardware()?;
        let dxl = hw
            .dxl
            .as_ref()
            .ok_or(HardwareError::BusDisabled(BusKind::Dxl))?;

        let colors = pattern.to_colors(hw.mapping.led_count())?;
        dxl.set_leds(&colors)?;
        *self.shared.leds.lock() = colors;
        Ok(())
    }

    /// 最近一次成功写入的 LED 颜色
    pub fn led_state(&self) -> Vec<LedColor> {
        self.shared.leds.lock().clone()
    }

    // ------------------------------------------------------------------
    // 工具
    // ------------------------------------------------------------------

    /// 探测并绑定工具（`id = 0` 解除绑定）
    pub fn ping_and_set_tool(&self, id: u8, name: &str) -> Result<(), HardwareError> {
        self.dxl_bus()?.detect_tool(id, name)
    }

    pub fn current_tool(&self) -> Option<ToolBinding> {
        self.dxl_bus().ok().and_then(|bus| bus.tool())
    }

    pub fn send_tool_command(&self, id: u8, command: ToolCommand) -> Result<(), HardwareError> {
        self.dxl_bus()?.send_tool_command(id, command)
    }

    // ------------------------------------------------------------------
    // 校准
    // ------------------------------------------------------------------

    /// 允许开始校准
    ///
    /// 成功后进入 InProgress 并派发到每条启用的总线；派发失败回到 RequestPending。
    pub fn allow_motors_calibration_to_start(&self, mode: CalibrationMode) -> Result<(), HardwareError> {
        let hw = self.shared.hardware()?;
        self.shared.drain_reports();
        let ticket = self.shared.calibration.begin(mode, &hw.bus_states())?;

        for bus in &ticket.buses {
            let dispatched = match bus {
                BusKind::Can => hw
                    .can
                    .as_ref()
                    .map(|can| can.request_homing(mode, ticket.attempt)),
                BusKind::Dxl => hw
                    .dxl
                    .as_ref()
                    .map(|dxl| dxl.request_calibration(mode, ticket.attempt)),
            };
            if let Some(Err(e)) = dispatched {
                self.shared
                    .calibration
                    .abort(ticket.attempt, &e.to_string());
                return Err(e);
            }
        }
        Ok(())
    }

    /// 请求新的校准，返回状态是否变为 RequestPending
    pub fn request_new_calibration(&self) -> bool {
        self.shared.drain_reports();
        self.shared.calibration.request_new_calibration()
    }

    pub fn is_calibration_in_progress(&self) -> bool {
        self.shared.drain_reports();
        self.shared.calibration.is_calibration_in_progress()
    }

    pub fn calibration_state(&self) -> CalibrationState {
        self.shared.drain_reports();
        self.shared.calibration.state()
    }
}

impl Drop for HardwareOrchestrator {
    fn drop(&mut self) {
        self.stop_control_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::OrchestratorBuilder;
    use crate::config::VersionSelection;
    use gauss_bus::mock::{SimulatedServoChain, SimulatedStepperBus};
    use gauss_protocol::MotorModel;
    use std::thread;

    fn v2_chain() -> SimulatedServoChain {
        SimulatedServoChain::new()
            .with_servo(2, MotorModel::Xl430)
            .with_servo(3, MotorModel::Xl430)
            .with_servo(6, MotorModel::Xl320)
    }

    #[test]
    fn test_calls_before_init() {
        let orchestrator = OrchestratorBuilder::new()
            .can_adapter(SimulatedStepperBus::new().with_steppers([1, 2, 3]))
            .serial_adapter(v2_chain())
            .build()
            .unwrap();
        assert_eq!(orchestrator.get_current_position(), [0.0; 6]);
        assert!(!orchestrator.is_connection_ok());
        assert_eq!(
            orchestrator.send_position_to_robot([0.0; 6]),
            Err(HardwareError::NotInitialized)
        );
        assert_eq!(
            orchestrator.start_control_loop(),
            Err(HardwareError::NotInitialized)
        );
        assert!(orchestrator.get_hardware_status().stale);
    }

    #[test]
    fn test_auto_detects_v2() {
        let orchestrator = OrchestratorBuilder::new()
            .can_adapter(SimulatedStepperBus::new().with_steppers([1, 2, 3]))
            .serial_adapter(v2_chain())
            .build()
            .unwrap();
        orchestrator.init().unwrap();
        assert_eq!(orchestrator.hardware_version(), Some(HardwareVersion::V2));
        assert!(orchestrator.is_connection_ok());
        assert_eq!(orchestrator.get_firmware_versions().len(), 6);
        assert_eq!(orchestrator.led_state().len(), 3);
        orchestrator.init().unwrap();
    }

    #[test]
    fn test_auto_detect_without_match_is_fatal() {
        let orchestrator = OrchestratorBuilder::new()
            .can_adapter(SimulatedStepperBus::new())
            .serial_adapter(SimulatedServoChain::new().with_servo(9, MotorModel::Xl320))
            .build()
            .unwrap();
        let err = orchestrator.init().unwrap_err();
        assert!(matches!(err, HardwareError::Configuration(_)));
        assert!(!orchestrator.is_initialized());
    }

    #[test]
    fn test_startup_calibration_request() {
        let orchestrator = OrchestratorBuilder::new()
            .hardware_version(VersionSelection::V2)
            .can_adapter(SimulatedStepperBus::new().with_steppers([1, 2, 3]))
            .serial_adapter(v2_chain())
            .build()
            .unwrap();
        orchestrator.init().unwrap();
        assert_eq!(orchestrator.calibration_state(), CalibrationState::RequestPending);
        assert!(orchestrator.get_hardware_status().calibration_needed);
    }

    #[test]
    fn test_dxl_only_skips_startup_calibration() {
        let orchestrator = OrchestratorBuilder::new()
            .hardware_version(VersionSelection::V2)
            .can_enabled(false)
            .serial_adapter(v2_chain())
            .build()
            .unwrap();
        orchestrator.init().unwrap();
        assert_eq!(orchestrator.calibration_state(), CalibrationState::Idle);
        assert_eq!(
            orchestrator.can_bus().err(),
            Some(HardwareError::BusDisabled(BusKind::Can))
        );
    }

    #[test]
    fn test_activate_learning_mode_reaches_both_buses() {
        let steppers = SimulatedStepperBus::new().with_steppers([1, 2, 3]);
        let chain = v2_chain();
        let orchestrator = OrchestratorBuilder::new()
            .hardware_version(VersionSelection::V2)
            .can_adapter(steppers.clone())
            .serial_adapter(chain.clone())
            .build()
            .unwrap();
        orchestrator.init().unwrap();

        orchestrator.activate_learning_mode(true).unwrap();
        assert!(orchestrator.is_learning_mode());
        assert_eq!(steppers.torque_enabled(2), Some(false));
        assert_eq!(chain.torque_enabled(6), Some(false));

        orchestrator.activate_learning_mode(false).unwrap();
        assert_eq!(steppers.torque_enabled(2), Some(true));
        assert_eq!(chain.torque_enabled(6), Some(true));
    }

    #[test]
    fn test_pause_and_resume_flag() {
        let orchestrator = OrchestratorBuilder::new()
            .hardware_version(VersionSelection::V2)
            .can_adapter(SimulatedStepperBus::new().with_steppers([1, 2, 3]))
            .serial_adapter(v2_chain())
            .build()
            .unwrap();
        orchestrator.init().unwrap();
        orchestrator.start_control_loop().unwrap();
        assert_eq!(orchestrator.loop_state(), LoopState::Running);
        assert!(orchestrator.pause_control_loop());
        assert_eq!(orchestrator.loop_state(), LoopState::Paused);
        orchestrator.resume_control_loop().unwrap();
        assert_eq!(orchestrator.loop_state(), LoopState::Running);
        orchestrator.stop_control_loop();
        assert_eq!(orchestrator.loop_state(), LoopState::Stopped);
        assert!(!orchestrator.pause_control_loop());
    }

    #[test]
    fn test_resume_after_pause_keeps_threads() {
        let orchestrator = OrchestratorBuilder::new()
            .hardware_version(VersionSelection::V2)
            .can_adapter(SimulatedStepperBus::new().with_steppers([1, 2, 3]))
            .serial_adapter(v2_chain())
            .build()
            .unwrap();
        orchestrator.init().unwrap();
        orchestrator.start_control_loop().unwrap();
        let threads = orchestrator.workers.lock().as_ref().map(Workers::thread_ids);
        assert_eq!(threads.as_ref().map(Vec::len), Some(3));

        assert!(orchestrator.pause_control_loop());
        thread::sleep(Duration::from_millis(20));
        let can = orchestrator.can_bus().unwrap().clone();
        let dxl = orchestrator.dxl_bus().unwrap().clone();
        let (can_paused, dxl_paused) = (can.poll_count(), dxl.poll_count());
        thread::sleep(Duration::from_millis(30));
        assert_eq!(can.poll_count(), can_paused);
        assert_eq!(dxl.poll_count(), dxl_paused);

        orchestrator.resume_control_loop().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(can.poll_count() > can_paused);
        assert!(dxl.poll_count() > dxl_paused);
        assert_eq!(
            orchestrator.workers.lock().as_ref().map(Workers::thread_ids),
            threads
        );
        orchestrator.stop_control_loop();
    }
}
