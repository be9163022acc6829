//! Builder 模式实现
//!
//! 提供链式构造 [`HardwareOrchestrator`] 的便捷方式。

use crate::config::{HardwareConfig, VersionSelection};
use crate::error::HardwareError;
use crate::orchestrator::HardwareOrchestrator;
use gauss_bus::{CanAdapter, SerialAdapter};
use std::path::Path;
use tracing::Dispatch;

/// 编排层 Builder（链式构造）
///
/// 未注入适配器的总线在 `init()` 时按配置打开真实设备（SocketCAN / 串口）。
///
/// # Example
///
/// ```no_run
/// use gauss_driver::{HardwareVersion, OrchestratorBuilder};
///
/// let orchestrator = OrchestratorBuilder::new()
///     .hardware_version(HardwareVersion::V2)
///     .can_interface("can0")
///     .dxl_port("/dev/ttyAMA0", 1_000_000)
///     .build()
///     .unwrap();
/// orchestrator.init().unwrap();
/// orchestrator.start_control_loop().unwrap();
/// ```
pub struct OrchestratorBuilder {
    config: HardwareConfig,
    /// `config_file` 读取失败时延迟到 `build()` 报告
    config_error: Option<HardwareError>,
    can_adapter: Option<Box<dyn CanAdapter>>,
    serial_adapter: Option<Box<dyn SerialAdapter>>,
    dispatch: Option<Dispatch>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: HardwareConfig::default(),
            config_error: None,
            can_adapter: None,
            serial_adapter: None,
            dispatch: None,
        }
    }

    /// 整体替换配置
    pub fn config(mut self, config: HardwareConfig) -> Self {
        self.config = config;
        self
    }

    /// 从 TOML 文件加载配置
    pub fn config_file(mut self, path: impl AsRef<Path>) -> Self {
        match HardwareConfig::load_from_file(path) {
            Ok(config) => self.config = config,
            Err(e) => self.config_error = Some(e),
        }
        self
    }

    /// 硬件版本（默认 `Auto`：通过 DXL 总线探测）
    pub fn hardware_version(mut self, version: impl Into<VersionSelection>) -> Self {
        self.config.hardware_version = version.into();
        self
    }

    pub fn can_enabled(mut self, enabled: bool) -> Self {
        self.config.can_enabled = enabled;
        self
    }

    pub fn dxl_enabled(mut self, enabled: bool) -> Self {
        self.config.dxl_enabled = enabled;
        self
    }

    /// SocketCAN 接口名
    pub fn can_interface(mut self, interface: impl Into<String>) -> Self {
        self.config.can.interface = interface.into();
        self
    }

    /// 串口设备和波特率
    pub fn dxl_port(mut self, port: impl Into<String>, baud_rate: u32) -> Self {
        self.config.dxl.port = port.into();
        self.config.dxl.baud_rate = baud_rate;
        self
    }

    /// 注入 CAN 适配器（测试时传入仿真总线）
    pub fn can_adapter(mut self, adapter: impl CanAdapter + 'static) -> Self {
        self.can_adapter = Some(Box::new(adapter));
        self
    }

    /// 注入串口适配器
    pub fn serial_adapter(mut self, adapter: impl SerialAdapter + 'static) -> Self {
        self.serial_adapter = Some(Box::new(adapter));
        self
    }

    /// 编排层及其后台线程使用的日志分发器
    ///
    /// 默认取 `build()` 调用时线程的当前分发器。
    pub fn log_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// 校验配置并构造编排层（不打开设备，设备在 `init()` 时打开）
    pub fn build(self) -> Result<HardwareOrchestrator, HardwareError> {
        if let Some(e) = self.config_error {
            return Err(e);
        }
        self.config.validate()?;

        let dispatch = self
            .dispatch
            .unwrap_or_else(|| tracing::dispatcher::get_default(Dispatch::clone));
        Ok(HardwareOrchestrator::from_parts(
            self.config,
            self.can_adapter,
            self.serial_adapter,
            dispatch,
        ))
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::HardwareVersion;

    #[test]
    fn test_builder_sets_config() {
        let orchestrator = OrchestratorBuilder::new()
            .hardware_version(HardwareVersion::V1)
            .can_interface("vcan0")
            .dxl_port("/dev/ttyUSB0", 57_600)
            .build()
            .unwrap();
        let config = orchestrator.config();
        assert_eq!(config.hardware_version, VersionSelection::V1);
        assert_eq!(config.can.interface, "vcan0");
        assert_eq!(config.dxl.port, "/dev/ttyUSB0");
        assert_eq!(config.dxl.baud_rate, 57_600);
    }

    #[test]
    fn test_builder_rejects_no_bus() {
        let result = OrchestratorBuilder::new()
            .hardware_version(HardwareVersion::V2)
            .can_enabled(false)
            .dxl_enabled(false)
            .build();
        assert!(matches!(result, Err(HardwareError::Configuration(_))));
    }

    #[test]
    fn test_builder_reports_missing_config_file() {
        let result = OrchestratorBuilder::new()
            .config_file("/nonexistent/gauss-hardware.toml")
            .build();
        assert!(matches!(result, Err(HardwareError::Configuration(_))));
    }
}
