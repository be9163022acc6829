//! # Gauss 硬件通讯层
//!
//! 本 crate 把 Gauss 机械臂的两条电机总线统一成一个六轴接口，包括：
//! - 步进电机 CAN 总线（[`GearedJointBus`]）：底座/肩部关节、零点寻找
//! - Dynamixel 串口总线（[`ActuatorBus`]）：腕部关节、LED、末端工具
//! - 硬件版本映射（V1 / V2，可通过 DXL 电机型号自动探测）
//! - 校准状态机（同一时刻至多一个校准在进行）
//! - 三个后台循环：监督循环 + 两条总线的轮询循环
//!
//! # 使用场景
//!
//! 上层（机器人中间件或 CLI）通过 [`RobotCommunication`] 访问硬件，
//! 真实硬件用 [`OrchestratorBuilder`] 构造，无硬件时用 [`FakeCommunication`]。
//!
//! ```no_run
//! use gauss_driver::OrchestratorBuilder;
//!
//! let arm = OrchestratorBuilder::new().config_file("gauss-hardware.toml").build()?;
//! arm.init()?;
//! arm.start_control_loop()?;
//! arm.send_position_to_robot([0.0, 0.628, -1.4, 0.0, 0.0, 0.0])?;
//! let pose = arm.get_current_position();
//! # let _ = pose;
//! # Ok::<(), gauss_driver::HardwareError>(())
//! ```

pub mod actuator;
mod builder;
pub mod calibration;
pub mod command;
pub mod config;
mod contract;
mod error;
mod fake;
pub mod geared;
pub mod heartbeat;
pub mod mode;
mod orchestrator;
pub mod pipeline;
pub mod state;
pub mod version;

pub use actuator::{ActuatorBus, DxlLink, ToolBinding};
pub use builder::OrchestratorBuilder;
pub use calibration::{CalibrationController, CalibrationMode, CalibrationState};
pub use command::ToolCommand;
pub use config::{CalibrationConfig, CanBusConfig, DxlBusConfig, HardwareConfig, VersionSelection};
pub use contract::{Backend, RobotCommunication, create_communication};
pub use error::{HardwareError, status_code};
pub use fake::FakeCommunication;
pub use geared::GearedJointBus;
pub use heartbeat::{ConnectionMonitor, HealthTracker};
pub use mode::LoopState;
pub use orchestrator::{HardwareOrchestrator, check_hardware_version_from_dxl_motors};
pub use state::*;
pub use version::{HardwareVersion, JointMapping, resolve};
