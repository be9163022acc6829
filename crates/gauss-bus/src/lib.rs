//! # Gauss Bus Adapter Layer
//!
//! 硬件总线抽象层：
//!
//! - [`CanAdapter`]: 步进电机 CAN 总线（SocketCAN）
//! - [`SerialAdapter`]: Dynamixel 半双工串口总线（serialport）
//!
//! 启用 `mock` feature 后提供仿真硬件（[`mock::SimulatedServoChain`]、
//! [`mock::SimulatedStepperBus`]），用于无硬件测试。

use std::time::Duration;
use thiserror::Error;

// 重新导出 gauss-protocol 中的 GaussFrame
pub use gauss_protocol::GaussFrame;

#[cfg(target_os = "linux")]
pub mod socketcan;

#[cfg(target_os = "linux")]
pub use socketcan::SocketCanAdapter;

#[cfg(any(feature = "auto-backend", feature = "serial"))]
pub mod serial;

#[cfg(any(feature = "auto-backend", feature = "serial"))]
pub use serial::SerialPortAdapter;

#[cfg(feature = "mock")]
pub mod mock;

/// 总线适配层统一错误类型
#[derive(Error, Debug)]
pub enum BusError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Device Error: {0}")]
    Device(#[from] BusDeviceError),
    #[error("Read timeout")]
    Timeout,
    #[error("Bus off")]
    BusOff,
    #[error("Device not started")]
    NotStarted,
}

impl BusError {
    /// 超时是可重试的：设备可能只是暂时无应答
    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::Timeout)
    }
}

/// 设备/后端错误的结构化分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusDeviceErrorKind {
    Unknown,
    NotFound,
    AccessDenied,
    Busy,
    UnsupportedConfig,
    InvalidFrame,
    Backend,
}

/// 结构化设备错误
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct BusDeviceError {
    pub kind: BusDeviceErrorKind,
    pub message: String,
}

impl BusDeviceError {
    pub fn new(kind: BusDeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// 设备不存在或无权限，重试无意义
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            BusDeviceErrorKind::AccessDenied | BusDeviceErrorKind::NotFound
        )
    }
}

impl From<String> for BusDeviceError {
    fn from(message: String) -> Self {
        Self::new(BusDeviceErrorKind::Unknown, message)
    }
}

impl From<&str> for BusDeviceError {
    fn from(message: &str) -> Self {
        Self::new(BusDeviceErrorKind::Unknown, message)
    }
}

/// CAN 总线适配器
///
/// 适配器由总线驱动独占（放在 `Mutex` 中），只需要 `Send`。
pub trait CanAdapter: Send {
    fn send(&mut self, frame: GaussFrame) -> Result<(), BusError>;
    fn receive(&mut self) -> Result<GaussFrame, BusError>;
    fn set_receive_timeout(&mut self, _timeout: Duration) {}
    fn receive_timeout(&mut self, timeout: Duration) -> Result<GaussFrame, BusError> {
        self.set_receive_timeout(timeout);
        self.receive()
    }
    fn try_receive(&mut self) -> Result<Option<GaussFrame>, BusError> {
        match self.receive_timeout(Duration::ZERO) {
            Ok(frame) => Ok(Some(frame)),
            Err(BusError::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// 半双工串口适配器
///
/// 一次事务：`clear_input` → `write_all` → `read_exact_timeout`（状态包）。
pub trait SerialAdapter: Send {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), BusError>;

    /// 读满 `buf`，超过 `timeout` 未读满返回 [`BusError::Timeout`]
    fn read_exact_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), BusError>;

    /// 丢弃接收缓冲区中的残留字节
    fn clear_input(&mut self) -> Result<(), BusError> {
        Ok(())
    }
}

impl<T: CanAdapter + ?Sized> CanAdapter for Box<T> {
    fn send(&mut self, frame: GaussFrame) -> Result<(), BusError> {
        (**self).send(frame)
    }
    fn receive(&mut self) -> Result<GaussFrame, BusError> {
        (**self).receive()
    }
    fn set_receive_timeout(&mut self, timeout: Duration) {
        (**self).set_receive_timeout(timeout)
    }
    fn receive_timeout(&mut self, timeout: Duration) -> Result<GaussFrame, BusError> {
        (**self).receive_timeout(timeout)
    }
    fn try_receive(&mut self) -> Result<Option<GaussFrame>, BusError> {
        (**self).try_receive()
    }
}

impl<T: SerialAdapter + ?Sized> SerialAdapter for Box<T> {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), BusError> {
        (**self).write_all(bytes)
    }
    fn read_exact_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), BusError> {
        (**self).read_exact_timeout(buf, timeout)
    }
    fn clear_input(&mut self) -> Result<(), BusError> {
        (**self).clear_input()
    }
}
