//! 串口适配器（Dynamixel 半双工总线）
//!
//! 基于 `serialport` crate，8N1，无流控。半双工方向切换由 USB 转接板
//! （U2D2 / Gauss 扩展板）硬件完成。

use crate::{BusDeviceError, BusDeviceErrorKind, BusError, SerialAdapter};
use serialport::{ClearBuffer, SerialPort};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tracing::trace;

/// 串口适配器
pub struct SerialPortAdapter {
    port: Box<dyn SerialPort>,
    path: String,
    /// 当前设置在端口上的读超时
    read_timeout: Duration,
}

impl SerialPortAdapter {
    /// 打开串口
    ///
    /// # 错误
    /// - `BusError::Device`: 设备不存在、无权限或被占用
    pub fn open(path: impl Into<String>, baud_rate: u32) -> Result<Self, BusError> {
        let path = path.into();
        let read_timeout = Duration::from_millis(10);
        let port = serialport::new(&path, baud_rate)
            .timeout(read_timeout)
            .open()
            .map_err(|e| BusError::Device(map_serial_error(&path, e)))?;

        trace!("Serial port '{}' opened at {} baud", path, baud_rate);
        Ok(Self {
            port,
            path,
            read_timeout,
        })
    }

    /// 设备路径
    pub fn path(&self) -> &str {
        &self.path
    }
}

fn map_serial_error(path: &str, e: serialport::Error) -> BusDeviceError {
    let kind = match e.kind() {
        serialport::ErrorKind::NoDevice => BusDeviceErrorKind::NotFound,
        serialport::ErrorKind::InvalidInput => BusDeviceErrorKind::UnsupportedConfig,
        serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
            BusDeviceErrorKind::AccessDenied
        },
        serialport::ErrorKind::Io(io::ErrorKind::NotFound) => BusDeviceErrorKind::NotFound,
        _ => BusDeviceErrorKind::Backend,
    };
    BusDeviceError::new(kind, format!("Serial port '{}': {}", path, e))
}

/// 反复读取直到填满 `buf`，超过 `deadline` 返回 `BusError::Timeout`
///
/// 单次 `read` 的阻塞上限由端口超时决定，这里只检查截止时间。
fn read_until_deadline<R: Read + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
    deadline: Instant,
) -> Result<(), BusError> {
    let mut filled = 0;
    while filled < buf.len() {
        if Instant::now() >= deadline {
            return Err(BusError::Timeout);
        }
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(BusError::Timeout),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Err(BusError::Timeout),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => return Err(BusError::Io(e)),
        }
    }
    Ok(())
}

impl SerialAdapter for SerialPortAdapter {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), BusError> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        trace!("Serial TX {} bytes", bytes.len());
        Ok(())
    }

    fn read_exact_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), BusError> {
        let deadline = Instant::now() + timeout;
        if self.read_timeout != timeout {
            self.port
                .set_timeout(timeout)
                .map_err(|e| BusError::Device(map_serial_error(&self.path, e)))?;
            self.read_timeout = timeout;
        }
        read_until_deadline(&mut self.port, buf, deadline)
    }

    fn clear_input(&mut self) -> Result<(), BusError> {
        self.port
            .clear(ClearBuffer::Input)
            .map_err(|e| BusError::Device(map_serial_error(&self.path, e)))
    }
}
