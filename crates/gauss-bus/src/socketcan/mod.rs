//! SocketCAN CAN 适配器实现
//!
//! Linux 平台下的步进电机总线，使用内核级的 CAN 通讯接口。
//!
//! ## 限制
//!
//! - **仅限 Linux 平台**：SocketCAN 是 Linux 内核特性
//! - **接口配置**：波特率等配置由系统工具（`ip link`）完成，不在应用层设置
//! - **权限要求**：可能需要 `dialout` 组权限或 `sudo`

use crate::{BusDeviceError, BusDeviceErrorKind, BusError, CanAdapter, GaussFrame};
use socketcan::{
    CanError as SocketCanError, CanFrame, CanSocket, EmbeddedFrame, ExtendedId,
    Frame, Socket, StandardId,
};
use std::ffi::CString;
use std::io;
use std::os::unix::io::AsRawFd;
use std::time::Duration;
use tracing::{error, trace, warn};

/// SocketCAN 适配器
///
/// # 示例
///
/// ```no_run
/// use gauss_bus::{CanAdapter, GaussFrame, SocketCanAdapter};
///
/// let mut adapter = SocketCanAdapter::new("can0").unwrap();
/// adapter.send(GaussFrame::new_standard(0x100, &[0x1A])).unwrap();
/// let rx_frame = adapter.receive().unwrap();
/// ```
#[derive(Debug)]
pub struct SocketCanAdapter {
    socket: CanSocket,
    /// 接口名称（如 "can0"）
    interface: String,
    /// 读超时时间（用于 receive 方法）
    read_timeout: Duration,
}

impl SocketCanAdapter {
    /// 打开 CAN 接口
    ///
    /// # 错误
    /// - `BusError::Device`: 接口不存在或无法打开
    /// - `BusError::Io`: 设置超时失败
    pub fn new(interface: impl Into<String>) -> Result<Self, BusError> {
        let interface = interface.into();
        check_interface_exists(&interface)?;

        let socket = CanSocket::open(&interface).map_err(|e| {
            BusError::Device(BusDeviceError::new(
                BusDeviceErrorKind::Backend,
                format!("Failed to open CAN interface '{}': {}", interface, e),
            ))
        })?;

        // 禁用 Loopback：命令帧不应回环到接收端被当作反馈
        let loopback_enabled: libc::c_int = 0;
        let loopback_result = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_CAN_RAW,
                libc::CAN_RAW_LOOPBACK,
                &loopback_enabled as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if loopback_result < 0 {
            warn!(
                "Failed to disable CAN_RAW_LOOPBACK on '{}': {}",
                interface,
                io::Error::last_os_error()
            );
        }

        let read_timeout = Duration::from_millis(2);
        socket.set_read_timeout(read_timeout).map_err(BusError::Io)?;

        trace!("SocketCAN interface '{}' opened", interface);
        Ok(Self {
            socket,
            interface,
            read_timeout,
        })
    }

    /// 获取接口名称
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// 设置读超时
    pub fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), BusError> {
        self.socket.set_read_timeout(timeout).map_err(BusError::Io)?;
        self.read_timeout = timeout;
        Ok(())
    }

    fn to_can_frame(frame: &GaussFrame) -> Result<CanFrame, BusError> {
        let data = frame.data_slice();
        let can_frame = if frame.is_extended {
            ExtendedId::new(frame.id).and_then(|id| CanFrame::new(id, data))
        } else {
            StandardId::new(frame.id as u16).and_then(|id| CanFrame::new(id, data))
        };
        can_frame.ok_or_else(|| {
            BusError::Device(BusDeviceError::new(
                BusDeviceErrorKind::InvalidFrame,
                format!("Failed to create frame with ID 0x{:X}", frame.id),
            ))
        })
    }
}

/// 检查接口是否存在（`if_nametoindex`）
fn check_interface_exists(interface: &str) -> Result<(), BusError> {
    let c_iface = CString::new(interface).map_err(|e| {
        BusError::Device(BusDeviceError::new(
            BusDeviceErrorKind::UnsupportedConfig,
            format!("Invalid interface name: {}", e),
        ))
    })?;
    let ifindex = unsafe { libc::if_nametoindex(c_iface.as_ptr()) };
    if ifindex == 0 {
        return Err(BusError::Device(BusDeviceError::new(
            BusDeviceErrorKind::NotFound,
            format!(
                "CAN interface '{}' does not exist ({}). Please create it first:\n  sudo ip link add dev {} type can",
                interface,
                io::Error::last_os_error(),
                interface
            ),
        )));
    }
    Ok(())
}

impl Drop for SocketCanAdapter {
    fn drop(&mut self) {
        trace!("[Auto-Drop] SocketCAN interface '{}' closed", self.interface);
    }
}

impl CanAdapter for SocketCanAdapter {
    /// 发送帧（Fire-and-Forget）
    fn send(&mut self, frame: GaussFrame) -> Result<(), BusError> {
        let can_frame = Self::to_can_frame(&frame)?;
        self.socket.write_frame(&can_frame).map_err(BusError::Io)?;
        trace!("Sent CAN frame: ID=0x{:X}, len={}", frame.id, frame.len);
        Ok(())
    }

    /// 接收帧（阻塞直到收到有效数据帧或超时）
    ///
    /// 自动过滤错误帧和远程帧，只返回数据帧。
    fn receive(&mut self) -> Result<GaussFrame, BusError> {
        loop {
            let can_frame = match self.socket.read_frame() {
                Ok(frame) => frame,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Err(BusError::Timeout);
                },
                Err(e) => return Err(BusError::Io(e)),
            };

            match can_frame {
                CanFrame::Data(_) => {
                    let mut data = [0u8; 8];
                    let frame_data = can_frame.data();
                    let len = frame_data.len().min(8);
                    data[..len].copy_from_slice(&frame_data[..len]);
                    let frame = GaussFrame {
                        id: can_frame.raw_id(),
                        data,
                        len: len as u8,
                        is_extended: can_frame.is_extended(),
                        timestamp_us: 0,
                    };
                    trace!("Received CAN frame: ID=0x{:X}, len={}", frame.id, frame.len);
                    return Ok(frame);
                },
                CanFrame::Error(error_frame) => {
                    let socketcan_error = SocketCanError::from(error_frame);
                    if matches!(socketcan_error, SocketCanError::BusOff) {
                        error!("CAN Bus Off error detected on '{}'", self.interface);
                        return Err(BusError::BusOff);
                    }
                    warn!("CAN Error Frame received: {}, ignoring", socketcan_error);
                },
                CanFrame::Remote(_) => {
                    trace!("Ignoring remote frame");
                },
            }
        }
    }

    fn set_receive_timeout(&mut self, timeout: Duration) {
        if let Err(e) = self.set_read_timeout(timeout) {
            warn!("Failed to set receive timeout: {}", e);
        }
    }

    fn receive_timeout(&mut self, timeout: Duration) -> Result<GaussFrame, BusError> {
        let old_timeout = self.read_timeout;
        // SO_RCVTIMEO 为 0 表示无限阻塞
        self.set_read_timeout(timeout.max(Duration::from_micros(1)))?;
        let result = self.receive();
        let _ = self.set_read_timeout(old_timeout);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_interface_is_not_found() {
        match SocketCanAdapter::new("gauss_nope0") {
            Err(BusError::Device(e)) => {
                assert_eq!(e.kind, BusDeviceErrorKind::NotFound);
                assert!(e.is_fatal());
            },
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_invalid_interface_name() {
        assert!(matches!(
            SocketCanAdapter::new("bad\0name"),
            Err(BusError::Device(_))
        ));
    }

    #[test]
    fn test_to_can_frame_rejects_oversized_standard_id() {
        let frame = GaussFrame::new_standard(0x7FF, &[1]);
        assert!(SocketCanAdapter::to_can_frame(&frame).is_ok());
        let bad = GaussFrame {
            id: 0x800,
            ..frame
        };
        assert!(SocketCanAdapter::to_can_frame(&bad).is_err());
    }
}
