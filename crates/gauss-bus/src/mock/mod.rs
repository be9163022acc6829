//! 仿真硬件
//!
//! 两种仿真设备都是共享内部状态的 `Clone` 句柄：一份交给驱动（作为适配器），
//! 另一份留在测试里用来观察寄存器或模拟断线。
//!
//! ```
//! use gauss_bus::mock::SimulatedServoChain;
//! use gauss_protocol::MotorModel;
//!
//! let chain = SimulatedServoChain::new()
//!     .with_servo(2, MotorModel::Xl430)
//!     .with_servo(6, MotorModel::Xl320);
//! let handle = chain.clone();
//! handle.set_online(6, false);
//! assert!(!chain.is_online(6));
//! ```

mod servo_chain;
mod stepper_bus;

pub use servo_chain::SimulatedServoChain;
pub use stepper_bus::SimulatedStepperBus;
